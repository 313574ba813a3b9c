//! Dynamic shard-lease coordinator: durable, single-owner leases over a
//! shard topology that splits and merges underneath a fleet of
//! stream-processing workers whose size is unknown to any individual
//! worker. See `SPEC_FULL.md` for the full module breakdown.

pub mod cap;
pub mod clock;
pub mod config;
pub mod error;
pub mod fleet;
pub mod lease;
pub mod lifecycle;
pub mod model;
pub mod processor;
pub mod runtime;
pub mod store;
pub mod topology;

use clock::SystemClock;
use config::Config;
use error::Result;
use fleet::FleetProbe;
use processor::ProcessorFactory;
use std::sync::Arc;
use topology::TopologyProbe;

/// Wires every component per the Worker Runtime's control loop (spec §4.7)
/// and runs until `shutdown` resolves. Generic over the `Store` and over
/// the caller-supplied `TopologyProbe`/`FleetProbe`/`ProcessorFactory`,
/// since topology, fleet size, and record processing are externally-owned
/// concerns (spec §1).
pub async fn run<S, T, F>(
    store: Arc<S>,
    topology: Arc<T>,
    fleet: Arc<F>,
    processor_factory: Arc<dyn ProcessorFactory>,
    config: Config,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()>
where
    S: store::Store,
    T: TopologyProbe,
    F: FleetProbe,
{
    let clock = Arc::new(SystemClock);
    let worker_id = config.resolve_worker_id();

    let cap_resolver = Arc::new(
        cap::CapResolver::new(
            store.clone(),
            topology.clone(),
            fleet.clone(),
            clock.clone(),
            config.app_name.clone(),
            config.hard_cap,
        )
        .with_store_timeout(config.store_timeout)
        .with_probe_timeout(config.probe_timeout),
    );
    let cap_rx = cap_resolver.subscribe();

    let lease_mgr = Arc::new(
        lease::LeaseManager::new(store.clone(), clock.clone(), worker_id.clone(), config.failover_timeout)
            .with_store_timeout(config.store_timeout),
    );
    let lifecycle = Arc::new(
        lifecycle::ShardLifecycleTracker::new(store.clone(), clock.clone(), config.retention)
            .with_store_timeout(config.store_timeout),
    );

    let runtime = runtime::WorkerRuntime::new(
        store.clone(),
        lease_mgr,
        lifecycle.clone(),
        topology.clone(),
        fleet.clone(),
        cap_rx,
        clock.clone(),
        processor_factory,
        runtime::RuntimeConfig {
            discovery_interval: config.discovery_interval,
            heartbeat_interval: config.heartbeat_interval,
            steal_batch: config.steal_batch,
            steal_grace: config.steal_grace,
            store_timeout: config.store_timeout,
            probe_timeout: config.probe_timeout,
            initial_position: config.initial_position,
        },
    );

    let (shutdown_tx, _) = tokio::sync::watch::channel(false);
    let cap_shutdown = {
        let mut rx = shutdown_tx.subscribe();
        async move {
            let _ = rx.changed().await;
        }
    };
    let retirement_shutdown = {
        let mut rx = shutdown_tx.subscribe();
        async move {
            let _ = rx.changed().await;
        }
    };

    tokio::pin!(shutdown);
    let cap_task = tokio::spawn({
        let cap_resolver = cap_resolver.clone();
        let interval = config.cap_refresh_interval;
        async move { cap_resolver.run(interval, cap_shutdown).await }
    });
    let retirement_task = tokio::spawn({
        let interval = config.retirement_interval;
        async move {
            let mut ticker = tokio::time::interval(interval);
            tokio::pin!(retirement_shutdown);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = lifecycle.retire_drained().await {
                            tracing::error!(?err, "retirement sweep failed");
                        }
                    }
                    () = &mut retirement_shutdown => return,
                }
            }
        }
    });

    runtime.run(shutdown).await;
    let _ = shutdown_tx.send(true);
    let _ = cap_task.await;
    let _ = retirement_task.await;

    Ok(())
}
