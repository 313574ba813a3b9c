//! Worker Runtime (spec §4.7): wires the Cap Resolver, Lease Manager and
//! Shard Lifecycle Tracker behind one control loop, the same shape as
//! `automations::server::serve`'s poll-spawn-wait loop, and dispatches one
//! task per acquired shard to a caller-supplied `Processor`.

use crate::clock::Clock;
use crate::config::InitialPosition;
use crate::error::{Error, Result};
use crate::fleet::FleetProbe;
use crate::lease::{AcquireOutcome, Classification, LeaseManager, ObservedLease, RenewOutcome, TickInputs};
use crate::lifecycle::ShardLifecycleTracker;
use crate::model::{CapRow, RowId, WorkerRow};
use crate::processor::{Checkpointer, LeaseLost, ProcessorFactory, ShutdownReason};
use crate::store::{ExpectedCounter, PutOutcome, Store};
use crate::topology::TopologyProbe;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub struct RuntimeConfig {
    pub discovery_interval: std::time::Duration,
    pub heartbeat_interval: std::time::Duration,
    pub steal_batch: usize,
    pub steal_grace: std::time::Duration,
    pub store_timeout: std::time::Duration,
    pub probe_timeout: std::time::Duration,
    pub initial_position: InitialPosition,
}

struct HeldShard {
    lease: ObservedLease,
    shutdown_tx: tokio::sync::watch::Sender<Option<ShutdownReason>>,
    task: tokio::task::JoinHandle<()>,
}

/// Sends checkpoint/shard-end writes back to the control task's owned
/// `LeaseManager` over a channel rather than a shared lock (spec §5/§9
/// "global mutable state").
struct ChannelCheckpointer {
    shard_id: String,
    tx: tokio::sync::mpsc::Sender<CheckpointRequest>,
}

enum CheckpointRequest {
    Write {
        shard_id: String,
        cursor: String,
        reply: tokio::sync::oneshot::Sender<std::result::Result<(), LeaseLost>>,
    },
    ShardEnd {
        shard_id: String,
        reply: tokio::sync::oneshot::Sender<std::result::Result<(), LeaseLost>>,
    },
}

#[async_trait::async_trait]
impl Checkpointer for ChannelCheckpointer {
    async fn write(&self, cursor: String) -> std::result::Result<(), LeaseLost> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self
            .tx
            .send(CheckpointRequest::Write {
                shard_id: self.shard_id.clone(),
                cursor,
                reply,
            })
            .await
            .is_err()
        {
            return Err(LeaseLost(self.shard_id.clone()));
        }
        rx.await.unwrap_or(Err(LeaseLost(self.shard_id.clone())))
    }

    async fn write_shard_end(&self) -> std::result::Result<(), LeaseLost> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self
            .tx
            .send(CheckpointRequest::ShardEnd {
                shard_id: self.shard_id.clone(),
                reply,
            })
            .await
            .is_err()
        {
            return Err(LeaseLost(self.shard_id.clone()));
        }
        rx.await.unwrap_or(Err(LeaseLost(self.shard_id.clone())))
    }
}

pub struct WorkerRuntime<S, T, F, C> {
    store: Arc<S>,
    lease_mgr: Arc<LeaseManager<S, C>>,
    lifecycle: Arc<ShardLifecycleTracker<S, C>>,
    topology: Arc<T>,
    fleet: Arc<F>,
    cap_rx: tokio::sync::watch::Receiver<Option<CapRow>>,
    clock: Arc<C>,
    processor_factory: Arc<dyn ProcessorFactory>,
    config: RuntimeConfig,
    held: HashMap<String, HeldShard>,
    checkpoint_tx: tokio::sync::mpsc::Sender<CheckpointRequest>,
    checkpoint_rx: tokio::sync::mpsc::Receiver<CheckpointRequest>,
}

impl<S, T, F, C> WorkerRuntime<S, T, F, C>
where
    S: Store,
    T: TopologyProbe,
    F: FleetProbe,
    C: Clock,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        lease_mgr: Arc<LeaseManager<S, C>>,
        lifecycle: Arc<ShardLifecycleTracker<S, C>>,
        topology: Arc<T>,
        fleet: Arc<F>,
        cap_rx: tokio::sync::watch::Receiver<Option<CapRow>>,
        clock: Arc<C>,
        processor_factory: Arc<dyn ProcessorFactory>,
        config: RuntimeConfig,
    ) -> Self {
        let (checkpoint_tx, checkpoint_rx) = tokio::sync::mpsc::channel(64);
        Self {
            store,
            lease_mgr,
            lifecycle,
            topology,
            fleet,
            cap_rx,
            clock,
            processor_factory,
            config,
            held: HashMap::new(),
            checkpoint_tx,
            checkpoint_rx,
        }
    }

    /// Upserts this worker's row (spec §3: "created on worker start;
    /// refreshed periodically"), informational only — no code path reads
    /// it back authoritatively, so a `Conflict` from a racing write of our
    /// own is not an error.
    async fn publish_worker_row(&self) {
        if let Err(err) = self.write_worker_row().await {
            tracing::warn!(?err, "failed to publish worker row");
        }
    }

    async fn write_worker_row(&self) -> Result<()> {
        let row_id = RowId::worker(self.lease_mgr.worker_id());
        let existing = crate::store::call(self.config.store_timeout, || self.store.get(&row_id)).await?;
        let expected = match &existing {
            Some(stored) => ExpectedCounter::Is(stored.counter),
            None => ExpectedCounter::Absent,
        };
        let row = WorkerRow {
            worker_id: self.lease_mgr.worker_id().to_string(),
            max_leases: self.cap_rx.borrow().as_ref().map(|cap| cap.max_leases).unwrap_or(0),
            shard_count: self.held.len() as u32,
            worker_count: 1,
            updated_at: self.clock.now_wall(),
        };
        let payload = serde_json::to_value(&row)
            .map_err(|err| Error::InvariantViolation(format!("failed to encode worker row: {err}")))?;

        match crate::store::call(self.config.store_timeout, || {
            self.store.conditional_put(&row_id, expected, payload.clone())
        })
        .await?
        {
            PutOutcome::Written(_) | PutOutcome::Conflict => Ok(()), // A peer's concurrent refresh also satisfies this tick.
        }
    }

    /// Runs the control loop until `shutdown` resolves, then releases every
    /// held lease (not SHARD_END — spec §4.7) and waits for processor tasks
    /// to observe the signal before returning.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        self.publish_worker_row().await;

        let mut discovery_ticker = tokio::time::interval(self.config.discovery_interval);
        let mut heartbeat_ticker = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = discovery_ticker.tick() => {
                    if let Err(err) = self.discovery_tick().await {
                        tracing::error!(?err, "discovery tick failed");
                    }
                }
                _ = heartbeat_ticker.tick() => {
                    self.heartbeat_tick().await;
                }
                Some(req) = self.checkpoint_rx.recv() => {
                    self.handle_checkpoint_request(req).await;
                }
                () = &mut shutdown => break,
            }
        }

        self.shutdown().await;
    }

    #[tracing::instrument(skip(self))]
    async fn discovery_tick(&mut self) -> Result<()> {
        let open_shards = crate::error::with_deadline(
            self.config.probe_timeout,
            |msg| Error::ProbeUnavailable(anyhow::anyhow!(msg)),
            self.topology.list_open_shards(),
        )
        .await?;
        self.lifecycle.sync_new_shards(&open_shards).await?;

        let observed = self.lease_mgr.discover().await?;
        let cap = self.cap_rx.borrow().clone();
        let Some(cap) = cap else {
            tracing::debug!("no cap published yet; skipping acquisition this tick");
            return Ok(());
        };

        // I4: a child is ineligible while its parent's lease row exists and
        // has not yet reached SHARD_END.
        let parent_not_ready: HashSet<String> = observed
            .iter()
            .filter_map(|lease| {
                let parent_id = lease.row.parent_shard_id.as_ref()?;
                let parent = observed.iter().find(|p| &p.row.shard_id == parent_id)?;
                (!parent.row.is_terminal()).then(|| lease.row.shard_id.clone())
            })
            .collect();

        let worker_count = crate::error::with_deadline(
            self.config.probe_timeout,
            |msg| Error::ProbeUnavailable(anyhow::anyhow!(msg)),
            self.fleet.worker_count(),
        )
        .await
        .unwrap_or(1);
        let classified: Vec<(ObservedLease, Classification)> = observed
            .iter()
            .map(|lease| (lease.clone(), self.lease_mgr.classify(lease)))
            .collect();

        let plan = crate::lease::plan_tick(TickInputs {
            worker_id: self.lease_mgr.worker_id(),
            cap: cap.max_leases,
            worker_count,
            open_shard_count: open_shards.len() as u32,
            steal_batch: self.config.steal_batch,
            steal_grace: chrono::Duration::from_std(self.config.steal_grace).unwrap_or(chrono::Duration::zero()),
            now: self.clock.now_wall(),
            rows: &classified,
            parent_not_ready: &parent_not_ready,
        });

        for shard_id in plan.acquire.iter().chain(plan.steal.iter()) {
            let Some((lease, _)) = classified.iter().find(|(l, _)| &l.row.shard_id == shard_id) else {
                continue;
            };
            let parent = lease
                .row
                .parent_shard_id
                .as_ref()
                .and_then(|pid| observed.iter().find(|p| &p.row.shard_id == pid));

            match self.lease_mgr.try_acquire(lease, parent).await? {
                AcquireOutcome::Acquired => {
                    let mut acquired = lease.clone();
                    acquired.counter += 1; // see conditional_put's `expected + 1` contract
                    acquired.row.owner = Some(self.lease_mgr.worker_id().to_string());
                    self.spawn_processor(acquired);
                }
                AcquireOutcome::LostRace | AcquireOutcome::Ineligible => {
                    tracing::debug!(shard_id = %shard_id, "acquisition attempt did not succeed this tick");
                }
            }
        }

        for shard_id in &plan.release {
            if let Some(held) = self.held.remove(shard_id) {
                self.stop_processor(held, ShutdownReason::Requested).await;
                if let Some((lease, _)) = classified.iter().find(|(l, _)| &l.row.shard_id == shard_id) {
                    let _ = self.lease_mgr.release(lease).await;
                }
            }
        }

        Ok(())
    }

    async fn heartbeat_tick(&mut self) {
        self.publish_worker_row().await;

        let shard_ids: Vec<String> = self.held.keys().cloned().collect();
        for shard_id in shard_ids {
            let lease = self.held.get(&shard_id).unwrap().lease.clone();
            match self.lease_mgr.renew(&lease).await {
                Ok(RenewOutcome::Renewed) => {
                    // A successful `ExpectedCounter::Is` write always lands
                    // at `expected + 1` (store::Store::conditional_put's
                    // contract); track it locally to avoid re-reading.
                    if let Some(held) = self.held.get_mut(&shard_id) {
                        held.lease.counter += 1;
                        held.lease.row.heartbeat_at = self.clock.now_wall();
                    }
                }
                Ok(RenewOutcome::Lost) => {
                    if let Some(held) = self.held.remove(&shard_id) {
                        self.stop_processor(held, ShutdownReason::Stolen).await;
                    }
                }
                Err(err) => tracing::warn!(shard_id = %shard_id, ?err, "heartbeat renewal failed (will retry)"),
            }
        }
    }

    async fn handle_checkpoint_request(&mut self, req: CheckpointRequest) {
        match req {
            CheckpointRequest::Write { shard_id, cursor, reply } => {
                let result = self.apply_write(&shard_id, cursor).await;
                let _ = reply.send(result);
            }
            CheckpointRequest::ShardEnd { shard_id, reply } => {
                let result = self.apply_shard_end(&shard_id).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn apply_write(&mut self, shard_id: &str, cursor: String) -> std::result::Result<(), LeaseLost> {
        let Some(held) = self.held.get(shard_id) else {
            return Err(LeaseLost(shard_id.to_string()));
        };
        let lease = held.lease.clone();
        match self.lease_mgr.checkpoint(&lease, cursor).await {
            Ok(crate::lease::WriteOutcome::Ok) => {
                if let Some(held) = self.held.get_mut(shard_id) {
                    held.lease.counter += 1;
                    held.lease.row.owner_switches_since_checkpoint = 0;
                }
                Ok(())
            }
            Ok(crate::lease::WriteOutcome::Lost) | Err(_) => {
                if let Some(held) = self.held.remove(shard_id) {
                    self.stop_processor(held, ShutdownReason::Stolen).await;
                }
                Err(LeaseLost(shard_id.to_string()))
            }
        }
    }

    async fn apply_shard_end(&mut self, shard_id: &str) -> std::result::Result<(), LeaseLost> {
        let Some(held) = self.held.remove(shard_id) else {
            return Err(LeaseLost(shard_id.to_string()));
        };
        let result = match self.lease_mgr.mark_shard_end(&held.lease).await {
            Ok(crate::lease::WriteOutcome::Ok) => Ok(()),
            _ => Err(LeaseLost(shard_id.to_string())),
        };
        self.stop_processor(held, ShutdownReason::ShardEnd).await;
        result
    }

    fn spawn_processor(&mut self, lease: ObservedLease) {
        let shard_id = lease.row.shard_id.clone();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(None);
        let mut processor = self.processor_factory.create_processor(&shard_id);
        let checkpointer = ChannelCheckpointer {
            shard_id: shard_id.clone(),
            tx: self.checkpoint_tx.clone(),
        };
        let initial_cursor = match &lease.row.checkpoint {
            crate::model::Checkpoint::At(cursor) => Some(cursor.clone()),
            _ => Some(self.config.initial_position.cursor_hint().to_string()),
        };
        let shard_id_for_task = shard_id.clone();

        let task = tokio::spawn(async move {
            processor.on_initialize(&shard_id_for_task, initial_cursor).await;
            let empty_batch: [u8; 0] = [];
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if let Some(reason) = *shutdown_rx.borrow() {
                            processor.on_shutdown(reason).await;
                            return;
                        }
                    }
                    // Record fetching against the upstream stream service is
                    // out of scope here (spec §1); this placeholder drives
                    // the processor contract end to end for tests/demos.
                    _ = tokio::time::sleep(std::time::Duration::from_secs(3600)) => {
                        let _ = processor.on_records(&empty_batch, &checkpointer).await;
                    }
                }
            }
        });

        self.held.insert(
            shard_id,
            HeldShard {
                lease,
                shutdown_tx,
                task,
            },
        );
    }

    async fn stop_processor(&self, held: HeldShard, reason: ShutdownReason) {
        let _ = held.shutdown_tx.send(Some(reason));
        let _ = held.task.await;
    }

    async fn shutdown(mut self) {
        let shard_ids: Vec<String> = self.held.keys().cloned().collect();
        for shard_id in shard_ids {
            if let Some(held) = self.held.remove(&shard_id) {
                let lease = held.lease.clone();
                self.stop_processor(held, ShutdownReason::Requested).await;
                let _ = self.lease_mgr.release(&lease).await;
            }
        }
    }
}
