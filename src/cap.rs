//! Cap Resolver (spec §4.4): computes and publishes `max_leases_per_worker`
//! without a permanent leader — "the coordinator row is simply the most
//! recent conditional writer" (spec §9). Modeled as a periodic task the
//! same shape as `automations::server::serve`'s poll loop: do one eager
//! pass at construction, then tick on an interval until told to stop.

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::fleet::FleetProbe;
use crate::model::{CapRow, RowId};
use crate::store::{ExpectedCounter, PutOutcome, Store};
use crate::topology::TopologyProbe;
use std::sync::Arc;

/// HARD_CAP protects a single worker from being asked to process a
/// pathological fraction of shards during rapid scale-down (spec §4.4).
/// The exact value is left as an open question across source variants
/// (10 / 30 / 80); this implementation defaults to 80 and makes it a
/// `Config` override (DESIGN.md).
pub const DEFAULT_HARD_CAP: u32 = 80;

fn compute_max_leases(hard_cap: u32, shard_count: u32, worker_count: u32) -> u32 {
    let worker_count = worker_count.max(1);
    let quota = (shard_count + worker_count - 1) / worker_count;
    quota.min(hard_cap)
}

pub struct CapResolver<S, T, F, C> {
    store: Arc<S>,
    topology: Arc<T>,
    fleet: Arc<F>,
    clock: Arc<C>,
    app_name: String,
    hard_cap: u32,
    store_timeout: std::time::Duration,
    probe_timeout: std::time::Duration,
    published: tokio::sync::watch::Sender<Option<CapRow>>,
}

impl<S, T, F, C> CapResolver<S, T, F, C>
where
    S: Store,
    T: TopologyProbe,
    F: FleetProbe,
    C: Clock,
{
    pub fn new(store: Arc<S>, topology: Arc<T>, fleet: Arc<F>, clock: Arc<C>, app_name: String, hard_cap: u32) -> Self {
        let (published, _) = tokio::sync::watch::channel(None);
        Self {
            store,
            topology,
            fleet,
            clock,
            app_name,
            hard_cap,
            store_timeout: crate::store::DEFAULT_STORE_TIMEOUT,
            probe_timeout: crate::error::DEFAULT_PROBE_TIMEOUT,
            published,
        }
    }

    /// Overrides the per-operation store timeout (spec §5; default
    /// `store::DEFAULT_STORE_TIMEOUT`).
    pub fn with_store_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Overrides the per-operation Topology/Fleet probe timeout (spec §5;
    /// default `error::DEFAULT_PROBE_TIMEOUT`).
    pub fn with_probe_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// A race-free shared record of the latest published cap, readable by
    /// the Lease Manager without re-hitting the store on every tick.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Option<CapRow>> {
        self.published.subscribe()
    }

    /// Performs the five steps of spec §4.4 and publishes the result to
    /// `subscribe()`'s watch channel.
    pub async fn refresh(&self) -> Result<CapRow> {
        let shard_count = crate::error::with_deadline(
            self.probe_timeout,
            |msg| Error::ProbeUnavailable(anyhow::anyhow!(msg)),
            self.topology.list_open_shards(),
        )
        .await?
        .len() as u32;
        let worker_count = crate::error::with_deadline(
            self.probe_timeout,
            |msg| Error::ProbeUnavailable(anyhow::anyhow!(msg)),
            self.fleet.worker_count(),
        )
        .await?;
        let row_id = RowId::cap(&self.app_name);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let existing = crate::store::call(self.store_timeout, || self.store.get(&row_id)).await?;

            let resolved = match existing {
                None => {
                    // Step 3: absent, compute and attempt to create.
                    let max_leases = compute_max_leases(self.hard_cap, shard_count, worker_count);
                    let row = CapRow {
                        max_leases,
                        shard_count,
                        worker_count,
                        updated_at: self.clock.now_wall(),
                    };
                    let payload = serde_json::to_value(&row).unwrap();
                    match crate::store::call(self.store_timeout, || {
                        self.store.conditional_put(&row_id, ExpectedCounter::Absent, payload.clone())
                    })
                    .await?
                    {
                        PutOutcome::Written(_) => Some(row),
                        PutOutcome::Conflict => None, // Another worker won; re-read.
                    }
                }
                Some(stored) => {
                    let current: CapRow = stored.decode()?;
                    if current.shard_count == shard_count && current.worker_count == worker_count {
                        // Step 4: stable epoch, adopt as-is.
                        Some(current)
                    } else {
                        // Step 5: recompute and try to install, predicated
                        // on the stored counter (our observed epoch).
                        let max_leases = compute_max_leases(self.hard_cap, shard_count, worker_count);
                        let row = CapRow {
                            max_leases,
                            shard_count,
                            worker_count,
                            updated_at: self.clock.now_wall(),
                        };
                        let payload = serde_json::to_value(&row).unwrap();
                        match crate::store::call(self.store_timeout, || {
                            self.store.conditional_put(&row_id, ExpectedCounter::Is(stored.counter), payload.clone())
                        })
                        .await?
                        {
                            PutOutcome::Written(_) => Some(row),
                            // Someone installed a fresher value; the winner
                            // already reflects the latest observation, so
                            // we re-read and adopt without recomputing.
                            PutOutcome::Conflict => None,
                        }
                    }
                }
            };

            if let Some(row) = resolved {
                let _ = self.published.send(Some(row));
                return Ok(row);
            }

            if attempt >= 8 {
                // Pathological thrash guard; surface rather than spin.
                return Err(crate::error::Error::TransientStore(anyhow::anyhow!(
                    "cap row for {} did not converge after {attempt} attempts",
                    self.app_name
                )));
            }
        }
    }

    /// Runs `refresh` immediately, then on every tick of `interval`, until
    /// `shutdown` resolves.
    pub async fn run(&self, interval: std::time::Duration, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        if let Err(err) = self.refresh().await {
            tracing::error!(?err, "initial cap resolution failed");
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Discard immediate first tick (already refreshed above).

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh().await {
                        tracing::error!(?err, "cap refresh failed (will retry next tick)");
                    }
                }
                () = &mut shutdown => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_formula_matches_spec_i6() {
        // Scenario 1: shard_count=30, worker_count=3, HARD_CAP=80 => 10.
        assert_eq!(compute_max_leases(80, 30, 3), 10);
        // Scenario 2: shard_count=300, worker_count=3, HARD_CAP=80 => 80.
        assert_eq!(compute_max_leases(80, 300, 3), 80);
        // Scenario 3: shard_count=60, worker_count=3, HARD_CAP=80 => 20.
        assert_eq!(compute_max_leases(80, 60, 3), 20);
        // Scenario 4: shard_count=30, worker_count=5, HARD_CAP=80 => 6.
        assert_eq!(compute_max_leases(80, 30, 5), 6);
    }

    #[test]
    fn worker_count_floor_is_one() {
        assert_eq!(compute_max_leases(80, 10, 0), 10);
    }
}
