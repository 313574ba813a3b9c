//! Shard Lifecycle Tracker (spec §4.6): bridges Topology Probe output to
//! Lease Store rows — creates leases for new shards, and retires leases
//! once drained and no longer referenced by a non-terminal child.

use crate::clock::Clock;
use crate::error::Result;
use crate::model::{Checkpoint, LeaseRow, RowId};
use crate::store::{ExpectedCounter, PutOutcome, Store};
use crate::topology::OpenShard;
use std::collections::HashSet;
use std::sync::Arc;

pub struct ShardLifecycleTracker<S, C> {
    store: Arc<S>,
    clock: Arc<C>,
    retention: chrono::Duration,
    store_timeout: std::time::Duration,
}

impl<S, C> ShardLifecycleTracker<S, C>
where
    S: Store,
    C: Clock,
{
    pub fn new(store: Arc<S>, clock: Arc<C>, retention: std::time::Duration) -> Self {
        Self {
            store,
            clock,
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
            store_timeout: crate::store::DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Overrides the per-operation store timeout (spec §5; default
    /// `store::DEFAULT_STORE_TIMEOUT`).
    pub fn with_store_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// For each open shard not yet present as a lease row, creates one
    /// with `owner=absent`, `checkpoint=absent`, and the reported parent.
    /// A `conditional_put(Absent)` conflict means a peer already created
    /// it — not an error (spec §4.6).
    pub async fn sync_new_shards(&self, open_shards: &[OpenShard]) -> Result<usize> {
        let mut created = 0;
        for shard in open_shards {
            let row_id = RowId::lease(&shard.shard_id);
            if crate::store::call(self.store_timeout, || self.store.get(&row_id)).await?.is_some() {
                continue;
            }

            if self.would_create_cycle(&shard.shard_id, &shard.parent_shard_id).await? {
                tracing::error!(
                    shard_id = %shard.shard_id,
                    "refusing to create lease that would introduce a parent/child cycle"
                );
                continue;
            }

            let row = LeaseRow::new_unowned(
                shard.shard_id.clone(),
                shard.parent_shard_id.clone(),
                self.clock.now_wall(),
            );
            let payload = serde_json::to_value(&row).map_err(|err| {
                crate::error::Error::InvariantViolation(format!("failed to encode new lease row: {err}"))
            })?;

            match crate::store::call(self.store_timeout, || {
                self.store.conditional_put(&row_id, ExpectedCounter::Absent, payload.clone())
            })
            .await?
            {
                PutOutcome::Written(_) => created += 1,
                PutOutcome::Conflict => (), // A peer created it first.
            }
        }
        Ok(created)
    }

    /// The parent→child lease graph is a forest in normal operation
    /// (spec §9); walk the proposed parent chain to refuse a cycle before
    /// it's created.
    async fn would_create_cycle(&self, shard_id: &str, parent_shard_id: &Option<String>) -> Result<bool> {
        let mut seen = HashSet::new();
        seen.insert(shard_id.to_string());

        let mut current = parent_shard_id.clone();
        while let Some(parent_id) = current {
            if seen.contains(&parent_id) {
                return Ok(true);
            }
            seen.insert(parent_id.clone());

            let Some(stored) = crate::store::call(self.store_timeout, || self.store.get(&RowId::lease(&parent_id))).await? else {
                break;
            };
            let row: LeaseRow = stored.decode()?;
            current = row.parent_shard_id;
        }
        Ok(false)
    }

    /// Retirement sweep (spec §4.6, suggested hourly): deletes lease rows
    /// that are terminal, referenced by no non-terminal child, and older
    /// than the retention window.
    pub async fn retire_drained(&self) -> Result<usize> {
        let rows = crate::store::call(self.store_timeout, || self.store.scan("lease/")).await?;
        let mut by_shard = std::collections::HashMap::new();
        let mut decoded = Vec::with_capacity(rows.len());
        for stored in rows {
            let row: LeaseRow = stored.decode()?;
            by_shard.insert(row.shard_id.clone(), row.clone());
            decoded.push((row, stored.counter));
        }

        let referenced_as_parent: HashSet<String> = decoded
            .iter()
            .filter(|(row, _)| !row.is_terminal())
            .filter_map(|(row, _)| row.parent_shard_id.clone())
            .collect();

        let now = self.clock.now_wall();
        let mut retired = 0;
        for (row, counter) in decoded {
            if !row.is_terminal() {
                continue;
            }
            if referenced_as_parent.contains(&row.shard_id) {
                continue; // Still cited by a live child; keep for I4 lookups.
            }
            if now - row.heartbeat_at < self.retention {
                continue;
            }

            match crate::store::call(self.store_timeout, || self.store.delete(&RowId::lease(&row.shard_id), counter)).await? {
                PutOutcome::Written(_) => retired += 1,
                PutOutcome::Conflict => (), // Row changed concurrently; next sweep will retry.
            }
        }
        Ok(retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::memory::InMemoryStore;

    fn tracker() -> ShardLifecycleTracker<InMemoryStore, ManualClock> {
        ShardLifecycleTracker::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ManualClock::new(chrono::Utc::now())),
            std::time::Duration::from_secs(24 * 3600),
        )
    }

    #[tokio::test]
    async fn creates_lease_rows_for_new_shards() {
        let tracker = tracker();
        let shards = vec![
            OpenShard { shard_id: "s-1".into(), parent_shard_id: None },
            OpenShard { shard_id: "s-2".into(), parent_shard_id: Some("s-1".into()) },
        ];
        assert_eq!(tracker.sync_new_shards(&shards).await.unwrap(), 2);
        // Idempotent: a second sync creates nothing new.
        assert_eq!(tracker.sync_new_shards(&shards).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retains_terminal_parent_while_child_is_live() {
        let tracker = tracker();
        let shards = vec![
            OpenShard { shard_id: "parent".into(), parent_shard_id: None },
            OpenShard { shard_id: "child".into(), parent_shard_id: Some("parent".into()) },
        ];
        tracker.sync_new_shards(&shards).await.unwrap();

        let stored = tracker.store.get(&RowId::lease("parent")).await.unwrap().unwrap();
        let mut row: LeaseRow = stored.decode().unwrap();
        row.checkpoint = Checkpoint::ShardEnd;
        row.owner = None;
        tracker
            .store
            .conditional_put(
                &RowId::lease("parent"),
                ExpectedCounter::Is(stored.counter),
                serde_json::to_value(&row).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(tracker.retire_drained().await.unwrap(), 0);
        assert!(tracker.store.get(&RowId::lease("parent")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retires_terminal_orphan_past_retention() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let tracker = ShardLifecycleTracker::new(
            Arc::new(InMemoryStore::new()),
            clock.clone(),
            std::time::Duration::from_secs(3600),
        );
        let shards = vec![OpenShard { shard_id: "s-1".into(), parent_shard_id: None }];
        tracker.sync_new_shards(&shards).await.unwrap();

        let stored = tracker.store.get(&RowId::lease("s-1")).await.unwrap().unwrap();
        let mut row: LeaseRow = stored.decode().unwrap();
        row.checkpoint = Checkpoint::ShardEnd;
        tracker
            .store
            .conditional_put(
                &RowId::lease("s-1"),
                ExpectedCounter::Is(stored.counter),
                serde_json::to_value(&row).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(tracker.retire_drained().await.unwrap(), 0); // Too fresh.
        clock.advance(chrono::Duration::seconds(3601));
        assert_eq!(tracker.retire_drained().await.unwrap(), 1);
    }
}
