//! Pure acquisition/stealing arithmetic (spec §4.5 "Acquisition loop"),
//! factored out of `LeaseManager` so the target/quota/steal decisions are
//! unit-testable without a `Store` or `Clock`.

use super::{Classification, ObservedLease};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionPlan {
    /// Shard ids this worker should attempt `try_acquire` on this tick,
    /// bounded by `min(quota - held, STEAL_BATCH)` (spec §4.5).
    pub acquire: Vec<String>,
    /// At most one foreign-live shard id to attempt stealing from the
    /// most over-quota peer, if no free/expired lease was available.
    pub steal: Option<String>,
    /// Shard ids this worker should voluntarily release because it holds
    /// more than the published cap.
    pub release: Vec<String>,
}

/// Inputs needed to plan one discovery tick. `now`/`failover_timeout` are
/// folded into the caller-supplied `Classification`s (via
/// `LeaseManager::classify`) so this function stays clock-free.
pub struct TickInputs<'a> {
    pub worker_id: &'a str,
    pub cap: u32,
    pub worker_count: u32,
    pub open_shard_count: u32,
    pub steal_batch: usize,
    pub steal_grace: chrono::Duration,
    pub now: chrono::DateTime<chrono::Utc>,
    /// Every currently-known lease row, paired with its classification
    /// relative to `worker_id` and, for rows with a parent, whether that
    /// parent is itself terminal-or-absent (eligibility per I4).
    pub rows: &'a [(ObservedLease, Classification)],
    /// Shard ids whose parent lease exists and is not yet `SHARD_END`
    /// (spec I4) — these are never eligible no matter their classification.
    pub parent_not_ready: &'a std::collections::HashSet<String>,
}

pub fn plan_tick(inputs: TickInputs<'_>) -> AcquisitionPlan {
    let TickInputs {
        worker_id,
        cap,
        worker_count,
        open_shard_count,
        steal_batch,
        steal_grace,
        now,
        rows,
        parent_not_ready,
    } = inputs;

    let worker_count = worker_count.max(1);
    let fair_share = (open_shard_count + worker_count - 1) / worker_count;
    let quota = cap.min(fair_share);

    let held: Vec<&ObservedLease> = rows
        .iter()
        .filter(|(_, c)| *c == Classification::Mine)
        .map(|(lease, _)| lease)
        .collect();
    let held_count = held.len() as u32;

    let mut plan = AcquisitionPlan::default();

    if held_count > cap {
        plan.release.push(pick_release_candidate(&held));
    }

    if held_count < quota {
        let mut eligible: Vec<&ObservedLease> = rows
            .iter()
            .filter(|(lease, c)| {
                matches!(c, Classification::Free | Classification::ForeignExpired)
                    && !parent_not_ready.contains(&lease.row.shard_id)
            })
            .map(|(lease, _)| lease)
            .collect();
        // Deterministic tie-break ordering; actual winner-take-all is
        // resolved by the store's optimistic concurrency (spec §4.5).
        eligible.sort_by(|a, b| a.row.shard_id.cmp(&b.row.shard_id));

        let budget = ((quota - held_count) as usize).min(steal_batch.max(1));
        if !eligible.is_empty() {
            plan.acquire = eligible
                .into_iter()
                .take(budget)
                .map(|lease| lease.row.shard_id.clone())
                .collect();
        } else {
            plan.steal = pick_steal_candidate(worker_id, quota, steal_grace, now, rows, parent_not_ready);
        }
    }

    plan
}

/// Among this worker's non-terminal held leases, prefer one whose most
/// recent checkpoint hasn't seen an owner switch since (i.e. its progress
/// is stable and idempotent to hand off); fall back to the longest-idle
/// held lease if none qualify.
fn pick_release_candidate(held: &[&ObservedLease]) -> String {
    let mut idempotent: Vec<&&ObservedLease> = held
        .iter()
        .filter(|lease| lease.row.owner_switches_since_checkpoint == 0)
        .collect();
    idempotent.sort_by_key(|lease| lease.row.heartbeat_at);

    if let Some(lease) = idempotent.first() {
        return lease.row.shard_id.clone();
    }

    held.iter()
        .min_by_key(|lease| lease.row.heartbeat_at)
        .map(|lease| lease.row.shard_id.clone())
        .unwrap_or_default()
}

/// Selects a foreign-live lease from the worker holding the most leases
/// whose count exceeds `quota` by the widest margin, provided its
/// heartbeat is older than `steal_grace` (spec §4.5).
fn pick_steal_candidate(
    worker_id: &str,
    quota: u32,
    steal_grace: chrono::Duration,
    now: chrono::DateTime<chrono::Utc>,
    rows: &[(ObservedLease, Classification)],
    parent_not_ready: &std::collections::HashSet<String>,
) -> Option<String> {
    let mut by_owner: HashMap<&str, Vec<&ObservedLease>> = HashMap::new();
    for (lease, classification) in rows {
        if matches!(classification, Classification::ForeignLive) {
            if let Some(owner) = lease.row.owner.as_deref() {
                if owner != worker_id {
                    by_owner.entry(owner).or_default().push(lease);
                }
            }
        }
    }

    let (_, over_quota_leases) = by_owner
        .into_iter()
        .filter(|(_, leases)| leases.len() as u32 > quota)
        .max_by_key(|(_, leases)| leases.len() as u32 - quota)?;

    over_quota_leases
        .into_iter()
        .filter(|lease| !parent_not_ready.contains(&lease.row.shard_id))
        .filter(|lease| now - lease.row.heartbeat_at > steal_grace)
        .min_by_key(|lease| lease.row.heartbeat_at)
        .map(|lease| lease.row.shard_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LeaseRow;

    fn lease(shard_id: &str, owner: Option<&str>, age_secs: i64) -> (ObservedLease, Classification) {
        let now = chrono::Utc::now();
        let row = LeaseRow {
            shard_id: shard_id.to_string(),
            parent_shard_id: None,
            owner: owner.map(str::to_string),
            heartbeat_at: now - chrono::Duration::seconds(age_secs),
            checkpoint: crate::model::Checkpoint::TrimHorizon,
            owner_switches_since_checkpoint: 0,
        };
        let classification = match owner {
            None => Classification::Free,
            Some("self") => Classification::Mine,
            Some(_) => Classification::ForeignLive,
        };
        (ObservedLease { row, counter: 1 }, classification)
    }

    #[test]
    fn acquires_free_leases_up_to_quota() {
        let rows = vec![lease("s-1", None, 0), lease("s-2", None, 0), lease("s-3", None, 0)];
        let parent_not_ready = Default::default();
        let plan = plan_tick(TickInputs {
            worker_id: "self",
            cap: 80,
            worker_count: 3,
            open_shard_count: 30, // quota = 10
            steal_batch: 2,
            steal_grace: chrono::Duration::seconds(20),
            now: chrono::Utc::now(),
            rows: &rows,
            parent_not_ready: &parent_not_ready,
        });
        assert_eq!(plan.acquire.len(), 2); // bounded by steal_batch
        assert!(plan.steal.is_none());
        assert!(plan.release.is_empty());
    }

    #[test]
    fn steals_from_over_quota_peer_past_grace() {
        let rows = vec![
            lease("s-1", Some("peer"), 100),
            lease("s-2", Some("peer"), 100),
            lease("s-3", Some("peer"), 100),
        ];
        let parent_not_ready = Default::default();
        let plan = plan_tick(TickInputs {
            worker_id: "self",
            cap: 80,
            worker_count: 2,
            open_shard_count: 3, // quota = 2, peer holds 3 > 2
            steal_batch: 1,
            steal_grace: chrono::Duration::seconds(20),
            now: chrono::Utc::now(),
            rows: &rows,
            parent_not_ready: &parent_not_ready,
        });
        assert!(plan.acquire.is_empty());
        assert!(plan.steal.is_some());
    }

    #[test]
    fn does_not_steal_within_grace_period() {
        let rows = vec![
            lease("s-1", Some("peer"), 1),
            lease("s-2", Some("peer"), 1),
            lease("s-3", Some("peer"), 1),
        ];
        let parent_not_ready = Default::default();
        let plan = plan_tick(TickInputs {
            worker_id: "self",
            cap: 80,
            worker_count: 2,
            open_shard_count: 3,
            steal_batch: 1,
            steal_grace: chrono::Duration::seconds(20),
            now: chrono::Utc::now(),
            rows: &rows,
            parent_not_ready: &parent_not_ready,
        });
        assert!(plan.steal.is_none());
    }

    #[test]
    fn releases_when_over_cap() {
        let rows = vec![
            lease("s-1", Some("self"), 50),
            lease("s-2", Some("self"), 10),
        ];
        let parent_not_ready = Default::default();
        let plan = plan_tick(TickInputs {
            worker_id: "self",
            cap: 1,
            worker_count: 1,
            open_shard_count: 2,
            steal_batch: 1,
            steal_grace: chrono::Duration::seconds(20),
            now: chrono::Utc::now(),
            rows: &rows,
            parent_not_ready: &parent_not_ready,
        });
        assert_eq!(plan.release.len(), 1);
    }

    #[test]
    fn does_not_acquire_child_whose_parent_is_not_ready() {
        let rows = vec![lease("child", None, 0)];
        let mut parent_not_ready = std::collections::HashSet::new();
        parent_not_ready.insert("child".to_string());
        let plan = plan_tick(TickInputs {
            worker_id: "self",
            cap: 80,
            worker_count: 1,
            open_shard_count: 1,
            steal_batch: 1,
            steal_grace: chrono::Duration::seconds(20),
            now: chrono::Utc::now(),
            rows: &rows,
            parent_not_ready: &parent_not_ready,
        });
        assert!(plan.acquire.is_empty());
    }
}
