//! Persisted entities (spec §3). All three row kinds live in one logical
//! table keyed by a single string `row_id`; the prefix encodes the kind.

use serde::{Deserialize, Serialize};

/// A key into the single logical table. Never hand-format `"lease/" +
/// shard_id` at a call site — go through these constructors so the prefix
/// convention lives in exactly one place.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(String);

impl RowId {
    pub fn lease(shard_id: &str) -> Self {
        Self(format!("lease/{shard_id}"))
    }

    pub fn cap(app_name: &str) -> Self {
        Self(format!("cap/{app_name}"))
    }

    pub fn worker(worker_id: &str) -> Self {
        Self(format!("worker/{worker_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reconstructs a `RowId` from a raw `row_id` string already carrying
    /// one of the `lease/`, `cap/`, `worker/` prefixes — e.g. one read back
    /// verbatim from `Store::scan`/`Store::get`.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checkpoint sentinel handling (spec §3): `SHARD_END` is terminal,
/// `TRIM_HORIZON` (absent) means not yet started. Encoding this as an enum
/// instead of comparing magic strings everywhere is the whole point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "cursor")]
pub enum Checkpoint {
    TrimHorizon,
    At(String),
    ShardEnd,
}

impl Checkpoint {
    pub fn is_shard_end(&self) -> bool {
        matches!(self, Checkpoint::ShardEnd)
    }
}

/// `row_id = "lease/" + shard_id` (spec §3).
///
/// I1: at most one `LeaseRow` exists per `shard_id` — enforced by `Store`
/// creation going through `conditional_put(.., Absent)`.
/// I5: every mutation of `owner`, `counter`, or `checkpoint` is a
/// conditional write predicated on `counter`; enforced by `Store`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRow {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
    pub owner: Option<String>,
    pub heartbeat_at: chrono::DateTime<chrono::Utc>,
    pub checkpoint: Checkpoint,
    pub owner_switches_since_checkpoint: u32,
}

impl LeaseRow {
    pub fn new_unowned(shard_id: String, parent_shard_id: Option<String>, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            shard_id,
            parent_shard_id,
            owner: None,
            heartbeat_at: now,
            checkpoint: Checkpoint::TrimHorizon,
            owner_switches_since_checkpoint: 0,
        }
    }

    /// I3: `checkpoint = SHARD_END` is terminal.
    pub fn is_terminal(&self) -> bool {
        self.checkpoint.is_shard_end()
    }

    pub fn is_free(&self) -> bool {
        self.owner.is_none() && !self.is_terminal()
    }
}

/// `row_id = "cap/" + app_name` (spec §3). The coordinator's latest
/// published decision; I6/I7 are enforced by `cap::CapResolver`, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapRow {
    pub max_leases: u32,
    pub shard_count: u32,
    pub worker_count: u32,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// `row_id = "worker/" + worker_id` (spec §3). Informational only; never
/// read back authoritatively by any other component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRow {
    pub worker_id: String,
    pub max_leases: u32,
    pub shard_count: u32,
    pub worker_count: u32,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_id_prefixes() {
        assert_eq!(RowId::lease("s-1").as_str(), "lease/s-1");
        assert_eq!(RowId::cap("app").as_str(), "cap/app");
        assert_eq!(RowId::worker("w-1").as_str(), "worker/w-1");
    }

    #[test]
    fn terminal_lease_is_never_free() {
        let mut row = LeaseRow::new_unowned("s-1".into(), None, chrono::Utc::now());
        assert!(row.is_free());
        row.checkpoint = Checkpoint::ShardEnd;
        row.owner = None;
        assert!(row.is_terminal());
        assert!(!row.is_free());
    }
}
