//! Lease Store (spec §4.1): a narrow key-value facade over the single
//! logical table, synchronous-shaped (each call resolves or fails, no
//! partial results) but invoked from async code, idempotent at the
//! request level, and cancellation-aware via the `call` wrapper below,
//! which bounds every operation with a timeout and retries transient
//! failures with backoff.

pub mod memory;
pub mod postgres;

use crate::error::{Error, Result};
use crate::model::RowId;

/// The condition under which a `conditional_put` is allowed to succeed
/// (spec §4.1, I5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedCounter {
    /// The row must not exist yet.
    Absent,
    /// The row must currently carry exactly this counter value.
    Is(u64),
}

/// A row as the store sees it: an opaque JSON payload plus the optimistic
/// concurrency token. Typed wrappers in `model` are encoded into / decoded
/// out of `payload` at the edges (`lease::LeaseManager`, `cap::CapResolver`,
/// etc.) — the store itself never needs to know about `LeaseRow` vs.
/// `CapRow`.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub row_id: RowId,
    pub counter: u64,
    pub payload: serde_json::Value,
}

impl StoredRow {
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|err| Error::InvariantViolation(format!("row {} undecodable: {err}", self.row_id)))
    }
}

/// Outcome of a conditional write (spec §4.1: `OK | CONFLICT | fail(kind)`).
/// `Conflict` is a plain value, not an `Err` — "conflict is never a fatal
/// error" (spec §7) is enforced by this type rather than by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Write succeeded; the row's new counter.
    Written(u64),
    /// The row's counter (or existence) did not match `expected`.
    Conflict,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Strongly consistent read.
    async fn get(&self, row_id: &RowId) -> Result<Option<StoredRow>>;

    /// Succeeds only if the row's current counter equals `expected`
    /// (`ExpectedCounter::Is`), or the row does not exist
    /// (`ExpectedCounter::Absent`). On success the written row carries
    /// `counter = expected + 1` (or `1` for creation).
    async fn conditional_put(
        &self,
        row_id: &RowId,
        expected: ExpectedCounter,
        payload: serde_json::Value,
    ) -> Result<PutOutcome>;

    /// Lazy, eventually-consistent listing of all rows whose `row_id`
    /// starts with `prefix`. Used only for periodic discovery; must
    /// tolerate concurrent writes landing mid-scan.
    async fn scan(&self, prefix: &str) -> Result<Vec<StoredRow>>;

    /// Retirement path: delete a row predicated on its current counter.
    async fn delete(&self, row_id: &RowId, expected_counter: u64) -> Result<PutOutcome>;
}

/// Wraps any `Store` call with a bounded timeout, classifying an elapsed
/// deadline as `transient_store` (spec §5: "per-operation timeouts are
/// required... treated as transient").
pub async fn with_timeout<T>(
    duration: std::time::Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    crate::error::with_deadline(duration, |msg| Error::TransientStore(anyhow::anyhow!(msg)), fut).await
}

/// Default per-operation store timeout (spec §5, suggested 5s).
pub const DEFAULT_STORE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Wraps a `Store` call with `timeout` and retries a transient failure —
/// including a timed-out attempt — with exponential backoff up to
/// `error::DEFAULT_RETRY_ATTEMPTS` (spec §4.5/§7). The canonical way every
/// module in this crate reaches the `Store`.
pub async fn call<T, Fut>(timeout: std::time::Duration, mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    crate::error::retry_transient(
        crate::error::DEFAULT_RETRY_ATTEMPTS,
        crate::error::DEFAULT_RETRY_MIN_DELAY,
        crate::error::DEFAULT_RETRY_MAX_DELAY,
        move || with_timeout(timeout, op()),
    )
    .await
}
