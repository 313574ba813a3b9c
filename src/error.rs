/// Error kinds per the coordinator's error handling design.
///
/// `Conflict` is deliberately *not* a variant here: a failed optimistic
/// write is the designed signal for "someone else beat us" and is modeled
/// as a value (`store::PutOutcome::Conflict`), not as an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Timeout, throttling, or quorum-loss from the backing store.
    /// Retried with backoff by the caller; surfaced after too many attempts.
    #[error("transient store error: {0}")]
    TransientStore(#[source] anyhow::Error),

    /// A lease row vanished mid-operation (e.g. retired out from under a
    /// heartbeat). Treated as lease-lost by the Lease Manager.
    #[error("row {0} is missing")]
    MissingRow(String),

    /// Topology or Fleet probe failed. Callers retain their last-known
    /// reading rather than propagating this further.
    #[error("probe unavailable: {0}")]
    ProbeUnavailable(#[source] anyhow::Error),

    /// Two local states disagree about ownership, or a row was observed in
    /// a shape the protocol guarantees should be impossible. Fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether a caller should retry this with backoff rather than
    /// surfacing it immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStore(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Default per-operation timeout for Topology/Fleet probe calls (spec §5,
/// suggested 10s).
pub const DEFAULT_PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Bounded retry attempts for transient store errors, and the backoff range
/// between them (spec §4.5/§7: "retried with exponential backoff up to a
/// bounded attempt count").
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_MIN_DELAY: std::time::Duration = std::time::Duration::from_millis(50);
pub const DEFAULT_RETRY_MAX_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// Races `fut` against `duration`, converting an elapsed deadline into
/// whatever `Error` `on_timeout` builds from the generated message.
pub async fn with_deadline<T>(
    duration: std::time::Duration,
    on_timeout: impl FnOnce(String) -> Error,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(format!("operation timed out after {duration:?}"))),
    }
}

/// Retries `op` while it returns a transient error (including a timed-out
/// attempt surfaced as `TransientStore`), sleeping with exponentially
/// increasing, jittered backoff between attempts. Any other error, or a
/// transient error past `attempts`, returns immediately.
pub async fn retry_transient<T, Fut>(
    attempts: u32,
    min: std::time::Duration,
    max: std::time::Duration,
    mut op: impl FnMut() -> Fut,
) -> Result<T>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    let backoff = exponential_backoff::Backoff::new(attempts, min, max);
    let mut delays = (&backoff).into_iter();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => match delays.next() {
                Some(Some(delay)) => tokio::time::sleep(delay).await,
                _ => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}
