use std::sync::{Arc, Mutex};

/// Wall and monotonic time are separated so that expiry checks (which
/// compare `heartbeat_at` against "now") tolerate small wall-clock skew
/// between workers, while scheduling (ticks, timeouts) uses a monotonic
/// source unaffected by that skew.
pub trait Clock: Send + Sync + 'static {
    fn now_wall(&self) -> chrono::DateTime<chrono::Utc>;
    fn now_monotonic(&self) -> tokio::time::Instant;
}

#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_wall(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }

    fn now_monotonic(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }
}

/// A clock whose wall time can be advanced by tests without needing a
/// paused tokio runtime, since `InMemoryStore` comparisons only ever look
/// at wall time.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<chrono::DateTime<chrono::Utc>>>);

impl ManualClock {
    pub fn new(start: chrono::DateTime<chrono::Utc>) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.0.lock().unwrap();
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now_wall(&self) -> chrono::DateTime<chrono::Utc> {
        *self.0.lock().unwrap()
    }

    fn now_monotonic(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }
}
