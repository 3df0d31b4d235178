use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Tracks the last time a terminal saw traffic in either direction.
///
/// The terminal service touches the tracker on every write, resize, and
/// chunk of remote output; the idle sweep compares [`idle_for`](Self::idle_for)
/// against its threshold. Uses `tokio::time::Instant` so paused-clock tests
/// can drive it.
#[derive(Clone)]
pub struct ActivityTracker {
    tx: Arc<watch::Sender<Instant>>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self { tx: Arc::new(tx) }
    }

    /// Record activity.
    pub fn touch(&self) {
        self.tx.send_replace(Instant::now());
    }

    pub fn last_activity(&self) -> Instant {
        *self.tx.borrow()
    }

    pub fn idle_for(&self) -> Duration {
        self.tx.borrow().elapsed()
    }

    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.idle_for() >= threshold
    }
}
