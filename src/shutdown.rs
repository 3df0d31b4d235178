use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Coordinates graceful shutdown of realtime connections.
///
/// Each websocket handler calls [`register`](Self::register) when it starts
/// and holds the returned guard for its lifetime. When [`shutdown`](Self::shutdown)
/// is called every receiver observes `true`, handlers send a close frame and
/// drop their guard, and [`wait_for_all_closed`](Self::wait_for_all_closed)
/// resolves once the count reaches zero.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Register a connection. The guard decrements the active count on drop.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ConnectionGuard {
            active: self.active.clone(),
            drained: self.drained.clone(),
        };
        (guard, self.tx.subscribe())
    }

    /// Register a connection only if fewer than `limit` are active. The
    /// check and the increment are one atomic step, so concurrent callers
    /// never push the count past `limit`.
    pub fn try_register(&self, limit: usize) -> Option<(ConnectionGuard, watch::Receiver<bool>)> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()?;
        let guard = ConnectionGuard {
            active: self.active.clone(),
            drained: self.drained.clone(),
        };
        Some((guard, self.tx.subscribe()))
    }

    /// Signal every registered connection to close.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until every registered connection has dropped its guard, or
    /// `timeout` elapses. Returns `true` if all connections closed.
    pub async fn wait_for_all_closed(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// RAII handle for one tracked connection.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}
