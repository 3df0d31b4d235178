//! Interactive shells multiplexed over SSH connections.
//!
//! Each terminal owns one connection and one PTY-backed shell channel on it.
//! A pump task per terminal forwards remote output to the caller's data
//! callback and notices when the remote side goes away. Whoever removes a
//! terminal from the map (explicit close, idle sweep, or the pump) runs its
//! cleanup, so the close callback fires exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityTracker;
use crate::ssh::{RemoteHost, ShellCommand, ShellEvent, SshError, TermSize};

/// Terminals with no traffic for this long are closed by the sweeper.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("terminal already exists: {0}")]
    AlreadyExists(String),
    #[error("failed to open shell: {0}")]
    Ssh(#[from] SshError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Active,
    Closed,
}

/// Why a terminal went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close`, `cleanup_for_instance`, or `cleanup_all`.
    Requested,
    /// Reaped by the idle sweep.
    Idle,
    /// The remote shell exited or the channel closed.
    RemoteClosed,
    /// The channel reported an error.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Closed { id: String, reason: CloseReason },
}

/// Point-in-time view of a tracked terminal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSession {
    pub id: String,
    pub user_id: String,
    pub instance_id: String,
    pub status: TerminalStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub dims: TermSize,
}

type CloseCallback = Box<dyn FnOnce(CloseReason) + Send>;

struct Entry {
    id: String,
    user_id: String,
    instance_id: String,
    created_at: DateTime<Utc>,
    dims: Mutex<TermSize>,
    commands: tokio::sync::mpsc::Sender<ShellCommand>,
    remote: Arc<dyn RemoteHost>,
    activity: ActivityTracker,
    on_close: Mutex<Option<CloseCallback>>,
}

impl Entry {
    fn snapshot(&self, status: TerminalStatus) -> TerminalSession {
        let idle = chrono::Duration::from_std(self.activity.idle_for()).unwrap_or_default();
        TerminalSession {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            instance_id: self.instance_id.clone(),
            status,
            created_at: self.created_at,
            last_activity: Utc::now() - idle,
            dims: *self.dims.lock(),
        }
    }
}

/// Registry of live terminals. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TerminalService {
    inner: Arc<RwLock<HashMap<String, Arc<Entry>>>>,
    events: broadcast::Sender<TerminalEvent>,
}

impl Default for TerminalService {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalService {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Open a shell on `remote` and start tracking it under `id`.
    ///
    /// `on_data` receives every chunk of shell output. `on_close` runs once
    /// when the terminal is closed for any reason.
    #[allow(clippy::too_many_arguments)]
    pub async fn create<D, C>(
        &self,
        id: impl Into<String>,
        remote: Arc<dyn RemoteHost>,
        user_id: impl Into<String>,
        instance_id: impl Into<String>,
        dims: TermSize,
        on_data: D,
        on_close: C,
    ) -> Result<TerminalSession, TerminalError>
    where
        D: Fn(Bytes) + Send + Sync + 'static,
        C: FnOnce(CloseReason) + Send + 'static,
    {
        let id = id.into();
        if self.inner.read().contains_key(&id) {
            return Err(TerminalError::AlreadyExists(id));
        }

        let handle = remote.open_shell(dims).await?;
        let entry = Arc::new(Entry {
            id: id.clone(),
            user_id: user_id.into(),
            instance_id: instance_id.into(),
            created_at: Utc::now(),
            dims: Mutex::new(dims),
            commands: handle.commands,
            remote,
            activity: ActivityTracker::new(),
            on_close: Mutex::new(Some(Box::new(on_close))),
        });

        {
            let mut map = self.inner.write();
            if map.contains_key(&id) {
                drop(map);
                // Lost a race with a concurrent create for the same id.
                let _ = entry.commands.try_send(ShellCommand::Close);
                return Err(TerminalError::AlreadyExists(id));
            }
            map.insert(id.clone(), entry.clone());
        }

        self.spawn_pump(entry.clone(), handle.events, on_data);
        tracing::info!(terminal_id = %id, user_id = %entry.user_id, instance_id = %entry.instance_id, "terminal opened");
        Ok(entry.snapshot(TerminalStatus::Active))
    }

    fn spawn_pump<D>(
        &self,
        entry: Arc<Entry>,
        mut events: tokio::sync::mpsc::Receiver<ShellEvent>,
        on_data: D,
    ) where
        D: Fn(Bytes) + Send + Sync + 'static,
    {
        let service = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                match events.recv().await {
                    Some(ShellEvent::Data(chunk)) => {
                        entry.activity.touch();
                        on_data(chunk);
                    }
                    Some(ShellEvent::Closed) | None => break CloseReason::RemoteClosed,
                    Some(ShellEvent::Error(e)) => break CloseReason::Error(e),
                }
            };
            if service.detach(&entry.id, Some(&entry)).is_some() {
                service.finish(entry, reason).await;
            }
        });
    }

    /// Send input to the shell. False if `id` is not tracked or the channel
    /// is already gone.
    pub async fn write(&self, id: &str, data: impl Into<Bytes>) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        entry.activity.touch();
        entry.commands.send(ShellCommand::Data(data.into())).await.is_ok()
    }

    /// Propagate a window-size change. False if `id` is not tracked.
    pub async fn resize(&self, id: &str, dims: TermSize) -> bool {
        let Some(entry) = self.get(id) else {
            return false;
        };
        *entry.dims.lock() = dims;
        entry.activity.touch();
        entry.commands.send(ShellCommand::Resize(dims)).await.is_ok()
    }

    /// End the shell and its connection. False if `id` was not tracked.
    pub async fn close(&self, id: &str) -> bool {
        self.close_with(id, CloseReason::Requested).await
    }

    pub fn get_session(&self, id: &str) -> Option<TerminalSession> {
        self.get(id).map(|e| e.snapshot(TerminalStatus::Active))
    }

    pub fn list_for_user(&self, user_id: &str) -> Vec<TerminalSession> {
        self.list_where(|e| e.user_id == user_id)
    }

    pub fn list_for_instance(&self, instance_id: &str) -> Vec<TerminalSession> {
        self.list_where(|e| e.instance_id == instance_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Close every terminal on `instance_id`. Returns how many were closed.
    pub async fn cleanup_for_instance(&self, instance_id: &str) -> usize {
        let ids: Vec<String> = self
            .inner
            .read()
            .values()
            .filter(|e| e.instance_id == instance_id)
            .map(|e| e.id.clone())
            .collect();
        self.close_all(ids, CloseReason::Requested).await
    }

    pub async fn cleanup_all(&self) -> usize {
        let ids: Vec<String> = self.inner.read().keys().cloned().collect();
        self.close_all(ids, CloseReason::Requested).await
    }

    /// Close every terminal idle for at least `threshold`. Returns the ids
    /// that were closed.
    pub async fn sweep_idle(&self, threshold: Duration) -> Vec<String> {
        let idle: Vec<String> = self
            .inner
            .read()
            .values()
            .filter(|e| e.activity.is_idle(threshold))
            .map(|e| e.id.clone())
            .collect();

        let mut closed = Vec::with_capacity(idle.len());
        for id in idle {
            if self.close_with(&id, CloseReason::Idle).await {
                tracing::info!(terminal_id = %id, "closed idle terminal");
                closed.push(id);
            }
        }
        closed
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `interval` until `cancel` fires.
    pub fn spawn_idle_sweeper(
        &self,
        threshold: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        service.sweep_idle(threshold).await;
                    }
                }
            }
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.events.subscribe()
    }

    fn get(&self, id: &str) -> Option<Arc<Entry>> {
        self.inner.read().get(id).cloned()
    }

    fn list_where(&self, pred: impl Fn(&Entry) -> bool) -> Vec<TerminalSession> {
        let mut sessions: Vec<_> = self
            .inner
            .read()
            .values()
            .filter(|e| pred(e))
            .map(|e| e.snapshot(TerminalStatus::Active))
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    async fn close_all(&self, ids: Vec<String>, reason: CloseReason) -> usize {
        let mut closed = 0;
        for id in ids {
            if self.close_with(&id, reason.clone()).await {
                closed += 1;
            }
        }
        closed
    }

    async fn close_with(&self, id: &str, reason: CloseReason) -> bool {
        let Some(entry) = self.detach(id, None) else {
            return false;
        };
        let _ = entry.commands.send(ShellCommand::Close).await;
        self.finish(entry, reason).await;
        true
    }

    /// Remove `id` from the map. With `expected`, only removes that exact
    /// entry, so a stale pump cannot evict a newer terminal reusing the id.
    fn detach(&self, id: &str, expected: Option<&Arc<Entry>>) -> Option<Arc<Entry>> {
        let mut map = self.inner.write();
        match (map.get(id), expected) {
            (Some(current), Some(expected)) if !Arc::ptr_eq(current, expected) => None,
            (Some(_), _) => map.remove(id),
            (None, _) => None,
        }
    }

    async fn finish(&self, entry: Arc<Entry>, reason: CloseReason) {
        entry.remote.close().await;
        tracing::info!(terminal_id = %entry.id, ?reason, "terminal closed");

        let callback = entry.on_close.lock().take();
        if let Some(callback) = callback {
            callback(reason.clone());
        }
        let _ = self.events.send(TerminalEvent::Closed {
            id: entry.id.clone(),
            reason,
        });
    }
}
