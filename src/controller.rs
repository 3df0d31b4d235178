//! Session controller: turns lifecycle events into running or stopped
//! worker units.
//!
//! Tracking state (`session → unit`, `session → last heartbeat`) lives in a
//! map owned by the controller. Every mutation removes or inserts under the
//! write lock, so a terminate and a heartbeat-timeout racing for the same
//! session tear it down once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bus::{publish_json, Bus, BusError, BusMessage};
use crate::config::ControllerConfig;
use crate::events::{
    SessionCreate, SessionError, SessionHeartbeat, SessionTerminate, REASON_CONTROLLER_SHUTDOWN,
    REASON_HEARTBEAT_TIMEOUT, SESSION_CREATE, SESSION_ERROR, SESSION_HEARTBEAT, SESSION_TERMINATE,
};
use crate::ports::{PortError, PortManager};
use crate::runtime::{
    unit_name, worker_labels, ContainerRuntime, RuntimeError, UnitSpec, KIND_SESSION_WORKER,
    LABEL_KIND,
};

// Environment handed to every worker unit.
pub const ENV_SESSION_ID: &str = "SESSION_ID";
pub const ENV_USER_ID: &str = "USER_ID";
pub const ENV_INSTANCE_ID: &str = "INSTANCE_ID";
pub const ENV_SSH_HOST: &str = "SSH_HOST";
pub const ENV_SSH_PORT: &str = "SSH_PORT";
pub const ENV_SSH_USERNAME: &str = "SSH_USERNAME";
pub const ENV_SSH_CREDENTIAL: &str = "SSH_CREDENTIAL";
pub const ENV_SSH_AUTH_TYPE: &str = "SSH_AUTH_TYPE";
pub const ENV_DESKTOP_ENVIRONMENT: &str = "DESKTOP_ENVIRONMENT";
pub const ENV_WORKER_PORT: &str = "WORKER_PORT";
pub const ENV_BUS_URL: &str = "BUS_URL";
pub const ENV_JWT_SECRET: &str = "JWT_SECRET";

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("session {0} is already tracked or being created")]
    AlreadyTracked(String),
    #[error("no port available in {start}..={end}")]
    NoPortAvailable { start: u16, end: u16 },
    #[error("port store: {0}")]
    Ports(#[from] PortError),
    #[error("container runtime: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("bus: {0}")]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone)]
struct TrackedSession {
    unit_id: String,
    user_id: String,
    instance_id: String,
    last_heartbeat: Instant,
}

/// Cheap to clone; clones share tracking state.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: ControllerConfig,
    bus: Arc<dyn Bus>,
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortManager,
    sessions: RwLock<HashMap<String, TrackedSession>>,
    /// Creates that have started but not yet been recorded. Reconcile
    /// leaves their units and ports alone.
    pending: Mutex<HashSet<String>>,
    reconciling: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Removes a session id from the pending set when the create finishes.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<String>>,
    session_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.session_id);
    }
}

impl SessionController {
    pub fn new(
        config: ControllerConfig,
        bus: Arc<dyn Bus>,
        runtime: Arc<dyn ContainerRuntime>,
        ports: PortManager,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                bus,
                runtime,
                ports,
                sessions: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                reconciling: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn is_tracked(&self, session_id: &str) -> bool {
        self.inner.sessions.read().contains_key(session_id)
    }

    pub fn unit_for(&self, session_id: &str) -> Option<String> {
        self.inner
            .sessions
            .read()
            .get(session_id)
            .map(|s| s.unit_id.clone())
    }

    /// Tracked session ids, sorted.
    pub fn tracked_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Allocate a port and launch a worker unit for the session.
    ///
    /// Any failure publishes `session:error` and leaves nothing behind: a
    /// reserved port is released and a created unit is removed. A create for
    /// a session that is already tracked (or mid-create) is ignored.
    pub async fn handle_create(&self, event: SessionCreate) -> Result<u16, ControllerError> {
        let session_id = event.session_id.clone();
        let _pending = match self.begin_create(&session_id) {
            Some(guard) => guard,
            None => {
                tracing::info!(%session_id, "duplicate create ignored");
                return Err(ControllerError::AlreadyTracked(session_id));
            }
        };

        match self.launch(&event).await {
            Ok(port) => Ok(port),
            Err(e) => {
                tracing::error!(%session_id, error = %e, "session create failed");
                let failure = SessionError {
                    session_id: session_id.clone(),
                    error: e.to_string(),
                };
                if let Err(publish_err) =
                    publish_json(self.inner.bus.as_ref(), SESSION_ERROR, &failure).await
                {
                    tracing::warn!(%session_id, error = %publish_err, "failed to publish session error");
                }
                Err(e)
            }
        }
    }

    fn begin_create(&self, session_id: &str) -> Option<PendingGuard<'_>> {
        let mut pending = self.inner.pending.lock();
        if self.is_tracked(session_id) || !pending.insert(session_id.to_string()) {
            return None;
        }
        Some(PendingGuard {
            pending: &self.inner.pending,
            session_id: session_id.to_string(),
        })
    }

    async fn launch(&self, event: &SessionCreate) -> Result<u16, ControllerError> {
        let inner = &self.inner;
        let session_id = event.session_id.as_str();

        let port = match inner.ports.allocate(session_id).await? {
            Some(port) => port,
            None => {
                let range = inner.ports.range();
                return Err(ControllerError::NoPortAvailable {
                    start: *range.start(),
                    end: *range.end(),
                });
            }
        };

        let spec = self.unit_spec(event, port);
        let unit_id = match inner.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.release_port(session_id, port).await;
                return Err(e.into());
            }
        };

        if let Err(e) = inner.runtime.start(&unit_id).await {
            if let Err(remove_err) = inner.runtime.remove(&unit_id).await {
                tracing::warn!(%session_id, %unit_id, error = %remove_err, "failed to remove unstarted unit");
            }
            self.release_port(session_id, port).await;
            return Err(e.into());
        }

        inner.sessions.write().insert(
            session_id.to_string(),
            TrackedSession {
                unit_id: unit_id.clone(),
                user_id: event.user_id.clone(),
                instance_id: event.instance_id.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        tracing::info!(
            %session_id,
            %unit_id,
            port,
            user_id = %event.user_id,
            instance_id = %event.instance_id,
            "session worker started"
        );
        Ok(port)
    }

    fn unit_spec(&self, event: &SessionCreate, port: u16) -> UnitSpec {
        let config = &self.inner.config;
        let ssh = &event.ssh_config;
        let env = vec![
            (ENV_SESSION_ID, event.session_id.clone()),
            (ENV_USER_ID, event.user_id.clone()),
            (ENV_INSTANCE_ID, event.instance_id.clone()),
            (ENV_SSH_HOST, ssh.host.clone()),
            (ENV_SSH_PORT, ssh.port.to_string()),
            (ENV_SSH_USERNAME, ssh.username.clone()),
            (ENV_SSH_CREDENTIAL, ssh.credential.clone()),
            (ENV_SSH_AUTH_TYPE, ssh.auth_type.to_string()),
            (ENV_DESKTOP_ENVIRONMENT, event.desktop_environment.to_string()),
            (ENV_WORKER_PORT, port.to_string()),
            (ENV_BUS_URL, config.worker_bus_url().to_string()),
            (
                ENV_JWT_SECRET,
                config.jwt_secret.clone().unwrap_or_default(),
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        UnitSpec {
            name: unit_name(&event.session_id),
            image: config.worker_image.clone(),
            env,
            labels: worker_labels(&event.session_id, &event.user_id, &event.instance_id),
            port,
            memory_bytes: config.memory_limit_bytes,
            cpu_shares: config.cpu_shares,
            network: config.network.clone(),
        }
    }

    /// Stop and remove the session's unit and release its port. Returns
    /// false (and does nothing) if the session is not tracked.
    pub async fn handle_terminate(&self, event: SessionTerminate) -> bool {
        let session_id = event.session_id.as_str();
        let Some(tracked) = self.inner.sessions.write().remove(session_id) else {
            tracing::debug!(%session_id, reason = %event.reason, "terminate for untracked session ignored");
            return false;
        };
        self.teardown(session_id, tracked, &event.reason).await;
        true
    }

    async fn teardown(&self, session_id: &str, tracked: TrackedSession, reason: &str) {
        tracing::info!(
            %session_id,
            unit_id = %tracked.unit_id,
            user_id = %tracked.user_id,
            instance_id = %tracked.instance_id,
            %reason,
            "terminating session"
        );
        self.destroy_unit(&tracked.unit_id).await;

        match self.inner.ports.port_for_session(session_id).await {
            Ok(Some(port)) => self.release_port(session_id, port).await,
            Ok(None) => tracing::debug!(%session_id, "no port allocated for session"),
            Err(e) => tracing::warn!(%session_id, error = %e, "port lookup failed during terminate"),
        }
    }

    /// Refresh liveness. False if the session is not tracked.
    pub fn handle_heartbeat(&self, event: SessionHeartbeat) -> bool {
        match self.inner.sessions.write().get_mut(&event.session_id) {
            Some(tracked) => {
                tracked.last_heartbeat = Instant::now();
                true
            }
            None => {
                tracing::debug!(session_id = %event.session_id, "heartbeat for untracked session");
                false
            }
        }
    }

    /// Terminate every session silent for longer than the heartbeat timeout
    /// and announce it on `session:terminate`. Returns the terminated ids.
    ///
    /// Candidates are collected up front but each one is re-checked under the
    /// write lock before removal, since tearing down an earlier candidate can
    /// take a full stop grace period during which later ones may heartbeat.
    pub async fn sweep_heartbeats(&self) -> Vec<String> {
        let timeout = self.inner.config.heartbeat_timeout();
        let candidates: Vec<String> = self
            .inner
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.last_heartbeat.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut terminated = Vec::with_capacity(candidates.len());
        for session_id in candidates {
            let Some(tracked) = self.remove_if_expired(&session_id, timeout) else {
                continue;
            };
            tracing::warn!(%session_id, "heartbeat timeout");
            self.teardown(&session_id, tracked, REASON_HEARTBEAT_TIMEOUT).await;

            let event = SessionTerminate {
                session_id: session_id.clone(),
                reason: REASON_HEARTBEAT_TIMEOUT.to_string(),
            };
            if let Err(e) = publish_json(self.inner.bus.as_ref(), SESSION_TERMINATE, &event).await {
                tracing::warn!(%session_id, error = %e, "failed to publish heartbeat timeout");
            }
            terminated.push(session_id);
        }
        terminated
    }

    /// Untrack `session_id` only if it is still silent past `timeout`.
    fn remove_if_expired(&self, session_id: &str, timeout: Duration) -> Option<TrackedSession> {
        let mut sessions = self.inner.sessions.write();
        if sessions.get(session_id)?.last_heartbeat.elapsed() <= timeout {
            tracing::debug!(%session_id, "heartbeat arrived during sweep, keeping session");
            return None;
        }
        sessions.remove(session_id)
    }

    /// Destroy worker units that no tracked (or in-flight) session owns, and
    /// release ports held by sessions this controller does not know about.
    /// Returns the ids of destroyed units. Overlapping calls are skipped.
    pub async fn reconcile(&self) -> Result<Vec<String>, ControllerError> {
        if self.inner.reconciling.swap(true, Ordering::AcqRel) {
            tracing::debug!("reconcile already running, skipping");
            return Ok(Vec::new());
        }
        let result = self.reconcile_inner().await;
        self.inner.reconciling.store(false, Ordering::Release);
        result
    }

    async fn reconcile_inner(&self) -> Result<Vec<String>, ControllerError> {
        let units = self
            .inner
            .runtime
            .list_by_label(LABEL_KIND, KIND_SESSION_WORKER)
            .await?;

        let mut destroyed = Vec::new();
        for unit in units {
            let owned = unit.session_id().is_some_and(|id| self.is_known(id));
            if owned {
                continue;
            }
            tracing::warn!(
                unit_id = %unit.id,
                session_id = unit.session_id().unwrap_or("-"),
                "destroying orphaned worker unit"
            );
            self.destroy_unit(&unit.id).await;
            destroyed.push(unit.id);
        }

        for allocation in self.inner.ports.list_allocations().await? {
            if !self.is_known(&allocation.session_id) {
                tracing::warn!(
                    port = allocation.port,
                    session_id = %allocation.session_id,
                    "releasing orphaned port"
                );
                self.release_port(&allocation.session_id, allocation.port).await;
            }
        }

        if !destroyed.is_empty() {
            tracing::info!(count = destroyed.len(), "reconcile destroyed orphaned units");
        }
        Ok(destroyed)
    }

    fn is_known(&self, session_id: &str) -> bool {
        self.is_tracked(session_id) || self.inner.pending.lock().contains(session_id)
    }

    /// Subscribe to the lifecycle channels and process events until
    /// [`shutdown`](Self::shutdown) is called or the bus goes away.
    ///
    /// Runs one reconcile pass before accepting events, then keeps the
    /// heartbeat sweep and periodic reconcile running in the background.
    pub async fn run(&self) -> Result<(), ControllerError> {
        let mut rx = self
            .inner
            .bus
            .subscribe(&[SESSION_CREATE, SESSION_TERMINATE, SESSION_HEARTBEAT])
            .await?;

        match self.reconcile().await {
            Ok(destroyed) => tracing::info!(orphans = destroyed.len(), "startup reconcile complete"),
            Err(e) => tracing::error!(error = %e, "startup reconcile failed"),
        }

        self.spawn_sweeper();
        self.spawn_reconciler();
        tracing::info!("controller listening for session events");

        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => self.dispatch(msg),
                    None => {
                        tracing::warn!("bus subscription ended");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Route one bus message to its handler on a task of its own.
    fn dispatch(&self, msg: BusMessage) {
        let controller = self.clone();
        match msg.channel.as_str() {
            SESSION_CREATE => {
                let Some(event) = decode::<SessionCreate>(&msg) else { return };
                self.inner.tasks.spawn(async move {
                    let _ = controller.handle_create(event).await;
                });
            }
            SESSION_TERMINATE => {
                let Some(event) = decode::<SessionTerminate>(&msg) else { return };
                self.inner.tasks.spawn(async move {
                    controller.handle_terminate(event).await;
                });
            }
            SESSION_HEARTBEAT => {
                let Some(event) = decode::<SessionHeartbeat>(&msg) else { return };
                controller.handle_heartbeat(event);
            }
            other => tracing::debug!(channel = other, "ignoring message on unexpected channel"),
        }
    }

    fn spawn_sweeper(&self) {
        let controller = self.clone();
        let cancel = self.inner.cancel.clone();
        let every = self.inner.config.heartbeat_sweep_interval();
        self.inner.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        controller.sweep_heartbeats().await;
                    }
                }
            }
        });
    }

    fn spawn_reconciler(&self) {
        let Some(every) = self.inner.config.reconcile_interval() else {
            return;
        };
        let controller = self.clone();
        let cancel = self.inner.cancel.clone();
        self.inner.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = controller.reconcile().await {
                            tracing::warn!(error = %e, "periodic reconcile failed");
                        }
                    }
                }
            }
        });
    }

    /// Stop background loops, wait briefly for in-flight handlers, destroy
    /// every tracked unit, then close the bus.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.tasks.close();
        if tokio::time::timeout(inner.config.stop_grace(), inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!("in-flight session handlers did not finish before shutdown");
        }

        let tracked = self.tracked_sessions();
        tracing::info!(sessions = tracked.len(), "stopping tracked session workers");
        for session_id in tracked {
            self.handle_terminate(SessionTerminate {
                session_id,
                reason: REASON_CONTROLLER_SHUTDOWN.to_string(),
            })
            .await;
        }

        inner.bus.close().await;
        tracing::info!("controller stopped");
    }

    /// Stop then remove. Failures are logged; the next reconcile retries.
    async fn destroy_unit(&self, unit_id: &str) {
        let runtime = &self.inner.runtime;
        if let Err(e) = runtime.stop(unit_id, self.inner.config.stop_grace()).await {
            tracing::warn!(%unit_id, error = %e, "failed to stop worker unit");
        }
        if let Err(e) = runtime.remove(unit_id).await {
            tracing::warn!(%unit_id, error = %e, "failed to remove worker unit");
        }
    }

    async fn release_port(&self, session_id: &str, port: u16) {
        if let Err(e) = self.inner.ports.release(port).await {
            tracing::warn!(%session_id, port, error = %e, "failed to release port");
        }
    }
}

fn decode<T: DeserializeOwned>(msg: &BusMessage) -> Option<T> {
    match serde_json::from_str(&msg.payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(channel = %msg.channel, error = %e, "dropping malformed event");
            None
        }
    }
}
