//! One session worker: SSH connection → remote display → local tunnel →
//! realtime listener.
//!
//! [`start`] runs the stages in order. Each stage hands the resource it
//! acquired to a [`Teardown`], so whichever stage fails, the same routine
//! unwinds exactly what exists, newest first. On success the teardown moves
//! into the [`RunningWorker`] and runs again on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState, AuthPolicy, SessionTokens};
use crate::bus::{publish_json, Bus, BusError};
use crate::config::{ConfigError, WorkerConfig};
use crate::display::{self, DisplayError, DisplaySlot};
use crate::events::{
    SessionError, SessionHeartbeat, SessionReady, SESSION_ERROR, SESSION_HEARTBEAT, SESSION_READY,
};
use crate::shutdown::ShutdownCoordinator;
use crate::ssh::{Connector, RemoteHost, SshError};
use crate::tls::{self, TlsError};
use crate::tunnel::Tunnel;

/// How long realtime connections get to acknowledge their close frame.
/// Together with [`HTTP_STOP_TIMEOUT`] this keeps the worst-case teardown
/// well inside the controller's default stop grace, so the display is
/// killed before the runtime resorts to SIGKILL.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);
/// How long the HTTP listener gets to wind down before its task is aborted.
const HTTP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),
    #[error("ssh: {0}")]
    Ssh(#[from] SshError),
    #[error("display: {0}")]
    Display(#[from] DisplayError),
    #[error("tunnel listener failed: {0}")]
    Tunnel(std::io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("bus: {0}")]
    Bus(#[from] BusError),
}

/// A worker that has reached ready and is serving.
pub struct RunningWorker {
    session_id: String,
    addr: SocketAddr,
    tunnel_addr: SocketAddr,
    display: DisplaySlot,
    teardown: Teardown,
}

impl RunningWorker {
    /// Address of the HTTP(S) listener.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn tunnel_addr(&self) -> SocketAddr {
        self.tunnel_addr
    }

    pub fn display(&self) -> DisplaySlot {
        self.display
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn shutdown(self) {
        tracing::info!(session_id = %self.session_id, "worker shutting down");
        self.teardown.run().await;
    }
}

/// Bring a worker up. On failure everything acquired so far is released,
/// a `session:error` is published, and the error is returned; the worker
/// never announces ready.
pub async fn start(
    config: WorkerConfig,
    bus: Arc<dyn Bus>,
    connector: &dyn Connector,
) -> Result<RunningWorker, WorkerError> {
    config.validate()?;
    let tls = config
        .tls_paths()
        .map(|(cert, key)| tls::load_tls_config(cert, key))
        .transpose()?;

    let mut teardown = Teardown::new(config.session_id.clone());
    match bring_up(&config, &bus, connector, tls, &mut teardown).await {
        Ok((addr, tunnel_addr, display)) => Ok(RunningWorker {
            session_id: config.session_id,
            addr,
            tunnel_addr,
            display,
            teardown,
        }),
        Err(e) => {
            tracing::error!(session_id = %config.session_id, error = %e, "worker startup failed");
            teardown.run().await;
            let event = SessionError {
                session_id: config.session_id.clone(),
                error: e.to_string(),
            };
            if let Err(publish_err) = publish_json(bus.as_ref(), SESSION_ERROR, &event).await {
                tracing::warn!(error = %publish_err, "failed to publish session error");
            }
            Err(e)
        }
    }
}

async fn bring_up(
    config: &WorkerConfig,
    bus: &Arc<dyn Bus>,
    connector: &dyn Connector,
    tls: Option<TlsAcceptor>,
    teardown: &mut Teardown,
) -> Result<(SocketAddr, SocketAddr, DisplaySlot), WorkerError> {
    let session_id = config.session_id.as_str();

    // Heartbeats cover provisioning too, which can outlast the controller's
    // timeout on a fresh host.
    teardown.heartbeat = Some(Heartbeat::spawn(
        bus.clone(),
        session_id.to_string(),
        config.heartbeat_interval,
    ));

    tracing::info!(%session_id, host = %config.ssh.host, port = config.ssh.port, "connecting");
    let remote = connector.connect(&config.ssh).await?;
    teardown.remote = Some(remote.clone());

    tracing::info!(%session_id, desktop = %config.desktop_environment, "provisioning display server");
    display::provision(remote.as_ref(), config.desktop_environment).await?;

    let slot = display::start(remote.as_ref(), session_id).await?;
    teardown.display = Some(slot);
    teardown.lease = Some(Lease::spawn(remote.clone(), slot, session_id.to_string()));
    tracing::info!(%session_id, display = %slot, "display started");

    let tunnel = Tunnel::open(remote.clone(), "localhost".to_string(), slot.port())
        .await
        .map_err(WorkerError::Tunnel)?;
    let tunnel_addr = tunnel.local_addr();
    teardown.tunnel = Some(tunnel);

    let connections = ShutdownCoordinator::new();
    teardown.connections = Some(connections.clone());
    let app = api::router(
        AppState {
            session_id: session_id.to_string(),
            tunnel_addr,
            shutdown: connections,
        },
        AuthPolicy {
            tokens: SessionTokens::new(&config.jwt_secret),
            user_id: config.user_id.clone(),
            session_id: session_id.to_string(),
        },
    );
    let server = HttpServer::start(config.listen, app, tls).await?;
    let addr = server.addr;
    teardown.http = Some(server);

    let ready = SessionReady {
        session_id: session_id.to_string(),
        port: addr.port(),
    };
    publish_json(bus.as_ref(), SESSION_READY, &ready).await?;
    tracing::info!(%session_id, %addr, "worker ready");

    Ok((addr, tunnel_addr, slot))
}

/// Resources a worker holds, released in reverse acquisition order.
struct Teardown {
    session_id: String,
    heartbeat: Option<Heartbeat>,
    connections: Option<ShutdownCoordinator>,
    http: Option<HttpServer>,
    tunnel: Option<Tunnel>,
    lease: Option<Lease>,
    display: Option<DisplaySlot>,
    remote: Option<Arc<dyn RemoteHost>>,
}

impl Teardown {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            heartbeat: None,
            connections: None,
            http: None,
            tunnel: None,
            lease: None,
            display: None,
            remote: None,
        }
    }

    /// Heartbeat, realtime connections, HTTP listener, tunnel, display, SSH.
    async fn run(self) {
        let session_id = self.session_id;

        if let Some(heartbeat) = self.heartbeat {
            heartbeat.stop().await;
        }

        if let Some(connections) = self.connections {
            connections.shutdown();
            if !connections.wait_for_all_closed(DRAIN_TIMEOUT).await {
                tracing::warn!(
                    %session_id,
                    remaining = connections.active_count(),
                    "realtime connections did not close in time"
                );
            }
        }

        if let Some(http) = self.http {
            http.stop().await;
        }

        if let Some(tunnel) = self.tunnel {
            tunnel.close().await;
        }

        if let Some(lease) = self.lease {
            lease.stop().await;
        }

        if let (Some(slot), Some(remote)) = (self.display, self.remote.as_ref()) {
            display::stop(remote.as_ref(), slot).await;
        }

        if let Some(remote) = self.remote {
            remote.close().await;
            tracing::info!(%session_id, "ssh connection closed");
        }
    }
}

struct HttpServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HttpServer {
    async fn start(
        listen: SocketAddr,
        app: axum::Router,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, WorkerError> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|source| WorkerError::Bind { addr: listen, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| WorkerError::Bind { addr: listen, source })?;
        let cancel = CancellationToken::new();

        let task = match tls {
            Some(acceptor) => {
                tracing::info!(%addr, "listening (https)");
                tokio::spawn(tls::serve_tls(listener, acceptor, app, cancel.clone()))
            }
            None => {
                tracing::info!(%addr, "listening (http)");
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let result = axum::serve(listener, app)
                        .with_graceful_shutdown(async move { cancel.cancelled().await })
                        .await;
                    if let Err(e) = result {
                        tracing::error!(error = %e, "http server error");
                    }
                })
            }
        };

        Ok(Self { addr, cancel, task })
    }

    async fn stop(mut self) {
        self.cancel.cancel();
        if tokio::time::timeout(HTTP_STOP_TIMEOUT, &mut self.task)
            .await
            .is_err()
        {
            tracing::warn!(addr = %self.addr, "http listener did not stop in time, aborting");
            self.task.abort();
        }
        tracing::info!(addr = %self.addr, "http listener closed");
    }
}

struct Heartbeat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Heartbeat {
    fn spawn(bus: Arc<dyn Bus>, session_id: String, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                let beat = SessionHeartbeat { session_id };
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = publish_json(bus.as_ref(), SESSION_HEARTBEAT, &beat).await {
                                tracing::warn!(session_id = %beat.session_id, error = %e, "heartbeat publish failed");
                            }
                        }
                    }
                }
            }
        });
        Self { cancel, task }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Keeps the display lease fresh so other workers on the host do not
/// reclaim a live display.
struct Lease {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Lease {
    fn spawn(remote: Arc<dyn RemoteHost>, slot: DisplaySlot, session_id: String) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut ticker = tokio::time::interval(display::LEASE_REFRESH);
                // Written once already by `display::start`.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            display::renew_lease(remote.as_ref(), slot, &session_id).await;
                        }
                    }
                }
            }
        });
        Self { cancel, task }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}
