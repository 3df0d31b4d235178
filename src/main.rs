//! byoc - session orchestration for remote desktops on user-owned VMs.
//!
//! ## Modes
//!
//! **Controller** (`byoc controller`): listens for session lifecycle events
//! on the bus, launches one worker container per session, and reaps
//! sessions whose workers stop heartbeating.
//!
//! **Worker** (`byoc worker`): runs inside a worker container. Every
//! parameter comes from the environment the controller injects.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use byoc::{
    bus::{Bus, BusError, RedisBus},
    config::{ConfigError, ControllerConfig, WorkerConfig},
    controller::{ControllerError, SessionController},
    events::{AuthType, DesktopEnvironment, SshConfig},
    ports::{PortError, PortManager, RedisPortStore},
    runtime::{DockerRuntime, RuntimeError},
    ssh::SshConnector,
    worker::{self, WorkerError},
};
use clap::{Args, Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// byoc - bring-your-own-cloud remote desktops
#[derive(ClapParser, Debug)]
#[command(name = "byoc", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "BYOC_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session controller
    Controller(ControllerArgs),

    /// Run one session worker (normally started by the controller)
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Path to the controller TOML config (defaults to ~/.config/byoc/controller.toml)
    #[arg(long, env = "BYOC_CONFIG")]
    config: Option<PathBuf>,

    /// Redis URL for the event bus and port allocations
    #[arg(long, env = "BYOC_REDIS_URL")]
    redis_url: Option<String>,

    /// Bus URL as seen from inside worker containers
    #[arg(long, env = "BYOC_WORKER_BUS_URL")]
    worker_bus_url: Option<String>,

    /// Worker container image
    #[arg(long, env = "BYOC_WORKER_IMAGE")]
    worker_image: Option<String>,

    /// Container network workers join
    #[arg(long, env = "BYOC_NETWORK")]
    network: Option<String>,

    /// Secret used to sign realtime access tokens
    #[arg(long, env = "BYOC_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
}

impl ControllerArgs {
    fn load_config(&self) -> Result<ControllerConfig, ConfigError> {
        let path = self.config.clone().or_else(ControllerConfig::default_path);
        let mut config = match path {
            Some(path) => ControllerConfig::load(&path)?.unwrap_or_default(),
            None => ControllerConfig::default(),
        };

        if let Some(url) = &self.redis_url {
            config.redis_url = url.clone();
        }
        if let Some(url) = &self.worker_bus_url {
            config.worker_bus_url = Some(url.clone());
        }
        if let Some(image) = &self.worker_image {
            config.worker_image = image.clone();
        }
        if let Some(network) = &self.network {
            config.network = Some(network.clone());
        }
        if let Some(secret) = &self.jwt_secret {
            config.jwt_secret = Some(secret.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(long, env = "SESSION_ID")]
    session_id: String,

    #[arg(long, env = "USER_ID")]
    user_id: String,

    #[arg(long, env = "INSTANCE_ID")]
    instance_id: String,

    #[arg(long, env = "SSH_HOST")]
    ssh_host: String,

    #[arg(long, env = "SSH_PORT", default_value_t = 22)]
    ssh_port: u16,

    #[arg(long, env = "SSH_USERNAME")]
    ssh_username: String,

    /// Private key (PEM/OpenSSH) or password, per --ssh-auth-type
    #[arg(long, env = "SSH_CREDENTIAL", hide_env_values = true)]
    ssh_credential: String,

    /// key | password
    #[arg(long, env = "SSH_AUTH_TYPE", default_value = "key")]
    ssh_auth_type: AuthType,

    /// xfce | lxde
    #[arg(long, env = "DESKTOP_ENVIRONMENT", default_value = "xfce")]
    desktop_environment: DesktopEnvironment,

    /// Port to serve the realtime endpoint on (allocated by the controller)
    #[arg(long, env = "WORKER_PORT")]
    port: u16,

    /// Address to bind the realtime endpoint
    #[arg(long, env = "BIND_HOST", default_value = "0.0.0.0")]
    bind_host: IpAddr,

    #[arg(long, env = "BUS_URL")]
    bus_url: String,

    /// Secret used to verify realtime access tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Seconds between heartbeats (max 30)
    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 15)]
    heartbeat_interval_secs: u64,

    /// TLS certificate (PEM); requires --tls-key
    #[arg(long, env = "TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM); requires --tls-cert
    #[arg(long, env = "TLS_KEY")]
    tls_key: Option<PathBuf>,
}

impl From<WorkerArgs> for WorkerConfig {
    fn from(args: WorkerArgs) -> Self {
        WorkerConfig {
            session_id: args.session_id,
            user_id: args.user_id,
            instance_id: args.instance_id,
            desktop_environment: args.desktop_environment,
            ssh: SshConfig {
                host: args.ssh_host,
                port: args.ssh_port,
                username: args.ssh_username,
                credential: args.ssh_credential,
                auth_type: args.ssh_auth_type,
            },
            listen: SocketAddr::new(args.bind_host, args.port),
            bus_url: args.bus_url,
            jwt_secret: args.jwt_secret,
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
            tls_cert: args.tls_cert,
            tls_key: args.tls_key,
        }
    }
}

#[derive(Error, Debug)]
pub enum ByocError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("port store error: {0}")]
    Ports(#[from] PortError),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> Result<(), ByocError> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Worker(args) => run_worker(args).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "byoc=info,tower_http=info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

// ── Controller mode ────────────────────────────────────────────────

async fn run_controller(args: ControllerArgs) -> Result<(), ByocError> {
    let config = args.load_config()?;
    tracing::info!(
        redis = %config.redis_url,
        image = %config.worker_image,
        ports = %format!("{}..={}", config.port_range_start, config.port_range_end),
        "byoc controller starting"
    );

    let bus: Arc<dyn Bus> = Arc::new(RedisBus::connect(&config.redis_url).await?);
    let store = Arc::new(RedisPortStore::connect(&config.redis_url).await?);
    let ports = PortManager::new(store, config.port_range_start, config.port_range_end)?;
    let runtime = Arc::new(DockerRuntime::connect_local()?);

    let controller = SessionController::new(config, bus, runtime, ports);
    let mut run = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run().await }
    });

    let finished_early = tokio::select! {
        _ = wait_for_signal() => None,
        result = &mut run => Some(result),
    };

    controller.shutdown().await;

    let result = match finished_early {
        Some(result) => result,
        None => run.await,
    };
    result??;

    tracing::info!("byoc controller exiting");
    Ok(())
}

// ── Worker mode ────────────────────────────────────────────────────

async fn run_worker(args: WorkerArgs) -> Result<(), ByocError> {
    let config = WorkerConfig::from(args);
    tracing::info!(session_id = %config.session_id, "byoc worker starting");

    let bus: Arc<dyn Bus> = Arc::new(RedisBus::connect(&config.bus_url).await?);
    let running = match worker::start(config, bus.clone(), &SshConnector::default()).await {
        Ok(running) => running,
        Err(e) => {
            bus.close().await;
            return Err(e.into());
        }
    };

    wait_for_signal().await;

    running.shutdown().await;
    bus.close().await;
    tracing::info!("byoc worker exiting");
    Ok(())
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM (what the container runtime sends
/// on stop).
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("received Ctrl+C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl+C");
    }
}
