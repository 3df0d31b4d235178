use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::{DesktopEnvironment, SshConfig};

/// Controller settings, loaded from TOML. Every field has a default so an
/// empty (or missing) file is valid apart from the JWT secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Redis used for the event bus and the port allocation hash.
    pub redis_url: String,
    /// Image every worker unit runs.
    pub worker_image: String,
    /// First host port handed to workers (inclusive).
    pub port_range_start: u16,
    /// Last host port handed to workers (inclusive).
    pub port_range_end: u16,
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_sweep_secs: u64,
    /// Periodic orphan sweep after the startup pass. 0 disables it.
    pub reconcile_interval_secs: u64,
    pub stop_grace_secs: u64,
    pub memory_limit_bytes: i64,
    pub cpu_shares: i64,
    /// Signing secret for realtime access tokens, injected into workers.
    pub jwt_secret: Option<String>,
    /// Bus URL as reachable from inside a worker unit. Defaults to `redis_url`.
    pub worker_bus_url: Option<String>,
    /// Container network workers attach to.
    pub network: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            worker_image: "byoc/session-worker:latest".to_string(),
            port_range_start: 8081,
            port_range_end: 8181,
            heartbeat_timeout_secs: 60,
            heartbeat_sweep_secs: 30,
            reconcile_interval_secs: 300,
            stop_grace_secs: 10,
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            cpu_shares: 512,
            jwt_secret: None,
            worker_bus_url: None,
            network: None,
        }
    }
}

impl ControllerConfig {
    /// Load config from a TOML file path. Returns None if the file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        // The file may hold the JWT secret.
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// `~/.config/byoc/controller.toml` (platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("byoc").join("controller.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(ConfigError::Invalid(format!(
                "port range {}..={} is empty",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.heartbeat_timeout_secs == 0 || self.heartbeat_sweep_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat timeout and sweep interval must be non-zero".into(),
            ));
        }
        if self.jwt_secret.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Invalid("jwt_secret is required".into()));
        }
        if self.worker_image.is_empty() {
            return Err(ConfigError::Invalid("worker_image is required".into()));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn heartbeat_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_sweep_secs)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn worker_bus_url(&self) -> &str {
        self.worker_bus_url.as_deref().unwrap_or(&self.redis_url)
    }
}

/// Everything one session worker needs, assembled from the environment the
/// controller injects.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub session_id: String,
    pub user_id: String,
    pub instance_id: String,
    pub desktop_environment: DesktopEnvironment,
    pub ssh: SshConfig,
    /// HTTP(S) listener address. The port is the one the controller allocated.
    pub listen: SocketAddr,
    pub bus_url: String,
    pub jwt_secret: String,
    pub heartbeat_interval: Duration,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

/// Longest heartbeat interval that still leaves the controller two chances
/// inside its default 60 s timeout.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("SESSION_ID", &self.session_id),
            ("USER_ID", &self.user_id),
            ("INSTANCE_ID", &self.instance_id),
            ("SSH_HOST", &self.ssh.host),
            ("SSH_USERNAME", &self.ssh.username),
            ("SSH_CREDENTIAL", &self.ssh.credential),
            ("JWT_SECRET", &self.jwt_secret),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval > MAX_HEARTBEAT_INTERVAL {
            return Err(ConfigError::Invalid(format!(
                "heartbeat interval must be between 1s and {}s",
                MAX_HEARTBEAT_INTERVAL.as_secs()
            )));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::Invalid(
                "TLS_CERT and TLS_KEY must be set together".into(),
            ));
        }
        Ok(())
    }

    /// Cert and key paths when HTTPS is configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Errors that can occur when loading or validating config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Controller config file {} is world-readable (mode {:o}). \
             It may contain the token signing secret -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
