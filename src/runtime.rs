//! Container runtime seam for worker execution units.
//!
//! The controller never talks to Docker directly; it goes through
//! [`ContainerRuntime`] so lifecycle logic can be exercised against an
//! in-memory fake. [`DockerRuntime`] is the production implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;

pub const LABEL_SESSION_ID: &str = "byoc.session-id";
pub const LABEL_USER_ID: &str = "byoc.user-id";
pub const LABEL_INSTANCE_ID: &str = "byoc.instance-id";
pub const LABEL_KIND: &str = "byoc.kind";
/// Hostname of the controller that created the unit. Informational only.
pub const LABEL_CONTROLLER: &str = "byoc.controller";
pub const KIND_SESSION_WORKER: &str = "session-worker";

/// Everything needed to create one worker unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    /// Published 1:1 on the host (container port == host port).
    pub port: u16,
    pub memory_bytes: i64,
    pub cpu_shares: i64,
    pub network: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
}

impl UnitSummary {
    pub fn session_id(&self) -> Option<&str> {
        self.labels.get(LABEL_SESSION_ID).map(String::as_str)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("{op} failed for {unit}: {message}")]
    Operation {
        op: &'static str,
        unit: String,
        message: String,
    },
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a unit. Returns its id.
    async fn create(&self, spec: &UnitSpec) -> Result<String, RuntimeError>;
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;
    /// Graceful stop with `grace` before the runtime kills it. A unit that is
    /// already stopped or gone counts as success.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;
    /// Force-remove. A unit that no longer exists counts as success.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
    /// All units (running or not) carrying `key=value`.
    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<UnitSummary>, RuntimeError>;
}

/// Container name for a session's worker. Session ids are caller supplied,
/// so anything outside `[A-Za-z0-9_.-]` is replaced.
pub fn unit_name(session_id: &str) -> String {
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(40)
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("byoc-worker-{}-{}", sanitized, &suffix[..8])
}

/// Labels stamped on every worker unit.
pub fn worker_labels(session_id: &str, user_id: &str, instance_id: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_SESSION_ID.to_string(), session_id.to_string());
    labels.insert(LABEL_USER_ID.to_string(), user_id.to_string());
    labels.insert(LABEL_INSTANCE_ID.to_string(), instance_id.to_string());
    labels.insert(LABEL_KIND.to_string(), KIND_SESSION_WORKER.to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    labels.insert(LABEL_CONTROLLER.to_string(), host);
    labels
}

// ── Docker ─────────────────────────────────────────────────────────

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect_local() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

fn status_code(error: &bollard::errors::Error) -> Option<u16> {
    match error {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn container_config(spec: &UnitSpec) -> Config<String> {
    let port_key = format!("{}/tcp", spec.port);
    let mut exposed = HashMap::new();
    exposed.insert(port_key.clone(), HashMap::new());
    let mut bindings = HashMap::new();
    bindings.insert(
        port_key,
        Some(vec![PortBinding {
            host_ip: None,
            host_port: Some(spec.port.to_string()),
        }]),
    );

    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(exposed),
        host_config: Some(HostConfig {
            port_bindings: Some(bindings),
            memory: Some(spec.memory_bytes),
            cpu_shares: Some(spec.cpu_shares),
            network_mode: spec.network.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &UnitSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await?;
        for warning in &response.warnings {
            tracing::warn!(unit = %spec.name, %warning, "docker create warning");
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped. 404: already gone.
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => {
                tracing::debug!(unit_id = id, "unit already stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<UnitSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{key}={value}")]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(UnitSummary {
                    id: c.id?,
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }
}
