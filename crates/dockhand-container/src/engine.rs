// The container engine interface the execution core is written against.
// Two backends implement it: the Docker CLI client and an in-memory fake.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by a container engine backend.
///
/// The execution core does not retry; these are passed through verbatim
/// and become job failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to pull image '{image}': {message}")]
    Pull { image: String, message: String },

    #[error("container operation failed: {0}")]
    Container(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("network operation failed: {0}")]
    Network(String),

    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine operation cancelled")]
    Cancelled,
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Everything needed to create a job or service container.
#[derive(Debug, Clone, Default)]
pub struct ContainerCreateRequest {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    /// Network to attach, or `None` for the engine default.
    pub network: Option<String>,
    /// Aliases under which this container is reachable on its network.
    pub network_aliases: Vec<String>,
    /// Bind mounts in `host:container` form.
    pub binds: Vec<String>,
    /// Port publications in `host:container` form.
    pub ports: Vec<String>,
    pub privileged: bool,
    pub userns_mode: Option<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    /// Target platform, e.g. `linux/amd64`.
    pub platform: Option<String>,
    /// Raw extra options forwarded to the backend.
    pub options: Vec<String>,
    pub auto_remove: bool,
}

/// A command to run inside an existing container.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
}

/// Outcome of an exec: exit code plus captured output lines.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i32,
    pub output: Vec<String>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Health of a running container as reported by its healthcheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// The healthcheck has not concluded yet.
    Starting,
    Healthy,
    Unhealthy,
    /// The container defines no healthcheck.
    None,
}

/// A named network as seen by the engine.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    pub id: String,
    pub driver: String,
    pub options: HashMap<String, String>,
}

/// Host capacity as reported by the engine daemon.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub ncpu: usize,
    pub os: String,
    pub arch: String,
}

/// The container primitives the execution core consumes.
///
/// All operations take a cancellation token and are expected to honor it.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// True when the image is already present locally.
    async fn image_exists(&self, image: &str, cancel: &CancellationToken) -> EngineResult<bool>;

    async fn pull_image(
        &self,
        image: &str,
        platform: Option<&str>,
        cancel: &CancellationToken,
    ) -> EngineResult<()>;

    /// Create a container and return its id.
    async fn create_container(
        &self,
        request: &ContainerCreateRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<String>;

    /// Look up a container (running or stopped) by its exact name and
    /// return its id when present.
    async fn find_container(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<String>>;

    async fn start_container(&self, id: &str, cancel: &CancellationToken) -> EngineResult<()>;

    async fn exec(
        &self,
        id: &str,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> EngineResult<ExecResult>;

    async fn copy_to_container(
        &self,
        id: &str,
        source: &Path,
        destination: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<()>;

    async fn copy_from_container(
        &self,
        id: &str,
        source: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> EngineResult<()>;

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> EngineResult<()>;

    async fn container_health(&self, id: &str, cancel: &CancellationToken)
        -> EngineResult<Health>;

    /// Create a bridge network, inheriting the listed driver options from
    /// the engine's default bridge.
    async fn network_create(
        &self,
        name: &str,
        inherit_driver_opts: &[String],
        cancel: &CancellationToken,
    ) -> EngineResult<()>;

    async fn network_inspect(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<NetworkInfo>;

    async fn network_remove(&self, name: &str, cancel: &CancellationToken) -> EngineResult<()>;
}

/// Reports host capacity. Consulted once per stage to bound cross-job
/// parallelism.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn host_info(&self, cancel: &CancellationToken) -> EngineResult<HostInfo>;
}
