// Runner configuration: identity, workspace, container policy, inputs,
// logging, and event sourcing for a plan execution.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

/// Picks a container image from a job's `runs-on` labels. Takes precedence
/// over the platforms mapping when set.
pub type PlatformPicker = Arc<dyn Fn(&[String]) -> Option<String> + Send + Sync>;

/// Everything the core recognizes about how a plan should execute.
///
/// Shared read-only by every run context of a plan.
#[derive(Clone, Default)]
pub struct Config {
    // Identity.
    /// The user that triggered the event.
    pub actor: String,
    /// GitHub instance to target, default "github.com".
    pub github_instance: String,
    /// Name of the main branch of the repository.
    pub default_branch: String,
    /// Default instance actions are fetched from.
    pub default_action_instance: String,
    pub token: String,

    // Workspace.
    pub workdir: PathBuf,
    /// Bind the workdir into the job container instead of copying.
    pub bind_workdir: bool,
    /// Respect `.gitignore` when copying the workdir.
    pub use_gitignore: bool,

    // Container policy.
    pub force_pull: bool,
    pub force_rebuild: bool,
    pub reuse_containers: bool,
    pub auto_remove: bool,
    pub privileged: bool,
    pub userns_mode: String,
    pub container_cap_add: Vec<String>,
    pub container_cap_drop: Vec<String>,
    /// Desired os/arch platform for containers, e.g. "linux/amd64".
    pub container_architecture: String,
    pub container_daemon_socket: String,
    /// Raw extra options for the job container.
    pub container_options: String,
    pub container_name_prefix: String,
    /// Zero disables the lifetime watchdog.
    pub container_max_lifetime: Duration,
    pub container_network_mode: String,
    /// Label to image mapping used when the job has no container spec.
    pub platforms: HashMap<String, String>,
    pub platform_picker: Option<PlatformPicker>,

    // Inputs.
    pub secrets: HashMap<String, String>,
    pub vars: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub inputs: HashMap<String, String>,
    /// User matrix filter: dimension name to allowed stringified values.
    pub matrix_filter: HashMap<String, HashSet<String>>,

    // Logging.
    pub structured_logging: bool,
    /// Print secrets unmasked. Only for debugging.
    pub insecure_secrets: bool,
    /// Level of the per-job loggers; defaults to info.
    pub job_logger_level: Option<tracing::Level>,

    // Event.
    pub event_name: String,
    pub event_path: String,
    /// Inline event payload; overrides `event_path`.
    pub event_json: String,
    /// Preset github context, overriding the one derived from this config.
    pub preset_github_context: Option<serde_json::Value>,

    // Artifact server.
    pub artifact_server_path: String,
    pub artifact_server_addr: String,
    pub artifact_server_port: String,

    // Enterprise rewriting.
    pub replace_ghe_action_with_github_com: Vec<String>,
    pub replace_ghe_action_token_with_github_com: String,
}

/// Where a job container attaches, derived from the configured network mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    Host,
    None,
    Bridge,
    /// Share another container's network namespace.
    Container(String),
    /// Anything else, the empty string included: a per-job network is
    /// created and torn down around the job.
    UserDefined(String),
}

impl NetworkMode {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "host" => NetworkMode::Host,
            "none" => NetworkMode::None,
            "bridge" => NetworkMode::Bridge,
            other => match other.split_once(':') {
                Some(("container", id)) if !id.is_empty() => {
                    NetworkMode::Container(id.to_string())
                }
                _ => NetworkMode::UserDefined(other.to_string()),
            },
        }
    }

    pub fn is_user_defined(&self) -> bool {
        matches!(self, NetworkMode::UserDefined(_))
    }

    /// The `--network` value for container creation in the non-user-defined
    /// modes.
    pub fn fixed_network(&self) -> Option<String> {
        match self {
            NetworkMode::Host => Some("host".to_string()),
            NetworkMode::None => Some("none".to_string()),
            NetworkMode::Bridge => Some("bridge".to_string()),
            NetworkMode::Container(id) => Some(format!("container:{id}")),
            NetworkMode::UserDefined(_) => None,
        }
    }
}

impl Config {
    /// The token jobs see as `github.token`. A Gitea token wins over a
    /// GitHub one when both are present.
    pub fn get_token(&self) -> String {
        match self.secrets.get("GITEA_TOKEN") {
            Some(token) if !token.is_empty() => token.clone(),
            _ => self.secrets.get("GITHUB_TOKEN").cloned().unwrap_or_default(),
        }
    }

    pub fn network_mode(&self) -> NetworkMode {
        NetworkMode::parse(&self.container_network_mode)
    }

    /// The workdir path inside job containers.
    pub fn container_workdir(&self) -> String {
        "/workspace".to_string()
    }

    /// Materialize the event payload, in precedence order: the inline JSON,
    /// the event file, a synthesized `{"inputs": …}` payload, `{}`.
    pub fn materialize_event_json(&self) -> anyhow::Result<String> {
        if !self.event_json.is_empty() {
            return Ok(self.event_json.clone());
        }
        if !self.event_path.is_empty() {
            tracing::debug!("reading event payload from {}", self.event_path);
            return std::fs::read_to_string(&self.event_path)
                .with_context(|| format!("cannot read event file {}", self.event_path));
        }
        if !self.inputs.is_empty() {
            let event = serde_json::json!({ "inputs": self.inputs });
            return Ok(event.to_string());
        }
        Ok("{}".to_string())
    }

    /// Whether per-job loggers should emit debug lines.
    pub fn job_logger_debug(&self) -> bool {
        matches!(self.job_logger_level, Some(level) if level >= tracing::Level::DEBUG)
    }

    /// Resolve the image for a job that has no container spec, from its
    /// `runs-on` labels. The platform picker takes precedence; otherwise the
    /// first label with a mapping wins.
    pub fn pick_platform(&self, labels: &[String]) -> Option<String> {
        if let Some(ref picker) = self.platform_picker {
            if let Some(image) = picker(labels) {
                return Some(image);
            }
        }
        labels
            .iter()
            .find_map(|label| self.platforms.get(&label.to_lowercase()).cloned())
            .filter(|image| !image.is_empty())
    }
}
