// Docker CLI backend. Drives the `docker` binary through tokio::process,
// honoring cancellation by killing the in-flight invocation.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    ContainerCreateRequest, ContainerEngine, EngineError, EngineResult, ExecResult, ExecSpec,
    Health, HostInfo, HostProbe, NetworkInfo,
};

/// A container engine backed by the Docker CLI.
pub struct DockerCliEngine {
    docker_path: String,
    daemon_socket: Option<String>,
}

struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl Default for DockerCliEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCliEngine {
    pub fn new() -> Self {
        Self {
            docker_path: "docker".to_string(),
            daemon_socket: None,
        }
    }

    /// Point the client at a non-default daemon socket.
    pub fn with_daemon_socket(mut self, socket: impl Into<String>) -> Self {
        let socket = socket.into();
        if !socket.is_empty() {
            self.daemon_socket = Some(socket);
        }
        self
    }

    async fn run(&self, args: &[String], cancel: &CancellationToken) -> EngineResult<CommandOutput> {
        tracing::debug!(target: "docker", "docker {}", args.join(" "));

        let mut command = Command::new(&self.docker_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref socket) = self.daemon_socket {
            command.env("DOCKER_HOST", socket);
        }

        let child = command
            .spawn()
            .map_err(|error| EngineError::Unavailable(format!("cannot spawn docker: {error}")))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|error| EngineError::Unavailable(format!("docker did not finish: {error}")))?,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a command where a non-zero exit is an engine failure.
    async fn run_checked(
        &self,
        args: &[String],
        cancel: &CancellationToken,
        describe: impl FnOnce(String) -> EngineError,
    ) -> EngineResult<String> {
        let output = self.run(args, cancel).await?;
        if output.exit_code != 0 {
            let message = if output.stderr.trim().is_empty() {
                format!("exit code {}", output.exit_code)
            } else {
                output.stderr.trim().to_string()
            };
            return Err(describe(message));
        }
        Ok(output.stdout)
    }

    fn owned(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }
}

#[async_trait]
impl ContainerEngine for DockerCliEngine {
    async fn image_exists(&self, image: &str, cancel: &CancellationToken) -> EngineResult<bool> {
        let args = Self::owned(&["image", "inspect", "--format", "{{.Id}}", image]);
        let output = self.run(&args, cancel).await?;
        Ok(output.exit_code == 0)
    }

    async fn pull_image(
        &self,
        image: &str,
        platform: Option<&str>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let mut args = vec!["pull".to_string()];
        if let Some(platform) = platform {
            if !platform.is_empty() {
                args.push("--platform".to_string());
                args.push(platform.to_string());
            }
        }
        args.push(image.to_string());

        self.run_checked(&args, cancel, |message| EngineError::Pull {
            image: image.to_string(),
            message,
        })
        .await?;
        Ok(())
    }

    async fn create_container(
        &self,
        request: &ContainerCreateRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<String> {
        let mut args = vec!["create".to_string()];

        if !request.name.is_empty() {
            args.push("--name".to_string());
            args.push(request.name.clone());
        }
        if let Some(ref network) = request.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for alias in &request.network_aliases {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
        if let Some(ref platform) = request.platform {
            args.push("--platform".to_string());
            args.push(platform.clone());
        }
        if let Some(ref working_dir) = request.working_dir {
            args.push("--workdir".to_string());
            args.push(working_dir.clone());
        }
        if request.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(ref userns) = request.userns_mode {
            args.push("--userns".to_string());
            args.push(userns.clone());
        }
        for cap in &request.cap_add {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }
        for cap in &request.cap_drop {
            args.push("--cap-drop".to_string());
            args.push(cap.clone());
        }
        if request.auto_remove {
            args.push("--rm".to_string());
        }
        for (key, value) in &request.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        for bind in &request.binds {
            args.push("--volume".to_string());
            args.push(bind.clone());
        }
        for port in &request.ports {
            args.push("--publish".to_string());
            args.push(port.clone());
        }
        for option in &request.options {
            args.push(option.clone());
        }
        if !request.entrypoint.is_empty() {
            args.push("--entrypoint".to_string());
            args.push(request.entrypoint[0].clone());
        }
        args.push(request.image.clone());
        if request.entrypoint.len() > 1 {
            args.extend(request.entrypoint[1..].iter().cloned());
        }
        args.extend(request.cmd.iter().cloned());

        let stdout = self
            .run_checked(&args, cancel, EngineError::Container)
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn find_container(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<String>> {
        let args = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("name=^/{name}$"),
        ];
        let stdout = self
            .run_checked(&args, cancel, EngineError::Container)
            .await?;
        Ok(stdout
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|id| !id.is_empty()))
    }

    async fn start_container(&self, id: &str, cancel: &CancellationToken) -> EngineResult<()> {
        let args = Self::owned(&["start", id]);
        self.run_checked(&args, cancel, EngineError::Container)
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> EngineResult<ExecResult> {
        let mut args = vec!["exec".to_string()];
        if let Some(ref working_dir) = spec.working_dir {
            args.push("--workdir".to_string());
            args.push(working_dir.clone());
        }
        if let Some(ref user) = spec.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(id.to_string());
        args.extend(spec.cmd.iter().cloned());

        let output = self.run(&args, cancel).await?;

        let mut lines: Vec<String> = output.stdout.lines().map(|l| l.to_string()).collect();
        lines.extend(output.stderr.lines().map(|l| l.to_string()));

        Ok(ExecResult {
            exit_code: output.exit_code,
            output: lines,
        })
    }

    async fn copy_to_container(
        &self,
        id: &str,
        source: &Path,
        destination: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let args = vec![
            "cp".to_string(),
            source.display().to_string(),
            format!("{id}:{destination}"),
        ];
        self.run_checked(&args, cancel, EngineError::Container)
            .await?;
        Ok(())
    }

    async fn copy_from_container(
        &self,
        id: &str,
        source: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let args = vec![
            "cp".to_string(),
            format!("{id}:{source}"),
            destination.display().to_string(),
        ];
        self.run_checked(&args, cancel, EngineError::Container)
            .await?;
        Ok(())
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push("--volumes".to_string());
        args.push(id.to_string());
        self.run_checked(&args, cancel, EngineError::Container)
            .await?;
        Ok(())
    }

    async fn container_health(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Health> {
        let args = Self::owned(&["inspect", "--format", "{{json .State.Health}}", id]);
        let stdout = self
            .run_checked(&args, cancel, EngineError::Container)
            .await?;

        let value: serde_json::Value = serde_json::from_str(stdout.trim())
            .map_err(|error| EngineError::Container(format!("bad health payload: {error}")))?;
        if value.is_null() {
            return Ok(Health::None);
        }
        match value.get("Status").and_then(|s| s.as_str()) {
            Some("healthy") => Ok(Health::Healthy),
            Some("unhealthy") => Ok(Health::Unhealthy),
            Some("starting") => Ok(Health::Starting),
            other => Err(EngineError::Container(format!(
                "unknown health status {other:?}"
            ))),
        }
    }

    async fn network_create(
        &self,
        name: &str,
        inherit_driver_opts: &[String],
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let mut args = Self::owned(&["network", "create", "--driver", "bridge"]);

        if !inherit_driver_opts.is_empty() {
            let bridge = self.network_inspect("bridge", cancel).await?;
            for key in inherit_driver_opts {
                if let Some(value) = bridge.options.get(key) {
                    args.push("--opt".to_string());
                    args.push(format!("{key}={value}"));
                }
            }
        }

        args.push(name.to_string());
        self.run_checked(&args, cancel, EngineError::Network)
            .await?;
        Ok(())
    }

    async fn network_inspect(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<NetworkInfo> {
        let args = Self::owned(&["network", "inspect", "--format", "{{json .}}", name]);
        let stdout = self.run_checked(&args, cancel, EngineError::Network).await?;

        let value: serde_json::Value = serde_json::from_str(stdout.trim())
            .map_err(|error| EngineError::Network(format!("bad network payload: {error}")))?;

        let mut options = HashMap::new();
        if let Some(object) = value.get("Options").and_then(|o| o.as_object()) {
            for (key, val) in object {
                if let Some(val) = val.as_str() {
                    options.insert(key.clone(), val.to_string());
                }
            }
        }

        Ok(NetworkInfo {
            id: value
                .get("Id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            driver: value
                .get("Driver")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            options,
        })
    }

    async fn network_remove(&self, name: &str, cancel: &CancellationToken) -> EngineResult<()> {
        let args = Self::owned(&["network", "rm", name]);
        self.run_checked(&args, cancel, EngineError::Network)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HostProbe for DockerCliEngine {
    async fn host_info(&self, cancel: &CancellationToken) -> EngineResult<HostInfo> {
        let args = Self::owned(&["info", "--format", "{{json .}}"]);
        let stdout = self
            .run_checked(&args, cancel, EngineError::Unavailable)
            .await?;

        let value: serde_json::Value = serde_json::from_str(stdout.trim())
            .map_err(|error| EngineError::Unavailable(format!("bad info payload: {error}")))?;

        Ok(HostInfo {
            ncpu: value.get("NCPU").and_then(|v| v.as_u64()).unwrap_or(1) as usize,
            os: value
                .get("OSType")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            arch: value
                .get("Architecture")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}
