// In-memory engine backend. Records every operation and lets tests inject
// failures, programmed exec results, and artificial latency.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    ContainerCreateRequest, ContainerEngine, EngineError, EngineResult, ExecResult, ExecSpec,
    Health, HostInfo, HostProbe, NetworkInfo,
};

#[derive(Debug, Clone)]
struct ContainerRecord {
    name: String,
    image: String,
    network: Option<String>,
    running: bool,
}

#[derive(Clone)]
struct ExecStub {
    pattern: String,
    result: ExecResult,
    delay: Option<Duration>,
}

#[derive(Default)]
struct MemoryState {
    images: HashSet<String>,
    containers: HashMap<String, ContainerRecord>,
    networks: HashMap<String, NetworkInfo>,
    operations: Vec<String>,
    fail_on: HashMap<String, String>,
    exec_results: VecDeque<ExecResult>,
    exec_stubs: Vec<ExecStub>,
    health_sequence: VecDeque<Health>,
    next_id: usize,
    live_execs: usize,
    max_live_execs: usize,
    live_containers: usize,
    max_live_containers: usize,
}

/// A fake engine whose whole world lives in process memory.
///
/// Cloning shares the underlying state, so a test can keep a handle while
/// the core owns another.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<MemoryState>>,
    exec_delay: Option<Duration>,
    ncpu: usize,
    probe_fails: bool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            exec_delay: None,
            ncpu: 4,
            probe_fails: false,
        }
    }

    /// Every exec sleeps this long, so concurrency windows overlap in tests.
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    pub fn with_ncpu(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu;
        self
    }

    /// Make the host probe report an error.
    pub fn with_failing_probe(mut self) -> Self {
        self.probe_fails = true;
        self
    }

    /// Make the named operation fail with the given message from now on.
    pub fn fail_on(&self, operation: &str, message: &str) {
        self.state
            .lock()
            .fail_on
            .insert(operation.to_string(), message.to_string());
    }

    /// Queue a programmed exec result; execs beyond the queue succeed with
    /// empty output.
    pub fn push_exec_result(&self, result: ExecResult) {
        self.state.lock().exec_results.push_back(result);
    }

    /// Pin the result of any exec whose command line contains `pattern`.
    /// Stubbed execs skip the engine-wide delay unless one is given here.
    pub fn stub_exec(&self, pattern: &str, result: ExecResult) {
        self.state.lock().exec_stubs.push(ExecStub {
            pattern: pattern.to_string(),
            result,
            delay: None,
        });
    }

    /// Queue health answers returned by successive `container_health` calls.
    pub fn push_health(&self, health: Health) {
        self.state.lock().health_sequence.push_back(health);
    }

    /// Ordered log of every operation performed against this engine.
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    /// Peak number of concurrently running execs.
    pub fn max_live_execs(&self) -> usize {
        self.state.lock().max_live_execs
    }

    /// Peak number of concurrently running containers.
    pub fn max_live_containers(&self) -> usize {
        self.state.lock().max_live_containers
    }

    /// Names of networks currently present.
    pub fn network_names(&self) -> Vec<String> {
        self.state.lock().networks.keys().cloned().collect()
    }

    /// Names of containers still present (not removed).
    pub fn container_names(&self) -> Vec<String> {
        self.state
            .lock()
            .containers
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    fn record(&self, operation: String, cancel: &CancellationToken) -> EngineResult<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut state = self.state.lock();
        let op_name = operation
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        state.operations.push(operation);
        if let Some(message) = state.fail_on.get(&op_name) {
            let message = message.clone();
            return Err(EngineError::Container(message));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn image_exists(&self, image: &str, cancel: &CancellationToken) -> EngineResult<bool> {
        self.record(format!("image_exists {image}"), cancel)?;
        Ok(self.state.lock().images.contains(image))
    }

    async fn pull_image(
        &self,
        image: &str,
        _platform: Option<&str>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        self.record(format!("pull_image {image}"), cancel)
            .map_err(|error| match error {
                EngineError::Container(message) => EngineError::Pull {
                    image: image.to_string(),
                    message,
                },
                other => other,
            })?;
        self.state.lock().images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(
        &self,
        request: &ContainerCreateRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<String> {
        self.record(format!("create_container {}", request.name), cancel)?;
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            ContainerRecord {
                name: request.name.clone(),
                image: request.image.clone(),
                network: request.network.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn find_container(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<String>> {
        self.record(format!("find_container {name}"), cancel)?;
        let state = self.state.lock();
        Ok(state
            .containers
            .iter()
            .find(|(_, container)| container.name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn start_container(&self, id: &str, cancel: &CancellationToken) -> EngineResult<()> {
        self.record(format!("start_container {id}"), cancel)?;
        let mut state = self.state.lock();
        let Some(container) = state.containers.get_mut(id) else {
            return Err(EngineError::Container(format!("no such container: {id}")));
        };
        if container.running {
            // Starting an already-running container is a no-op.
            return Ok(());
        }
        container.running = true;
        state.live_containers += 1;
        state.max_live_containers = state.max_live_containers.max(state.live_containers);
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> EngineResult<ExecResult> {
        self.record(format!("exec {id} {}", spec.cmd.join(" ")), cancel)?;
        let command_line = spec.cmd.join(" ");
        let (result, delay) = {
            let mut state = self.state.lock();
            if !state.containers.contains_key(id) {
                return Err(EngineError::Exec(format!("no such container: {id}")));
            }
            state.live_execs += 1;
            state.max_live_execs = state.max_live_execs.max(state.live_execs);

            let stub = state
                .exec_stubs
                .iter()
                .find(|stub| command_line.contains(&stub.pattern))
                .cloned();
            match stub {
                Some(stub) => (stub.result, stub.delay),
                None => (
                    state.exec_results.pop_front().unwrap_or_default(),
                    self.exec_delay,
                ),
            }
        };

        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    self.state.lock().live_execs -= 1;
                    return Err(EngineError::Cancelled);
                }
            }
        }

        let mut state = self.state.lock();
        state.live_execs -= 1;
        Ok(result)
    }

    async fn copy_to_container(
        &self,
        id: &str,
        source: &Path,
        destination: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        self.record(
            format!("copy_to_container {id} {} {destination}", source.display()),
            cancel,
        )
    }

    async fn copy_from_container(
        &self,
        id: &str,
        source: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        self.record(
            format!("copy_from_container {id} {source} {}", destination.display()),
            cancel,
        )
    }

    async fn remove_container(
        &self,
        id: &str,
        _force: bool,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        self.record(format!("remove_container {id}"), cancel)?;
        let mut state = self.state.lock();
        if let Some(container) = state.containers.remove(id) {
            if container.running {
                state.live_containers -= 1;
            }
        }
        Ok(())
    }

    async fn container_health(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Health> {
        self.record(format!("container_health {id}"), cancel)?;
        Ok(self
            .state
            .lock()
            .health_sequence
            .pop_front()
            .unwrap_or(Health::None))
    }

    async fn network_create(
        &self,
        name: &str,
        inherit_driver_opts: &[String],
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        self.record(
            format!("network_create {name} [{}]", inherit_driver_opts.join(",")),
            cancel,
        )
        .map_err(|error| match error {
            EngineError::Container(message) => EngineError::Network(message),
            other => other,
        })?;
        self.state.lock().networks.insert(
            name.to_string(),
            NetworkInfo {
                id: format!("net-{name}"),
                driver: "bridge".to_string(),
                options: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn network_inspect(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<NetworkInfo> {
        self.record(format!("network_inspect {name}"), cancel)?;
        self.state
            .lock()
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Network(format!("no such network: {name}")))
    }

    async fn network_remove(&self, name: &str, cancel: &CancellationToken) -> EngineResult<()> {
        self.record(format!("network_remove {name}"), cancel)?;
        self.state.lock().networks.remove(name);
        Ok(())
    }
}

#[async_trait]
impl HostProbe for MemoryEngine {
    async fn host_info(&self, cancel: &CancellationToken) -> EngineResult<HostInfo> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.probe_fails {
            return Err(EngineError::Unavailable("probe disabled".to_string()));
        }
        Ok(HostInfo {
            ncpu: self.ncpu,
            os: "linux".to_string(),
            arch: "amd64".to_string(),
        })
    }
}
