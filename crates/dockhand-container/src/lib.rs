// dockhand-container: the container engine interface consumed by the
// execution core, with a Docker CLI backend and an in-memory fake.

pub mod docker;
pub mod engine;
pub mod memory;

pub use docker::DockerCliEngine;
pub use engine::{
    ContainerCreateRequest, ContainerEngine, EngineError, EngineResult, ExecResult, ExecSpec,
    Health, HostInfo, HostProbe, NetworkInfo,
};
pub use memory::MemoryEngine;
