//! Container runtime abstraction.
//!
//! A step's agent runs exactly once through [`ContainerRuntime::run`]: a
//! single blocking call with an explicit deadline and cancellation. There
//! is no streaming surface at this boundary. Runtime-side failures (image
//! pull, daemon errors) are [`ContainerError`]s and never look like an
//! agent-produced exit code.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod docker;

pub use docker::DockerRuntime;

/// Exit code reported when the deadline expired and the container was
/// forcibly stopped. A normal result, not an orchestration failure.
pub const EXIT_CODE_DEADLINE: i64 = 124;
/// Exit code reported when the caller cancelled the run.
pub const EXIT_CODE_CANCELLED: i64 = 130;
/// Synthetic exit code recorded when the step aborted host-side before or
/// outside the container run.
pub const EXIT_CODE_HOST_FAILURE: i64 = -1;

/// A host directory or file mapped into the container.
#[derive(Debug, Clone)]
pub struct Mount {
    /// Path on the host.
    pub host_path: PathBuf,
    /// Path inside the container.
    pub container_path: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// Everything needed to launch one isolated agent run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Container name (stable per step, useful in `docker ps` output).
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables, fully resolved.
    pub env: Vec<(String, String)>,
    /// Volume mounts.
    pub mounts: Vec<Mount>,
    /// Wall-clock budget; the container is force-stopped at expiry.
    pub deadline: Duration,
    /// Override of the image's default command.
    pub command: Option<Vec<String>>,
    /// Memory limit in MiB.
    pub memory_mb: Option<u32>,
    /// CPU limit in cores.
    pub cpu_cores: Option<f64>,
}

/// Outcome of a container run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Exit code: the agent's own, or [`EXIT_CODE_DEADLINE`] /
    /// [`EXIT_CODE_CANCELLED`] when the run was stopped.
    pub exit_code: i64,
    /// Combined stdout and stderr, capped at the configured limit.
    pub output: String,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl RunResult {
    /// True when the agent exited zero within the deadline.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors produced by the container runtime itself.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The image could not be pulled or inspected.
    #[error("container image unavailable: {0}")]
    Image(String),
    /// Daemon or API failure.
    #[error("container runtime failure: {0}")]
    Infrastructure(String),
}

impl From<ContainerError> for crate::error::CoreError {
    fn from(err: ContainerError) -> Self {
        Self::Host(err.to_string())
    }
}

/// Launch an isolated process with mounted volumes, capture its exit code
/// and output, honor a deadline.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run the container to completion (or deadline, or cancellation).
    async fn run(
        &self,
        spec: RunSpec,
        cancel: &CancellationToken,
    ) -> Result<RunResult, ContainerError>;

    /// Whether the runtime is reachable.
    async fn available(&self) -> bool;
}
