//! Docker-backed [`ContainerRuntime`] implementation.
//!
//! One disposable container per step run. The container is created, run to
//! completion (or force-stopped at the deadline / on cancellation), its
//! logs collected up to a byte cap, and then force-removed on every path.

use std::time::{Duration, Instant};

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ContainerError, ContainerRuntime, RunResult, RunSpec, EXIT_CODE_CANCELLED, EXIT_CODE_DEADLINE,
};

/// Docker Engine API runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    pull_timeout: Duration,
    max_output_bytes: usize,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::Infrastructure`] when the daemon socket
    /// cannot be opened.
    pub fn new(pull_timeout: Duration, max_output_bytes: usize) -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::Infrastructure(e.to_string()))?;
        Ok(Self {
            docker,
            pull_timeout,
            max_output_bytes,
        })
    }

    /// Ensure `image` exists locally, pulling it within the pull budget.
    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        debug!(image, "pulling container image");
        let options = CreateImageOptions {
            from_image: image.to_owned(),
            ..Default::default()
        };
        let pull = async {
            let mut stream = self.docker.create_image(Some(options), None, None);
            while let Some(progress) = stream.next().await {
                progress.map_err(|e| ContainerError::Image(e.to_string()))?;
            }
            Ok::<(), ContainerError>(())
        };
        tokio::time::timeout(self.pull_timeout, pull)
            .await
            .map_err(|_| {
                ContainerError::Image(format!(
                    "pull of {image} exceeded {}s budget",
                    self.pull_timeout.as_secs()
                ))
            })?
    }

    /// Collect the container's combined output, capped at the byte limit.
    async fn collect_logs(&self, name: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut output = String::new();
        let mut truncated = false;
        while let Some(chunk) = stream.next().await {
            let message = match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => message,
                Ok(_) => continue,
                Err(e) => {
                    warn!(container = name, error = %e, "log collection interrupted");
                    break;
                }
            };
            let remaining = self.max_output_bytes.saturating_sub(output.len());
            if remaining == 0 {
                truncated = true;
                break;
            }
            let text = String::from_utf8_lossy(&message);
            if text.len() > remaining {
                let mut cut = remaining;
                while cut > 0 && !text.is_char_boundary(cut) {
                    cut = cut.saturating_sub(1);
                }
                output.push_str(&text[..cut]);
                truncated = true;
                break;
            }
            output.push_str(&text);
        }
        if truncated {
            output.push_str("\n[output truncated]");
        }
        output
    }

    async fn remove(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            match e {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => {}
                other => warn!(container = name, error = %other, "container removal failed"),
            }
        }
    }

    fn build_config(spec: &RunSpec) -> Result<ContainerConfig<String>, ContainerError> {
        let binds = spec
            .mounts
            .iter()
            .map(|m| {
                let suffix = if m.read_only { ":ro" } else { "" };
                format!("{}:{}{suffix}", m.host_path.display(), m.container_path)
            })
            .collect();

        let memory = spec
            .memory_mb
            .map(|mb| i64::from(mb).saturating_mul(1024).saturating_mul(1024));
        let nano_cpus = spec.cpu_cores.map(nano_cpus).transpose()?;

        let host_config = HostConfig {
            binds: Some(binds),
            memory,
            nano_cpus,
            security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
            ..Default::default()
        };

        Ok(ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        })
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(
        &self,
        spec: RunSpec,
        cancel: &CancellationToken,
    ) -> Result<RunResult, ContainerError> {
        let start = Instant::now();
        self.ensure_image(&spec.image).await?;

        let config = Self::build_config(&spec)?;
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });
        self.docker
            .create_container(options, config)
            .await
            .map_err(|e| ContainerError::Infrastructure(e.to_string()))?;

        let result = self.run_created(&spec, cancel, start).await;
        self.remove(&spec.name).await;
        result
    }

    async fn available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

impl DockerRuntime {
    async fn run_created(
        &self,
        spec: &RunSpec,
        cancel: &CancellationToken,
        start: Instant,
    ) -> Result<RunResult, ContainerError> {
        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::Infrastructure(e.to_string()))?;

        let mut wait = self
            .docker
            .wait_container(&spec.name, None::<WaitContainerOptions<String>>);

        let exit_code = tokio::select! {
            waited = wait.next() => match waited {
                Some(Ok(response)) => response.status_code,
                // The wait stream reports nonzero exits as an error variant
                // that still carries the status code.
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => {
                    return Err(ContainerError::Infrastructure(e.to_string()));
                }
                None => {
                    return Err(ContainerError::Infrastructure(
                        "container wait stream ended without a status".to_owned(),
                    ));
                }
            },
            () = tokio::time::sleep(spec.deadline) => {
                debug!(container = %spec.name, "deadline expired, force-stopping");
                EXIT_CODE_DEADLINE
            }
            () = cancel.cancelled() => {
                debug!(container = %spec.name, "run cancelled, force-stopping");
                EXIT_CODE_CANCELLED
            }
        };

        let output = self.collect_logs(&spec.name).await;
        Ok(RunResult {
            exit_code,
            output,
            duration: start.elapsed(),
        })
    }
}

/// Largest core count a profile may request.
const MAX_CPU_CORES: f64 = 4096.0;

/// Convert a fractional core count to Docker's nano-CPU unit.
///
/// Docker's resolution is 1e-9 cores; anything that rounds below one nano
/// CPU is rejected rather than silently becoming "unlimited".
fn nano_cpus(cpu_cores: f64) -> Result<i64, ContainerError> {
    if !cpu_cores.is_finite() || cpu_cores <= 0.0 || cpu_cores > MAX_CPU_CORES {
        return Err(ContainerError::Infrastructure(format!(
            "cpu_cores must be a positive core count up to {MAX_CPU_CORES}, got {cpu_cores}"
        )));
    }
    let nanos = (cpu_cores * 1e9).round();
    if nanos < 1.0 {
        return Err(ContainerError::Infrastructure(format!(
            "cpu_cores {cpu_cores} is below the 1e-9 core resolution"
        )));
    }
    // The range guard above bounds the product at 4.096e12, inside i64.
    #[allow(clippy::cast_possible_truncation)]
    Ok(nanos as i64)
}
