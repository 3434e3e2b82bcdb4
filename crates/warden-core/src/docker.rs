//! Docker implementation of [`ContainerDriver`] via bollard.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    LogOutput, RemoveContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::driver::{
    split_cwd_marker, wrap_command, ContainerDriver, ContainerSpec, ContainerState,
    ContainerStatus, ContainerSummary, DriverError, ExecOutput,
};
use warden_store::protocol;

/// Retry schedule for idempotent engine calls that hit transient transport
/// failures. Non-idempotent calls (create, exec) are never retried here.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

pub struct DockerDriver {
    docker: Docker,
    /// Unix user commands are exec'd as inside the sandbox.
    exec_user: String,
}

impl DockerDriver {
    pub fn connect(exec_user: impl Into<String>) -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| DriverError::EngineUnavailable(err.into()))?;
        Ok(Self {
            docker,
            exec_user: exec_user.into(),
        })
    }

    async fn inspect_raw(&self, container_id: &str) -> Result<ContainerStatus, DriverError> {
        let response = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| map_engine_error(container_id, err))?;

        let state = response.state.unwrap_or_default();
        let status = match state.status {
            Some(ContainerStateStatusEnum::CREATED) => ContainerState::Created,
            Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            Some(ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
            Some(ContainerStateStatusEnum::DEAD) => ContainerState::Dead,
            _ => ContainerState::Unknown,
        };
        let started_at = state
            .started_at
            .as_deref()
            .and_then(parse_engine_timestamp);

        Ok(ContainerStatus {
            state: status,
            exit_code: state.exit_code,
            started_at,
        })
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, DriverError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let mut host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes),
            nano_cpus: Some(spec.limits.cpu_millis * 1_000_000),
            ..HostConfig::default()
        };
        if spec.limits.disk_bytes > 0 {
            // Only honored by storage drivers with project quotas; the engine
            // rejects it otherwise, which surfaces as a create failure.
            host_config.storage_opt = Some(HashMap::from([(
                "size".to_string(),
                spec.limits.disk_bytes.to_string(),
            )]));
        }

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Config::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await;

        match created {
            Ok(response) => Ok(response.id),
            Err(err) => {
                // Leave no half-created container behind; the name is also a
                // valid removal handle when the server got that far.
                let _ = self
                    .docker
                    .remove_container(
                        &spec.name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..RemoveContainerOptions::default()
                        }),
                    )
                    .await;
                Err(map_engine_error(&spec.name, err))
            }
        }
    }

    async fn start(&self, container_id: &str) -> Result<(), DriverError> {
        self.docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(|err| map_engine_error(container_id, err))
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, DriverError> {
        with_retries(|| self.inspect_raw(container_id)).await
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &str,
        cwd: &str,
        deadline: Duration,
    ) -> Result<ExecOutput, DriverError> {
        if command.is_empty() || command.len() > crate::driver::MAX_COMMAND_BYTES {
            return Err(DriverError::InvalidInput(format!(
                "command must be between 1 and {} bytes",
                crate::driver::MAX_COMMAND_BYTES
            )));
        }

        // Refuse up front rather than letting the engine race a dying
        // container into a half-run.
        let status = self.inspect(container_id).await?;
        if status.state != ContainerState::Running {
            return Err(DriverError::NotFound(container_id.to_string()));
        }

        let script = wrap_command(command, cwd);
        let exec = self
            .docker
            .create_exec::<String>(
                container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some(self.exec_user.clone()),
                    cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
                    ..CreateExecOptions::default()
                },
            )
            .await
            .map_err(|err| map_engine_error(container_id, err))?;

        let collect = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            match self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|err| map_engine_error(container_id, err))?
            {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(chunk) = output.next().await {
                        match chunk.map_err(|err| map_engine_error(container_id, err))? {
                            LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                            LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                            _ => {}
                        }
                    }
                }
                StartExecResults::Detached => {}
            }
            Ok::<_, DriverError>((stdout, stderr))
        };

        let (stdout_raw, stderr_raw) = tokio::time::timeout(deadline, collect)
            .await
            .map_err(|_| DriverError::Timeout(deadline))??;

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|err| map_engine_error(container_id, err))?;

        let (stdout, new_cwd) = split_cwd_marker(&String::from_utf8_lossy(&stdout_raw));
        debug!(container = container_id, exit_code = ?inspect.exit_code, "exec finished");

        Ok(ExecOutput {
            exit_code: inspect.exit_code,
            stdout,
            stderr: String::from_utf8_lossy(&stderr_raw).to_string(),
            new_cwd,
        })
    }

    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<(), DriverError> {
        let result = self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            // Already stopped (304) or already gone (404): stop is
            // best-effort and both count as success.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(err) => Err(map_engine_error(container_id, err)),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), DriverError> {
        let result = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..RemoveContainerOptions::default()
                }),
            )
            .await;

        match result {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(map_engine_error(container_id, err)),
        }
    }

    async fn list_labelled(&self) -> Result<Vec<ContainerSummary>, DriverError> {
        with_retries(|| async {
            let filters = HashMap::from([(
                "label".to_string(),
                vec![format!("{}=true", protocol::LABEL_MANAGED)],
            )]);
            let containers = self
                .docker
                .list_containers(Some(ListContainersOptions {
                    all: false,
                    filters,
                    ..ListContainersOptions::default()
                }))
                .await
                .map_err(|err| map_engine_error("<list>", err))?;

            Ok(containers
                .into_iter()
                .filter_map(|container| {
                    container.id.map(|id| ContainerSummary {
                        container_id: id,
                        labels: container.labels.unwrap_or_default(),
                    })
                })
                .collect())
        })
        .await
    }
}

async fn with_retries<T, F, Fut>(mut op: F) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=RETRY_ATTEMPTS {
        match op().await {
            Err(DriverError::EngineUnavailable(err)) if attempt < RETRY_ATTEMPTS => {
                warn!(attempt, error = %err, "engine call failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
    unreachable!("loop always returns on the final attempt")
}

fn map_engine_error(container_id: &str, err: bollard::errors::Error) -> DriverError {
    use bollard::errors::Error as Engine;
    match err {
        Engine::DockerResponseServerError {
            status_code: 404, ..
        } => DriverError::NotFound(container_id.to_string()),
        Engine::DockerResponseServerError {
            status_code,
            message,
        } => DriverError::Engine(anyhow::anyhow!("engine returned {status_code}: {message}")),
        Engine::JsonDataError { .. } => DriverError::Engine(err.into()),
        Engine::RequestTimeoutError => {
            DriverError::EngineUnavailable(anyhow::anyhow!("engine request timed out"))
        }
        other => DriverError::EngineUnavailable(other.into()),
    }
}

fn parse_engine_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
