//! Docker engine backed by `bollard`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    ListContainersOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use futures::StreamExt;
use futures::stream::BoxStream;

use super::{ContainerEngine, ContainerSpec, ContainerSummary, EngineError};

/// Seconds the engine waits after SIGTERM before killing a container.
const STOP_TIMEOUT_SECS: i32 = 10;
const LOG_CHANNEL_CAPACITY: usize = 256;
const STATE_RUNNING: &str = "running";

pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    /// Connects using the platform defaults (`DOCKER_HOST` or the local socket).
    ///
    /// # Errors
    /// `Unavailable` if no client could be constructed.
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn map_err(context: &str, err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(format!("{context}: {message}")),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Other(anyhow::anyhow!("{context}: {status_code} {message}")),
        other => EngineError::Unavailable(format!("{context}: {other}")),
    }
}

fn restart_policy(name: &str) -> RestartPolicy {
    let name = match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        _ => RestartPolicyNameEnum::NO,
    };
    RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    }
}

fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for (host_port, container_port) in &spec.port_bindings {
        let key = format!("{container_port}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(host_port.to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        binds: Some(spec.binds.iter().map(super::BindMount::to_bind_string).collect()),
        links: (!spec.links.is_empty()).then(|| spec.links.clone()),
        extra_hosts: Some(spec.extra_hosts.clone()),
        network_mode: spec.network.clone(),
        restart_policy: spec.restart_policy.as_deref().map(restart_policy),
        ..HostConfig::default()
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..ContainerCreateBody::default()
    }
}

#[async_trait]
impl ContainerEngine for BollardEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match map_err("inspect image", e) {
                EngineError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            item.map_err(|e| map_err("pull image", e))?;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();
        let response = self
            .docker
            .create_container(Some(options), create_body(spec))
            .await
            .map_err(|e| map_err("create container", e))?;
        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, warning = %warning, "container engine warning");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| map_err("start container", e))
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let options = StopContainerOptionsBuilder::default()
            .t(STOP_TIMEOUT_SECS)
            .build();
        match self.docker.stop_container(id, Some(options)).await {
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            })
            | Ok(()) => Ok(()),
            Err(e) => Err(map_err("stop container", e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err("remove container", e))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        let options = ListContainersOptionsBuilder::default().all(true).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_err("list containers", e))?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_owned())
                    .unwrap_or_default();
                Some(ContainerSummary {
                    id,
                    name,
                    image: c.image.unwrap_or_default(),
                    running: is_running_state(c.state.as_ref().map(ToString::to_string).as_deref()),
                })
            })
            .collect())
    }

    async fn container_networks(&self, name: &str) -> Result<Vec<String>, EngineError> {
        let details = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err("inspect container", e))?;
        Ok(details
            .network_settings
            .and_then(|n| n.networks)
            .map(|n| n.into_keys().collect())
            .unwrap_or_default())
    }

    fn follow_logs(&self, id: &str) -> BoxStream<'static, Result<String, EngineError>> {
        let (tx, rx) = tokio::sync::mpsc::channel(LOG_CHANNEL_CAPACITY);
        let docker = self.docker.clone();
        let id = id.to_owned();
        tokio::spawn(async move {
            let options = LogsOptionsBuilder::default()
                .follow(true)
                .stdout(true)
                .stderr(true)
                .build();
            let mut logs = docker.logs(&id, Some(options));
            while let Some(item) = logs.next().await {
                let line = item
                    .map(|output| output.to_string().trim_end().to_owned())
                    .map_err(|e| map_err("follow logs", e));
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }
}

/// Only `running` counts; `paused` and `restarting` containers report an `Up` status too.
fn is_running_state(state: Option<&str>) -> bool {
    state == Some(STATE_RUNNING)
}
