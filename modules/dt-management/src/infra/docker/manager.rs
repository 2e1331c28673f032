//! Idempotent container lifecycle on top of a [`ContainerEngine`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{ContainerEngine, ContainerSpec, ContainerSummary, EngineError};
use crate::config::DockerConfig;
use crate::domain::address::HOST_GATEWAY_ALIAS;
use crate::domain::error::DomainError;
use crate::infra::log_forwarder::{StreamKind, forward_line};

const ENGINE_NAME: &str = "Docker";

/// Picks the network to attach containers to among the orchestrator's own networks.
///
/// An exact match on the configured name wins, then a compose-style `<project>_<name>`
/// match, then the first network the orchestrator is attached to.
#[must_use]
pub fn resolve_network(configured: Option<&str>, available: &[String]) -> Option<String> {
    if let Some(wanted) = configured {
        if let Some(exact) = available.iter().find(|n| n.as_str() == wanted) {
            return Some(exact.clone());
        }
        let suffix = format!("_{wanted}");
        if let Some(prefixed) = available.iter().find(|n| n.ends_with(&suffix)) {
            return Some(prefixed.clone());
        }
    }
    available
        .first()
        .cloned()
        .or_else(|| configured.map(ToOwned::to_owned))
}

fn to_domain(err: EngineError) -> DomainError {
    match err {
        EngineError::NotFound(what) => DomainError::not_found(what),
        EngineError::Unavailable(message) => DomainError::unavailable(ENGINE_NAME, message),
        EngineError::Other(e) => DomainError::Internal(e),
    }
}

/// Container lifecycle manager.
///
/// Built with [`ContainerManager::connect`]; when the engine cannot be reached the
/// containerized capability is disabled and every call fails fast with
/// `ExternalSystemUnavailable`.
pub struct ContainerManager {
    engine: Option<Arc<dyn ContainerEngine>>,
    call_timeout: Duration,
    restart_policy: Option<String>,
    network: Option<String>,
    include_logs: bool,
    cancel: CancellationToken,
}

impl ContainerManager {
    /// Pings the engine and resolves the network new containers join.
    ///
    /// `own_container` is the orchestrator's container name when it runs containerized.
    pub async fn connect(
        engine: Option<Arc<dyn ContainerEngine>>,
        cfg: &DockerConfig,
        own_container: Option<&str>,
        cancel: CancellationToken,
    ) -> Self {
        let mut manager = Self {
            engine: None,
            call_timeout: cfg.call_timeout,
            restart_policy: Some(cfg.restart_policy.clone()).filter(|p| !p.is_empty()),
            network: cfg.network.clone(),
            include_logs: cfg.include_logs,
            cancel,
        };
        let Some(engine) = engine else {
            tracing::warn!("no container engine configured, containerized deployments disabled");
            return manager;
        };
        match tokio::time::timeout(manager.call_timeout, engine.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "container engine unreachable, containerized deployments disabled");
                return manager;
            }
            Err(_) => {
                tracing::warn!("container engine ping timed out, containerized deployments disabled");
                return manager;
            }
        }
        manager.engine = Some(engine);

        if let Some(own) = own_container {
            let networks = manager
                .call("inspect own container", |e| async move {
                    e.container_networks(own).await
                })
                .await;
            match networks {
                Ok(networks) => {
                    manager.network = resolve_network(cfg.network.as_deref(), &networks);
                }
                Err(e) => {
                    tracing::warn!(container = %own, error = %e, "could not inspect own container networks");
                }
            }
        }
        tracing::info!(network = ?manager.network, "container engine connected");
        manager
    }

    /// Manager without an engine; every call fails with `ExternalSystemUnavailable`.
    #[must_use]
    pub fn disabled(cfg: &DockerConfig) -> Self {
        Self {
            engine: None,
            call_timeout: cfg.call_timeout,
            restart_policy: None,
            network: None,
            include_logs: false,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.engine.is_some()
    }

    #[must_use]
    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    fn engine(&self) -> Result<&Arc<dyn ContainerEngine>, DomainError> {
        self.engine.as_ref().ok_or_else(|| {
            DomainError::unavailable(ENGINE_NAME, "container engine is not available")
        })
    }

    async fn call<'a, T, F, Fut>(&'a self, what: &str, f: F) -> Result<T, DomainError>
    where
        F: FnOnce(&'a Arc<dyn ContainerEngine>) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let engine = self.engine()?;
        match tokio::time::timeout(self.call_timeout, f(engine)).await {
            Ok(result) => result.map_err(to_domain),
            Err(_) => Err(DomainError::unavailable(
                ENGINE_NAME,
                format!(
                    "{what} timed out after {}",
                    humantime::format_duration(self.call_timeout)
                ),
            )),
        }
    }

    /// Starts a container, replacing any existing container with the same name.
    ///
    /// # Errors
    /// `ExternalSystemUnavailable` when the engine is disabled, unreachable or slow;
    /// `Internal` for engine-side failures.
    #[tracing::instrument(skip(self, spec), fields(container = %spec.name, image = %spec.image))]
    pub async fn start_container(&self, mut spec: ContainerSpec) -> Result<String, DomainError> {
        self.ensure_image(&spec.image).await?;
        self.remove_container_by_name(&spec.name).await?;

        let gateway = format!("{HOST_GATEWAY_ALIAS}:host-gateway");
        if !spec.extra_hosts.contains(&gateway) {
            spec.extra_hosts.push(gateway);
        }
        if spec.network.is_none() {
            spec.network.clone_from(&self.network);
        }
        if spec.restart_policy.is_none() {
            spec.restart_policy.clone_from(&self.restart_policy);
        }

        let spec = &spec;
        let id = self
            .call("create container", |e| async move { e.create_container(spec).await })
            .await?;
        let started = self
            .call("start container", |e| {
                let id = id.as_str();
                async move { e.start_container(id).await }
            })
            .await;
        if let Err(err) = started {
            if let Err(cleanup) = self.remove_container(&id).await {
                tracing::warn!(container = %spec.name, error = %cleanup, "failed to remove container that did not start");
            }
            return Err(err);
        }

        tracing::info!(container = %spec.name, container_id = %id, "container started");
        if self.include_logs {
            self.spawn_log_follower(&id, &spec.name);
        }
        Ok(id)
    }

    async fn ensure_image(&self, image: &str) -> Result<(), DomainError> {
        let present = self
            .call("inspect image", |e| async move { e.image_exists(image).await })
            .await?;
        if !present {
            tracing::info!(image = %image, "pulling image");
            self.call("pull image", |e| async move { e.pull_image(image).await })
                .await?;
        }
        Ok(())
    }

    /// Stops a container; missing or already stopped containers are not an error.
    ///
    /// # Errors
    /// `ExternalSystemUnavailable` or `Internal` for engine failures.
    pub async fn stop_container(&self, id: &str) -> Result<(), DomainError> {
        match self
            .call("stop container", |e| async move { e.stop_container(id).await })
            .await
        {
            Ok(()) | Err(DomainError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Removes a container; missing containers are not an error.
    ///
    /// # Errors
    /// `ExternalSystemUnavailable` or `Internal` for engine failures.
    pub async fn remove_container(&self, id: &str) -> Result<(), DomainError> {
        match self
            .call("remove container", |e| async move { e.remove_container(id).await })
            .await
        {
            Ok(()) | Err(DomainError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Finds a container by exact name.
    ///
    /// # Errors
    /// `ExternalSystemUnavailable` or `Internal` for engine failures.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<ContainerSummary>, DomainError> {
        let containers = self
            .call("list containers", |e| async move { e.list_containers().await })
            .await?;
        Ok(containers.into_iter().find(|c| c.name == name))
    }

    /// Stops and removes the named container if it exists.
    ///
    /// # Errors
    /// `ExternalSystemUnavailable` or `Internal` for engine failures.
    pub async fn remove_container_by_name(&self, name: &str) -> Result<(), DomainError> {
        let Some(existing) = self.find_by_name(name).await? else {
            return Ok(());
        };
        tracing::debug!(container = %name, container_id = %existing.id, "removing existing container");
        if existing.running {
            self.stop_container(&existing.id).await?;
        }
        self.remove_container(&existing.id).await
    }

    /// Stops the named container if it exists and is running.
    ///
    /// # Errors
    /// `ExternalSystemUnavailable` or `Internal` for engine failures.
    pub async fn stop_container_if_running_by_name(&self, name: &str) -> Result<(), DomainError> {
        match self.find_by_name(name).await? {
            Some(existing) if existing.running => self.stop_container(&existing.id).await,
            _ => Ok(()),
        }
    }

    /// Whether a container with this id is still running.
    ///
    /// # Errors
    /// `ExternalSystemUnavailable` or `Internal` for engine failures.
    pub async fn is_running(&self, id: &str) -> Result<bool, DomainError> {
        let containers = self
            .call("list containers", |e| async move { e.list_containers().await })
            .await?;
        Ok(containers.iter().any(|c| c.id == id && c.running))
    }

    fn spawn_log_follower(&self, id: &str, name: &str) {
        let Ok(engine) = self.engine() else {
            return;
        };
        let mut logs = engine.follow_logs(id);
        let name = name.to_owned();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    item = logs.next() => match item {
                        Some(Ok(line)) => forward_line(&name, StreamKind::Container, &line),
                        Some(Err(e)) => {
                            tracing::debug!(container = %name, error = %e, "container log stream failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });
    }
}
