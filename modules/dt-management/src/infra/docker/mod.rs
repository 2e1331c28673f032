//! Container engine abstraction and lifecycle management.

mod bollard_engine;
mod manager;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use bollard_engine::BollardEngine;
pub use manager::{ContainerManager, resolve_network};

/// Label carrying the owning module id on every managed container.
pub const MODULE_LABEL: &str = "dt-management.module";
/// Label carrying the service id on internal-service containers.
pub const SERVICE_LABEL: &str = "dt-management.service";

/// Errors reported by a container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no such container or image: {0}")]
    NotFound(String),
    #[error("container engine unreachable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Host directory or file mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    #[must_use]
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// Docker `binds` notation.
    #[must_use]
    pub fn to_bind_string(&self) -> String {
        let mode = if self.read_only { ":ro" } else { "" };
        format!("{}:{}{mode}", self.source.display(), self.target)
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `(host port, container port)` pairs.
    pub port_bindings: Vec<(u16, u16)>,
    pub binds: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub links: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub network: Option<String>,
    pub restart_policy: Option<String>,
}

/// Container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
}

/// Minimal container engine API used by [`ContainerManager`].
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<(), EngineError>;

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Creates the container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Stops a running container; stopping a stopped container succeeds.
    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// All containers, running or not.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Networks the named container is attached to.
    async fn container_networks(&self, name: &str) -> Result<Vec<String>, EngineError>;

    /// Follows stdout/stderr of a container, one line per item.
    fn follow_logs(&self, id: &str) -> BoxStream<'static, Result<String, EngineError>>;
}
