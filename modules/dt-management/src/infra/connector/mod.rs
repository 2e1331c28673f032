//! Runtime strategies: co-located child process or container.

mod container;
mod process;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use uuid::Uuid;

pub use container::ContainerConnector;
pub use process::ProcessConnector;

use crate::domain::aas::EnvironmentContext;
use crate::domain::address::Address;
use crate::domain::error::DomainError;
use crate::domain::model::DeploymentType;
use crate::infra::forwarder::module_topic_prefix;

const CONTEXT_DIR_PREFIX: &str = "dt-context-files";
const MODEL_FILE: &str = "model.json";
const CONFIG_FILE: &str = "config.json";
const FILES_DIR: &str = "files";

const HTTP_ENDPOINT_CLASS: &str =
    "de.fraunhofer.iosb.ilt.faaast.service.endpoint.http.HttpEndpoint";
const MESSAGE_BUS_CLASS: &str =
    "de.fraunhofer.iosb.ilt.faaast.service.messagebus.internal.MessageBusInternalMqttForward";
const PERSISTENCE_CLASS: &str =
    "de.fraunhofer.iosb.ilt.faaast.service.persistence.memory.PersistenceInMemory";
const FILE_STORAGE_CLASS: &str =
    "de.fraunhofer.iosb.ilt.faaast.service.filestorage.filesystem.FileStorageFilesystem";
const SIMULATION_PROCESSOR_CLASS: &str =
    "de.fraunhofer.iosb.ilt.faaast.service.submodeltemplate.simulation.SimulationSubmodelTemplateProcessor";
const FORWARDED_EVENT: &str = "ExecuteEventMessage";

/// Composed configuration a runtime is started with.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeBootstrap {
    pub module_id: String,
    pub deployment_type: DeploymentType,
    /// Host port the module API is published on.
    pub http_port: u16,
    /// Message bus as seen from the module.
    pub event_bus: Address,
    /// Actual model used as persistence seed, with its embedded files.
    pub model: EnvironmentContext,
    pub asset_connections: Vec<Value>,
    pub return_results_for_each_step: bool,
}

/// Paths the runtime sees for its bootstrap files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RuntimePaths {
    pub model: String,
    pub config: String,
    pub files: String,
}

impl RuntimeBootstrap {
    #[must_use]
    pub fn topic_prefix(&self) -> String {
        module_topic_prefix(&self.module_id)
    }

    /// `module-<id>-<8 random hex chars>`.
    #[must_use]
    pub fn client_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("module-{}-{}", self.module_id, &suffix[..8])
    }

    /// Runtime service configuration listening on `http_port` and reading files from `paths`.
    #[must_use]
    pub(crate) fn service_config(&self, http_port: u16, paths: &RuntimePaths) -> Value {
        json!({
            "core": { "validationOnLoad": "NONE" },
            "endpoints": [{
                "@class": HTTP_ENDPOINT_CLASS,
                "port": http_port,
                "cors": true,
                "sni": false,
                "ssl": false,
                "includeErrorDetails": true,
            }],
            "messageBus": {
                "@class": MESSAGE_BUS_CLASS,
                "host": self.event_bus.host,
                "port": self.event_bus.port,
                "topicPrefix": self.topic_prefix(),
                "clientId": self.client_id(),
                "eventsToForward": [FORWARDED_EVENT],
            },
            "persistence": {
                "@class": PERSISTENCE_CLASS,
                "initialModelFile": paths.model,
            },
            "fileStorage": {
                "@class": FILE_STORAGE_CLASS,
                "path": paths.files,
            },
            "submodelTemplateProcessors": [{
                "@class": SIMULATION_PROCESSOR_CLASS,
                "returnResultsForEachStep": self.return_results_for_each_step,
            }],
            "assetConnections": self.asset_connections,
        })
    }
}

/// Bootstrap files written to a scratch directory that lives as long as the runtime.
pub(crate) struct ContextFiles {
    dir: TempDir,
    /// Locations of the files as seen by the runtime.
    pub runtime: RuntimePaths,
}

impl ContextFiles {
    /// Writes model, embedded files and the configuration produced by `config`.
    pub(crate) fn write(
        bootstrap: &RuntimeBootstrap,
        config: impl FnOnce(&RuntimePaths) -> Value,
        runtime_root: Option<&str>,
    ) -> anyhow::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(CONTEXT_DIR_PREFIX)
            .tempdir()
            .context("failed to create context directory")?;
        let local = RuntimePaths {
            model: dir.path().join(MODEL_FILE).display().to_string(),
            config: dir.path().join(CONFIG_FILE).display().to_string(),
            files: dir.path().join(FILES_DIR).display().to_string(),
        };
        let runtime = match runtime_root {
            Some(root) => RuntimePaths {
                model: format!("{root}/{MODEL_FILE}"),
                config: format!("{root}/{CONFIG_FILE}"),
                files: format!("{root}/{FILES_DIR}"),
            },
            None => local,
        };
        let files = Self { dir, runtime };

        std::fs::create_dir_all(files.files_dir()).context("failed to create files directory")?;
        for file in &bootstrap.model.files {
            let target = files.files_dir().join(relative_file_path(&file.path)?);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(&target, &file.content)
                .with_context(|| format!("failed to write {}", target.display()))?;
        }

        let model = serde_json::to_vec_pretty(&bootstrap.model.environment)
            .context("failed to serialize model")?;
        std::fs::write(files.model_path(), model).context("failed to write model file")?;

        let config = serde_json::to_vec_pretty(&config(&files.runtime)).context("failed to serialize config")?;
        std::fs::write(files.config_path(), config).context("failed to write config file")?;
        Ok(files)
    }

    pub(crate) fn model_path(&self) -> PathBuf {
        self.dir.path().join(MODEL_FILE)
    }

    pub(crate) fn config_path(&self) -> PathBuf {
        self.dir.path().join(CONFIG_FILE)
    }

    pub(crate) fn files_dir(&self) -> PathBuf {
        self.dir.path().join(FILES_DIR)
    }
}

/// Model file paths are absolute inside the model; keep them below the files directory.
fn relative_file_path(path: &str) -> anyhow::Result<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        anyhow::bail!("invalid model file path '{path}'");
    }
    Ok(relative.to_path_buf())
}

/// Live runtime owned by a deployment instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub module_id: String,
    pub instance_id: Uuid,
    pub http_port: u16,
    pub target: RuntimeTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeTarget {
    Process { pid: Option<u32> },
    Container { id: String, name: String },
}

/// Starts and stops one kind of runtime.
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    /// Starts a runtime for `bootstrap`.
    ///
    /// # Errors
    /// `RuntimeStartFailure` if the runtime could not be launched,
    /// `ExternalSystemUnavailable` if its backing system is down.
    async fn start(&self, bootstrap: &RuntimeBootstrap) -> Result<RuntimeHandle, DomainError>;

    /// Stops the runtime; unknown or already stopped runtimes are not an error.
    ///
    /// # Errors
    /// Failures of the backing system.
    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), DomainError>;

    /// Whether the runtime is still alive.
    async fn is_running(&self, handle: &RuntimeHandle) -> bool;
}

/// Runtime strategy per deployment type.
#[derive(Clone)]
pub struct Connectors {
    internal: Arc<dyn RuntimeConnector>,
    containerized: Arc<dyn RuntimeConnector>,
}

impl Connectors {
    #[must_use]
    pub fn new(internal: Arc<dyn RuntimeConnector>, containerized: Arc<dyn RuntimeConnector>) -> Self {
        Self {
            internal,
            containerized,
        }
    }

    #[must_use]
    pub fn for_type(&self, deployment_type: DeploymentType) -> &Arc<dyn RuntimeConnector> {
        match deployment_type {
            DeploymentType::Internal => &self.internal,
            DeploymentType::Containerized => &self.containerized,
        }
    }
}
