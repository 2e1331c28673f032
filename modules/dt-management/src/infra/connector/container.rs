//! Containerized runtimes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{ContextFiles, RuntimeBootstrap, RuntimeConnector, RuntimeHandle, RuntimeTarget};
use crate::config::DockerConfig;
use crate::domain::address::{AddressTranslator, CONTAINER_HTTP_PORT};
use crate::domain::error::DomainError;
use crate::infra::docker::{BindMount, ContainerManager, ContainerSpec, MODULE_LABEL};

/// Directory the runtime image reads its bootstrap files from.
const CONTAINER_ROOT: &str = "/app";
const RUNTIME_LOG_LEVEL: &str = "INFO";

/// Runs each module's runtime in its own container named after the module id.
pub struct ContainerConnector {
    manager: Arc<ContainerManager>,
    translator: AddressTranslator,
    image: String,
    // context directories must outlive the containers that mount them
    files: Mutex<HashMap<Uuid, ContextFiles>>,
}

impl ContainerConnector {
    #[must_use]
    pub fn new(manager: Arc<ContainerManager>, translator: AddressTranslator, cfg: &DockerConfig) -> Self {
        Self {
            manager,
            translator,
            image: cfg.image.clone(),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn spec(&self, bootstrap: &RuntimeBootstrap, files: &ContextFiles) -> ContainerSpec {
        let env = BTreeMap::from([
            ("faaast_model".to_owned(), files.runtime.model.clone()),
            ("faaast_config".to_owned(), files.runtime.config.clone()),
            (
                "faaast_loglevel_faaast".to_owned(),
                RUNTIME_LOG_LEVEL.to_owned(),
            ),
        ]);
        ContainerSpec {
            name: self.translator.module_container_name(&bootstrap.module_id),
            image: self.image.clone(),
            port_bindings: vec![(bootstrap.http_port, CONTAINER_HTTP_PORT)],
            binds: vec![
                BindMount::read_only(files.model_path(), files.runtime.model.clone()),
                BindMount::read_only(files.config_path(), files.runtime.config.clone()),
                BindMount::read_only(files.files_dir(), files.runtime.files.clone()),
            ],
            env,
            labels: BTreeMap::from([(MODULE_LABEL.to_owned(), bootstrap.module_id.clone())]),
            ..ContainerSpec::default()
        }
    }
}

#[async_trait]
impl RuntimeConnector for ContainerConnector {
    #[tracing::instrument(skip_all, fields(module_id = %bootstrap.module_id, port = bootstrap.http_port))]
    async fn start(&self, bootstrap: &RuntimeBootstrap) -> Result<RuntimeHandle, DomainError> {
        if !self.manager.is_available() {
            return Err(DomainError::unavailable(
                "Docker",
                "containerized deployments are disabled",
            ));
        }
        let files = ContextFiles::write(
            bootstrap,
            |paths| bootstrap.service_config(CONTAINER_HTTP_PORT, paths),
            Some(CONTAINER_ROOT),
        )?;
        let spec = self.spec(bootstrap, &files);
        let name = spec.name.clone();
        let id = self.manager.start_container(spec).await.map_err(|e| match e {
            DomainError::ExternalSystemUnavailable { .. } => e,
            other => DomainError::start_failure(&bootstrap.module_id, other.to_string()),
        })?;

        let instance_id = Uuid::now_v7();
        self.files.lock().insert(instance_id, files);
        Ok(RuntimeHandle {
            module_id: bootstrap.module_id.clone(),
            instance_id,
            http_port: bootstrap.http_port,
            target: RuntimeTarget::Container { id, name },
        })
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), DomainError> {
        let result = match &handle.target {
            RuntimeTarget::Container { id, .. } => {
                let stopped = self.manager.stop_container(id).await;
                let removed = self.manager.remove_container(id).await;
                stopped.and(removed)
            }
            RuntimeTarget::Process { .. } => Ok(()),
        };
        self.files.lock().remove(&handle.instance_id);
        result
    }

    async fn is_running(&self, handle: &RuntimeHandle) -> bool {
        match &handle.target {
            RuntimeTarget::Container { id, .. } => {
                self.manager.is_running(id).await.unwrap_or(false)
            }
            RuntimeTarget::Process { .. } => false,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::DtManagementConfig;
    use crate::domain::aas::EnvironmentContext;
    use crate::domain::address::Address;
    use crate::domain::model::DeploymentType;

    fn connector() -> ContainerConnector {
        let cfg = DtManagementConfig::default();
        ContainerConnector::new(
            Arc::new(ContainerManager::disabled(&cfg.docker)),
            AddressTranslator::new(&cfg),
            &cfg.docker,
        )
    }

    fn bootstrap() -> RuntimeBootstrap {
        RuntimeBootstrap {
            module_id: "m1".to_owned(),
            deployment_type: DeploymentType::Containerized,
            http_port: 41234,
            event_bus: Address::new("host.docker.internal", 1883),
            model: EnvironmentContext::default(),
            asset_connections: Vec::new(),
            return_results_for_each_step: true,
        }
    }

    #[test]
    fn container_spec_mounts_bootstrap_files_read_only() {
        let connector = connector();
        let b = bootstrap();
        let files = ContextFiles::write(&b, |p| b.service_config(CONTAINER_HTTP_PORT, p), Some(CONTAINER_ROOT)).unwrap();
        let spec = connector.spec(&b, &files);

        assert_eq!(spec.name, "modapto-module-m1");
        assert_eq!(spec.image, "ghcr.io/modapto/digital-twin:latest");
        assert_eq!(spec.port_bindings, vec![(41234, 8080)]);
        assert!(spec.binds.iter().all(|b| b.read_only));
        let targets: Vec<&str> = spec.binds.iter().map(|b| b.target.as_str()).collect();
        assert_eq!(targets, ["/app/model.json", "/app/config.json", "/app/files"]);
        assert_eq!(spec.env.get("faaast_config").map(String::as_str), Some("/app/config.json"));
        assert_eq!(spec.labels.get(MODULE_LABEL).map(String::as_str), Some("m1"));
    }

    #[tokio::test]
    async fn start_without_engine_is_unavailable() {
        let err = connector().start(&bootstrap()).await.unwrap_err();
        assert!(matches!(err, DomainError::ExternalSystemUnavailable { .. }));
    }
}
