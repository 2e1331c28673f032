//! Deployment orchestrator: per-module lifecycle of runtimes and service containers.
//!
//! A module id moves through `absent → deploying → running → (updating → running |
//! undeploying → absent)`. The registry is the only shared lock and is never held
//! across an await point; everything between the transient states runs unlocked.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http::Method;
use parking_lot::Mutex;

use super::address::{AddressTranslator, Topology, service_endpoint};
use super::error::DomainError;
use super::model::{DeploymentType, Module, ServiceKind, SmartService};
use super::model_builder::{ActualModel, build_actual_model};
use crate::config::ReadinessConfig;
use crate::infra::connector::{Connectors, RuntimeBootstrap, RuntimeHandle};
use crate::infra::docker::{ContainerManager, ContainerSpec, MODULE_LABEL, SERVICE_LABEL};
use crate::infra::forwarder::EventForwarder;
use crate::infra::ports::allocate_port;
use crate::infra::readiness::ReadinessCheck;

/// Path below the module API that answers once the runtime has loaded its model.
const READINESS_PATH: &str = "/shells";
const ENGINE_NAME: &str = "Docker";
const ORCHESTRATOR_NAME: &str = "DT Management";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Deploying,
    Running,
    Updating,
    Undeploying,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Updating => "updating",
            Self::Undeploying => "undeploying",
        })
    }
}

#[derive(Debug, Clone)]
struct StartedService {
    service_id: String,
    container_id: String,
}

/// Everything started for one deployed module.
#[derive(Debug)]
struct DeploymentInstance {
    deployment_type: DeploymentType,
    runtime: RuntimeHandle,
    services: Vec<StartedService>,
}

struct Slot {
    state: LifecycleState,
    instance: Option<DeploymentInstance>,
}

/// Side-effect free preparation of a deployment.
struct DeploymentPlan {
    topology: Topology,
    port: u16,
    actual: ActualModel,
    bootstrap: RuntimeBootstrap,
}

/// Coordinates address translation, binding, runtimes, service containers, readiness
/// and event relay registration for deploy, update and undeploy.
pub struct DeploymentOrchestrator {
    translator: AddressTranslator,
    connectors: Connectors,
    containers: Arc<ContainerManager>,
    checker: Arc<dyn ReadinessCheck>,
    forwarder: Arc<EventForwarder>,
    readiness: ReadinessConfig,
    registry: Mutex<HashMap<String, Slot>>,
    // set under the registry lock; no instance is committed afterwards
    closed: AtomicBool,
}

impl DeploymentOrchestrator {
    #[must_use]
    pub fn new(
        translator: AddressTranslator,
        connectors: Connectors,
        containers: Arc<ContainerManager>,
        checker: Arc<dyn ReadinessCheck>,
        forwarder: Arc<EventForwarder>,
        readiness: ReadinessConfig,
    ) -> Self {
        Self {
            translator,
            connectors,
            containers,
            checker,
            forwarder,
            readiness,
            registry: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    #[must_use]
    pub fn state(&self, module_id: &str) -> Option<LifecycleState> {
        self.registry.lock().get(module_id).map(|s| s.state)
    }

    #[must_use]
    pub fn is_deployed(&self, module_id: &str) -> bool {
        self.state(module_id) == Some(LifecycleState::Running)
    }

    /// Host port of the running instance.
    #[must_use]
    pub fn allocated_port(&self, module_id: &str) -> Option<u16> {
        self.registry
            .lock()
            .get(module_id)
            .and_then(|s| s.instance.as_ref())
            .map(|i| i.runtime.http_port)
    }

    /// Deploys a module and returns it with its actual model and endpoints filled in.
    ///
    /// # Errors
    /// `Conflict` if the id is already registered; configuration, binding and address
    /// errors before anything starts; `RuntimeStartFailure`, `DeploymentTimeout` or
    /// `ExternalSystemUnavailable` after a best-effort rollback.
    #[tracing::instrument(skip(self, module), fields(module_id = %module.id, deployment_type = ?module.deployment_type))]
    pub async fn deploy(&self, module: Module) -> Result<Module, DomainError> {
        let module = self.deploy_on(module, None).await?;
        tracing::info!(endpoint = ?module.external_endpoint, "module deployed");
        Ok(module)
    }

    /// Deploys a module that is not registered any more on the host port it had before,
    /// so its external endpoint stays the same.
    ///
    /// # Errors
    /// As [`Self::deploy`].
    #[tracing::instrument(skip(self, module), fields(module_id = %module.id))]
    pub async fn restore(&self, module: Module, port: u16) -> Result<Module, DomainError> {
        let module = self.deploy_on(module, Some(port)).await?;
        tracing::info!(endpoint = ?module.external_endpoint, "module restored");
        Ok(module)
    }

    async fn deploy_on(&self, mut module: Module, port: Option<u16>) -> Result<Module, DomainError> {
        self.reserve(&module.id)?;
        let result = match self.plan(&mut module, port) {
            Ok(plan) => self.launch(&mut module, plan).await,
            Err(e) => Err(e),
        };
        self.finish(&module, result).await?;
        Ok(module)
    }

    /// Stops the running instance and redeploys on the same port.
    ///
    /// Validation errors leave the running instance untouched. Failures after the old
    /// instance was stopped leave the module undeployed.
    ///
    /// # Errors
    /// `NotFound` if the module is not deployed, `Conflict` while another lifecycle
    /// operation is in flight, otherwise as [`Self::deploy`].
    #[tracing::instrument(skip(self, module), fields(module_id = %module.id))]
    pub async fn update(&self, mut module: Module) -> Result<Module, DomainError> {
        let previous = self.take_running(&module.id, LifecycleState::Updating)?;
        let plan = match self.plan(&mut module, Some(previous.runtime.http_port)) {
            Ok(plan) => plan,
            Err(e) => {
                if let Err(closed) = self.commit(&module.id, previous, None).await {
                    tracing::debug!(error = %closed, "running instance stopped during shutdown");
                }
                return Err(e);
            }
        };

        self.forwarder.unsubscribe(&module.id);
        self.teardown(&module.id, &previous).await;
        drop(previous);

        let result = self.launch(&mut module, plan).await;
        self.finish(&module, result).await?;
        tracing::info!(endpoint = ?module.external_endpoint, "module updated");
        Ok(module)
    }

    /// Stops everything started for the module and clears its deployment state.
    ///
    /// Failures of the backing systems are logged and absorbed.
    ///
    /// # Errors
    /// `NotFound` if the module is not deployed, `Conflict` while another lifecycle
    /// operation is in flight.
    #[tracing::instrument(skip(self, module), fields(module_id = %module.id))]
    pub async fn undeploy(&self, mut module: Module) -> Result<Module, DomainError> {
        let instance = self.take_running(&module.id, LifecycleState::Undeploying)?;
        self.forwarder.unsubscribe(&module.id);
        self.teardown(&module.id, &instance).await;
        self.registry.lock().remove(&module.id);

        module.clear_deployment();
        tracing::info!("module undeployed");
        Ok(module)
    }

    /// Tears down every running instance and rejects further lifecycle operations.
    ///
    /// Deployments still in flight tear their runtime down instead of committing it.
    pub async fn shutdown(&self) {
        let instances: Vec<(String, DeploymentInstance)> = {
            let mut registry = self.registry.lock();
            self.closed.store(true, Ordering::Release);
            registry
                .drain()
                .filter_map(|(id, slot)| slot.instance.map(|i| (id, i)))
                .collect()
        };
        if instances.is_empty() {
            return;
        }
        tracing::info!(count = instances.len(), "stopping deployed modules");
        for (id, instance) in instances {
            self.forwarder.unsubscribe(&id);
            self.teardown(&id, &instance).await;
        }
    }

    fn reserve(&self, module_id: &str) -> Result<(), DomainError> {
        let mut registry = self.registry.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(shutting_down());
        }
        if let Some(slot) = registry.get(module_id) {
            return Err(DomainError::conflict(format!(
                "module '{module_id}' is already {}",
                slot.state
            )));
        }
        registry.insert(
            module_id.to_owned(),
            Slot {
                state: LifecycleState::Deploying,
                instance: None,
            },
        );
        Ok(())
    }

    fn take_running(
        &self,
        module_id: &str,
        next: LifecycleState,
    ) -> Result<DeploymentInstance, DomainError> {
        let mut registry = self.registry.lock();
        let slot = registry
            .get_mut(module_id)
            .ok_or_else(|| DomainError::not_found(format!("module '{module_id}' is not deployed")))?;
        if slot.state != LifecycleState::Running {
            return Err(DomainError::conflict(format!(
                "module '{module_id}' is {}",
                slot.state
            )));
        }
        let instance = slot.instance.take().ok_or_else(|| {
            DomainError::Internal(anyhow::anyhow!("running module '{module_id}' has no instance"))
        })?;
        slot.state = next;
        Ok(instance)
    }

    /// Marks the instance running and, when given, routes the module's events.
    ///
    /// Once shutdown has started the instance is torn down instead.
    async fn commit(
        &self,
        module_id: &str,
        instance: DeploymentInstance,
        subscribe: Option<&Module>,
    ) -> Result<(), DomainError> {
        let rejected = {
            let mut registry = self.registry.lock();
            if self.closed.load(Ordering::Acquire) {
                registry.remove(module_id);
                Some(instance)
            } else {
                if let Some(module) = subscribe {
                    self.forwarder.subscribe(module);
                }
                registry.insert(
                    module_id.to_owned(),
                    Slot {
                        state: LifecycleState::Running,
                        instance: Some(instance),
                    },
                );
                None
            }
        };
        match rejected {
            Some(instance) => {
                self.forwarder.unsubscribe(module_id);
                self.teardown(module_id, &instance).await;
                Err(shutting_down())
            }
            None => Ok(()),
        }
    }

    /// Commits a launched instance or releases the registry entry.
    async fn finish(
        &self,
        module: &Module,
        result: Result<DeploymentInstance, DomainError>,
    ) -> Result<(), DomainError> {
        match result {
            Ok(instance) => self.commit(&module.id, instance, Some(module)).await,
            Err(e) => {
                self.registry.lock().remove(&module.id);
                tracing::warn!(module_id = %module.id, error = %e, "deployment failed");
                Err(e)
            }
        }
    }

    /// Allocates ports and rebuilds the actual model; nothing is started.
    fn plan(&self, module: &mut Module, port: Option<u16>) -> Result<DeploymentPlan, DomainError> {
        let needs_engine = module.deployment_type == DeploymentType::Containerized
            || module.services.iter().any(SmartService::is_internal);
        if needs_engine && !self.containers.is_available() {
            return Err(DomainError::unavailable(
                ENGINE_NAME,
                format!("module '{}' needs the container engine", module.id),
            ));
        }

        let port = match port {
            Some(port) => port,
            None => allocate_port()?,
        };
        for service in &mut module.services {
            if let ServiceKind::Internal { external_port, .. } = &mut service.kind {
                *external_port = Some(allocate_port()?);
            }
        }

        let topology = Topology::from(module.deployment_type);
        let actual = build_actual_model(module, |service| match service.kind {
            ServiceKind::Embedded { .. } => Ok(None),
            ServiceKind::Internal { .. } | ServiceKind::External { .. } => {
                self.translator.module_to_service(topology, service).map(Some)
            }
        })?;

        let bootstrap = RuntimeBootstrap {
            module_id: module.id.clone(),
            deployment_type: module.deployment_type,
            http_port: port,
            event_bus: self.translator.event_bus_target(topology),
            model: actual.context.clone(),
            asset_connections: actual.asset_connections.clone(),
            return_results_for_each_step: module
                .services
                .iter()
                .filter(|s| matches!(s.kind, ServiceKind::Embedded { .. }))
                .all(SmartService::return_results_for_each_step),
        };
        Ok(DeploymentPlan {
            topology,
            port,
            actual,
            bootstrap,
        })
    }

    /// Starts service containers and the runtime, waits for readiness and rewrites
    /// endpoints. Anything started is torn down again on failure.
    async fn launch(
        &self,
        module: &mut Module,
        plan: DeploymentPlan,
    ) -> Result<DeploymentInstance, DomainError> {
        let mut services = Vec::new();
        if let Err(e) = self.start_services(module, &mut services).await {
            self.remove_services(&module.id, &services).await;
            return Err(e);
        }

        let connector = self.connectors.for_type(module.deployment_type);
        let runtime = match connector.start(&plan.bootstrap).await {
            Ok(runtime) => runtime,
            Err(e) => {
                self.remove_services(&module.id, &services).await;
                return Err(e);
            }
        };
        let instance = DeploymentInstance {
            deployment_type: module.deployment_type,
            runtime,
            services,
        };

        if let Err(e) = self.await_ready(module, plan.topology, &instance).await {
            self.teardown(&module.id, &instance).await;
            return Err(e);
        }

        self.publish_endpoints(module, plan.topology, plan.port, plan.actual);
        Ok(instance)
    }

    async fn start_services(
        &self,
        module: &Module,
        started: &mut Vec<StartedService>,
    ) -> Result<(), DomainError> {
        for service in &module.services {
            let ServiceKind::Internal {
                image,
                internal_port,
                external_port: Some(host_port),
                ..
            } = &service.kind
            else {
                continue;
            };
            let spec = ContainerSpec {
                name: self.translator.service_container_name(&service.id),
                image: image.clone(),
                port_bindings: vec![(*host_port, *internal_port)],
                labels: BTreeMap::from([
                    (MODULE_LABEL.to_owned(), module.id.clone()),
                    (SERVICE_LABEL.to_owned(), service.id.clone()),
                ]),
                ..ContainerSpec::default()
            };
            let container_id = self.containers.start_container(spec).await?;
            tracing::debug!(service_id = %service.id, container = %container_id, "service container started");
            started.push(StartedService {
                service_id: service.id.clone(),
                container_id,
            });
        }
        Ok(())
    }

    async fn await_ready(
        &self,
        module: &Module,
        topology: Topology,
        instance: &DeploymentInstance,
    ) -> Result<(), DomainError> {
        let timeout = self.readiness.timeout;
        let interval = self.readiness.interval;

        let api = format!(
            "{}{READINESS_PATH}",
            self.translator
                .internal_endpoint(topology, &module.id, instance.runtime.http_port)
        );
        match self
            .checker
            .wait_until_available(Method::GET, &api, timeout, interval)
            .await
        {
            Ok(()) => {}
            Err(e @ DomainError::DeploymentTimeout { .. }) => {
                let connector = self.connectors.for_type(instance.deployment_type);
                if connector.is_running(&instance.runtime).await {
                    return Err(e);
                }
                return Err(DomainError::start_failure(
                    &module.id,
                    "runtime exited before its API became available",
                ));
            }
            Err(e) => return Err(e),
        }

        for service in module.services.iter().filter(|s| s.is_internal()) {
            let url = self.translator.host_to_service(service)?.as_url();
            self.checker
                .wait_until_available(Method::OPTIONS, &url, timeout, interval)
                .await?;
        }
        Ok(())
    }

    fn publish_endpoints(&self, module: &mut Module, topology: Topology, port: u16, actual: ActualModel) {
        let endpoint = self.translator.external_endpoint(topology, &module.id, port);
        for service in &mut module.services {
            if let Some(operation) = actual.operation_for(&service.id) {
                service.endpoint = Some(service_endpoint(
                    &endpoint,
                    &operation.submodel_id,
                    &operation.id_short_path,
                ));
                service.reference = Some(operation.reference.clone());
            }
        }
        module.external_port = Some(port);
        module.external_endpoint = Some(endpoint);
        module.actual_model = Some(actual.context);
    }

    async fn teardown(&self, module_id: &str, instance: &DeploymentInstance) {
        let connector = self.connectors.for_type(instance.deployment_type);
        if let Err(e) = connector.stop(&instance.runtime).await {
            tracing::warn!(module_id = %module_id, error = %e, "failed to stop runtime");
        }
        self.remove_services(module_id, &instance.services).await;
    }

    async fn remove_services(&self, module_id: &str, services: &[StartedService]) {
        for service in services {
            let stopped = self.containers.stop_container(&service.container_id).await;
            let removed = self.containers.remove_container(&service.container_id).await;
            if let Err(e) = stopped.and(removed) {
                tracing::warn!(
                    module_id = %module_id,
                    service_id = %service.service_id,
                    container = %service.container_id,
                    error = %e,
                    "failed to remove service container"
                );
            }
        }
    }
}

fn shutting_down() -> DomainError {
    DomainError::unavailable(ORCHESTRATOR_NAME, "shutting down")
}
