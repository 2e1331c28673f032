//! Module and smart-service management on top of the orchestrator.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::aas::EnvironmentContext;
use super::catalog::{ServiceCatalog, ServiceRequest};
use super::error::DomainError;
use super::events::{DomainEvent, EventPayload, ModuleDetails, ServiceAssignment};
use super::model::{Module, SmartService, sanitize_service_name};
use super::orchestrator::DeploymentOrchestrator;
use crate::infra::bridge::EventBridge;

const CATALOG_NAME: &str = "Service Catalog";

/// Keeps the set of managed modules and publishes a lifecycle event for every mutation.
///
/// Mutations of one module id are serialized; different modules proceed in parallel.
#[derive(Clone)]
pub struct ModuleService {
    orchestrator: Arc<DeploymentOrchestrator>,
    bridge: Arc<EventBridge>,
    catalog: Option<Arc<dyn ServiceCatalog>>,
    modules: Arc<DashMap<String, Module>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ModuleService {
    #[must_use]
    pub fn new(orchestrator: Arc<DeploymentOrchestrator>, bridge: Arc<EventBridge>) -> Self {
        Self {
            orchestrator,
            bridge,
            catalog: None,
            modules: Arc::new(DashMap::new()),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Enables [`Self::assign_service`].
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn ServiceCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Get a module by id.
    ///
    /// # Errors
    /// `NotFound` for unknown ids.
    pub fn get_module(&self, module_id: &str) -> Result<Module, DomainError> {
        self.modules
            .get(module_id)
            .map(|m| m.value().clone())
            .ok_or_else(|| DomainError::not_found(format!("module '{module_id}'")))
    }

    /// All modules ordered by id.
    #[must_use]
    pub fn list_modules(&self) -> Vec<Module> {
        let mut modules: Vec<Module> = self.modules.iter().map(|m| m.value().clone()).collect();
        modules.sort_by(|a, b| a.id.cmp(&b.id));
        modules
    }

    /// Registers and deploys a new module.
    ///
    /// An empty id is replaced by a random one; an empty name defaults to the idShort of
    /// the model's first shell.
    ///
    /// # Errors
    /// `Conflict` for a known id, `Validation` when no name can be derived, plus any
    /// deployment error.
    pub async fn create_module(&self, mut module: Module) -> Result<Module, DomainError> {
        if module.id.is_empty() {
            module.id = Uuid::new_v4().to_string();
        }
        let _guard = self.lock(&module.id).await;
        if self.modules.contains_key(&module.id) {
            return Err(DomainError::conflict(format!("module '{}' already exists", module.id)));
        }
        if module.name.is_empty() {
            module.name = default_name(&module.provided_model).ok_or_else(|| {
                DomainError::validation(format!(
                    "module '{}' has no name and its model has no shell idShort",
                    module.id
                ))
            })?;
        }

        let deployed = self.orchestrator.deploy(module).await?;
        self.modules.insert(deployed.id.clone(), deployed.clone());
        self.publish(&deployed.id, EventPayload::ModuleCreated(details(&deployed)));
        Ok(deployed)
    }

    /// Replaces the provided model of a module and redeploys it.
    ///
    /// # Errors
    /// `NotFound` for unknown ids plus any deployment error.
    pub async fn update_module(
        &self,
        module_id: &str,
        model: EnvironmentContext,
    ) -> Result<Module, DomainError> {
        let _guard = self.lock(module_id).await;
        let previous = self.get_module(module_id)?;
        let mut next = previous.clone();
        next.provided_model = model;

        let updated = self.redeploy(previous, next).await?;
        self.publish(&updated.id, EventPayload::ModuleUpdated(details(&updated)));
        Ok(updated)
    }

    /// Undeploys and forgets a module.
    ///
    /// # Errors
    /// `NotFound` for unknown ids, `Conflict` while a lifecycle operation is in flight.
    pub async fn delete_module(&self, module_id: &str) -> Result<(), DomainError> {
        let _guard = self.lock(module_id).await;
        let module = self.get_module(module_id)?;
        match self.orchestrator.undeploy(module).await {
            Ok(_) | Err(DomainError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.modules.remove(module_id);
        self.publish(module_id, EventPayload::ModuleDeleted);
        Ok(())
    }

    /// Adds a smart service to a module and redeploys it.
    ///
    /// The assignment event is published whether or not the redeploy succeeds.
    ///
    /// # Errors
    /// `NotFound` for unknown modules, `Conflict` for a duplicate service id, plus any
    /// deployment error.
    pub async fn add_service(
        &self,
        module_id: &str,
        mut service: SmartService,
    ) -> Result<SmartService, DomainError> {
        let _guard = self.lock(module_id).await;
        let previous = self.get_module(module_id)?;
        if previous.service(&service.id).is_some() {
            return Err(DomainError::conflict(format!(
                "service '{}' already assigned to module '{module_id}'",
                service.id
            )));
        }
        service.name = sanitize_service_name(&service.name, &service.id);
        let mut next = previous.clone();
        next.services.push(service.clone());

        match self.redeploy(previous, next).await {
            Ok(updated) => {
                let bound = updated.service(&service.id).cloned().unwrap_or(service);
                self.publish(
                    module_id,
                    EventPayload::ServiceAssigned(assignment(&bound, true)),
                );
                Ok(bound)
            }
            Err(e) => {
                self.publish(
                    module_id,
                    EventPayload::ServiceAssigned(assignment(&service, false)),
                );
                Err(e)
            }
        }
    }

    /// Resolves a catalogue entry, applies the overrides of `request` and adds the result
    /// like [`Self::add_service`]. `token` is passed on to the catalogue.
    ///
    /// # Errors
    /// `Validation` for an invalid request, `NotFound` for unknown modules,
    /// `ExternalSystemUnavailable` when no catalogue is configured or it fails, plus any
    /// error of [`Self::add_service`].
    pub async fn assign_service(
        &self,
        module_id: &str,
        request: ServiceRequest,
        token: Option<&str>,
    ) -> Result<SmartService, DomainError> {
        request.validate()?;
        self.get_module(module_id)?;
        let catalog = self
            .catalog
            .as_ref()
            .ok_or_else(|| DomainError::unavailable(CATALOG_NAME, "no service catalogue configured"))?;
        let mut service = catalog.lookup(&request.service_catalog_id, token).await?;
        request.apply_to(&mut service);
        self.add_service(module_id, service).await
    }

    /// Removes a smart service from a module and redeploys it.
    ///
    /// # Errors
    /// `NotFound` for unknown modules or services, plus any deployment error.
    pub async fn remove_service(&self, module_id: &str, service_id: &str) -> Result<(), DomainError> {
        let _guard = self.lock(module_id).await;
        let previous = self.get_module(module_id)?;
        let service = previous.service(service_id).cloned().ok_or_else(|| {
            DomainError::not_found(format!("service '{service_id}' in module '{module_id}'"))
        })?;
        let mut next = previous.clone();
        next.services.retain(|s| s.id != service_id);

        let result = self.redeploy(previous, next).await;
        self.publish(
            module_id,
            EventPayload::ServiceUnassigned(assignment(&service, result.is_ok())),
        );
        result.map(|_| ())
    }

    async fn lock(&self, module_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(module_id.to_owned()).or_default().value());
        lock.lock_owned().await
    }

    /// Updates the deployment and stores the result. When the update leaves the module
    /// undeployed the previous definition is deployed again on its previous port.
    async fn redeploy(&self, previous: Module, next: Module) -> Result<Module, DomainError> {
        match self.orchestrator.update(next).await {
            Ok(updated) => {
                self.modules.insert(updated.id.clone(), updated.clone());
                Ok(updated)
            }
            Err(e) => {
                if !e.is_pre_provisioning() && self.orchestrator.state(&previous.id).is_none() {
                    self.restore(previous).await;
                }
                Err(e)
            }
        }
    }

    /// Stores the redeployed previous definition, or the undeployed one if that fails too.
    async fn restore(&self, previous: Module) {
        let module_id = previous.id.clone();
        let restored = match previous.external_port {
            Some(port) => self.orchestrator.restore(previous.clone(), port).await,
            None => self.orchestrator.deploy(previous.clone()).await,
        };
        match restored {
            Ok(restored) => {
                tracing::info!(module_id = %module_id, endpoint = ?restored.external_endpoint, "previous module definition restored");
                self.modules.insert(module_id, restored);
            }
            Err(e) => {
                tracing::error!(module_id = %module_id, error = %e, "failed to restore previous module definition");
                let mut undeployed = previous;
                undeployed.clear_deployment();
                self.modules.insert(module_id, undeployed);
            }
        }
    }

    fn publish(&self, module_id: &str, payload: EventPayload) {
        self.bridge.publish(DomainEvent::new(module_id, payload));
    }
}

fn default_name(model: &EnvironmentContext) -> Option<String> {
    model
        .environment
        .asset_administration_shells
        .first()
        .and_then(|shell| shell.id_short.clone())
        .filter(|name| !name.is_empty())
}

fn details(module: &Module) -> ModuleDetails {
    ModuleDetails {
        module_id: module.id.clone(),
        name: module.name.clone(),
        endpoint: module.external_endpoint.clone(),
    }
}

fn assignment(service: &SmartService, success: bool) -> ServiceAssignment {
    ServiceAssignment {
        service_id: Some(service.id.clone()),
        name: Some(service.name.clone()),
        service_catalog_id: service.service_catalog_id.clone(),
        endpoint: service.endpoint.clone(),
        success,
    }
}
