#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

//! Shared fakes for the dt-management integration tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dt_management::config::{DtManagementConfig, KafkaConfig, ModuleEventsConfig};
use dt_management::domain::aas::{
    AssetAdministrationShell, EnvironmentContext, Property, SubmodelElement, VALUE_TYPE_DOUBLE,
};
use dt_management::domain::address::AddressTranslator;
use dt_management::domain::error::DomainError;
use dt_management::domain::model::{
    ArgumentMapping, DeploymentType, HttpEndpoint, Module, ServiceKind, SmartService,
};
use dt_management::domain::orchestrator::DeploymentOrchestrator;
use dt_management::domain::service::ModuleService;
use dt_management::infra::bridge::{BrokerPublisher, EventBridge};
use dt_management::infra::connector::{
    ContainerConnector, Connectors, RuntimeBootstrap, RuntimeConnector, RuntimeHandle,
    RuntimeTarget,
};
use dt_management::infra::docker::{
    ContainerEngine, ContainerManager, ContainerSpec, ContainerSummary, EngineError,
};
use dt_management::infra::forwarder::EventForwarder;
use dt_management::infra::readiness::ReadinessCheck;
use futures::StreamExt;
use futures::stream::BoxStream;
use http::Method;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// In-memory container engine.
#[derive(Default)]
pub struct FakeEngine {
    pub containers: Mutex<Vec<ContainerSummary>>,
    pub created: Mutex<Vec<ContainerSpec>>,
    next_id: Mutex<u32>,
}

impl FakeEngine {
    pub fn names(&self) -> Vec<String> {
        self.containers.lock().iter().map(|c| c.name.clone()).collect()
    }

    /// Removes a container behind the manager's back.
    pub fn vanish(&self, name: &str) {
        self.containers.lock().retain(|c| c.name != name);
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, EngineError> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut next = self.next_id.lock();
        *next += 1;
        let id = format!("container-{next}");
        self.containers.lock().push(ContainerSummary {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            running: false,
        });
        self.created.lock().push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut containers = self.containers.lock();
        let container = containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_owned()))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let mut containers = self.containers.lock();
        let container = containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_owned()))?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut containers = self.containers.lock();
        let before = containers.len();
        containers.retain(|c| c.id != id);
        if containers.len() == before {
            return Err(EngineError::NotFound(id.to_owned()));
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, EngineError> {
        Ok(self.containers.lock().clone())
    }

    async fn container_networks(&self, _name: &str) -> Result<Vec<String>, EngineError> {
        Ok(vec!["bridge".to_owned()])
    }

    fn follow_logs(&self, _id: &str) -> BoxStream<'static, Result<String, EngineError>> {
        futures::stream::empty().boxed()
    }
}

/// Runtime connector standing in for co-located child processes.
#[derive(Default)]
pub struct FakeConnector {
    pub started: Mutex<Vec<RuntimeBootstrap>>,
    pub stopped: Mutex<Vec<Uuid>>,
    running: Mutex<HashMap<Uuid, bool>>,
    /// Started runtimes report themselves as exited.
    pub exits_immediately: Mutex<bool>,
}

impl FakeConnector {
    pub fn running_count(&self) -> usize {
        self.running.lock().values().filter(|r| **r).count()
    }
}

#[async_trait]
impl RuntimeConnector for FakeConnector {
    async fn start(&self, bootstrap: &RuntimeBootstrap) -> Result<RuntimeHandle, DomainError> {
        let instance_id = Uuid::now_v7();
        self.started.lock().push(bootstrap.clone());
        self.running
            .lock()
            .insert(instance_id, !*self.exits_immediately.lock());
        Ok(RuntimeHandle {
            module_id: bootstrap.module_id.clone(),
            instance_id,
            http_port: bootstrap.http_port,
            target: RuntimeTarget::Process { pid: Some(4242) },
        })
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), DomainError> {
        self.running.lock().insert(handle.instance_id, false);
        self.stopped.lock().push(handle.instance_id);
        Ok(())
    }

    async fn is_running(&self, handle: &RuntimeHandle) -> bool {
        self.running
            .lock()
            .get(&handle.instance_id)
            .copied()
            .unwrap_or(false)
    }
}

/// Parks a readiness check until the test releases it.
pub struct ReadinessGate {
    entered: Notify,
    release: Semaphore,
}

impl ReadinessGate {
    /// Resolves once a check is parked at the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

/// Readiness checker that answers immediately; URLs containing a registered fragment time out.
#[derive(Default)]
pub struct FakeReadiness {
    pub checks: Mutex<Vec<(Method, String)>>,
    pub never_ready: Mutex<Vec<String>>,
    held: Mutex<Vec<(String, Arc<ReadinessGate>)>>,
}

impl FakeReadiness {
    pub fn never_ready(&self, fragment: &str) {
        self.never_ready.lock().push(fragment.to_owned());
    }

    /// Every check of a URL containing `fragment` waits for one [`ReadinessGate::release`].
    pub fn hold(&self, fragment: &str) -> Arc<ReadinessGate> {
        let gate = Arc::new(ReadinessGate {
            entered: Notify::new(),
            release: Semaphore::new(0),
        });
        self.held.lock().push((fragment.to_owned(), gate.clone()));
        gate
    }
}

#[async_trait]
impl ReadinessCheck for FakeReadiness {
    async fn wait_until_available(
        &self,
        method: Method,
        url: &str,
        timeout: Duration,
        _interval: Duration,
    ) -> Result<(), DomainError> {
        self.checks.lock().push((method.clone(), url.to_owned()));
        let gate = self
            .held
            .lock()
            .iter()
            .find(|(f, _)| url.contains(f.as_str()))
            .map(|(_, gate)| gate.clone());
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.acquire().await.unwrap().forget();
        }
        if self.never_ready.lock().iter().any(|f| url.contains(f.as_str())) {
            return Err(DomainError::timeout(method.as_str(), url, timeout));
        }
        Ok(())
    }
}

/// Broker publisher that records every message.
#[derive(Default)]
pub struct RecordingPublisher {
    pub sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingPublisher {
    pub fn topics(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl BrokerPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, _key: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        self.sent
            .lock()
            .push((topic.to_owned(), serde_json::from_slice(&payload)?));
        Ok(())
    }
}

/// Fully wired orchestrator over in-memory fakes.
pub struct Harness {
    pub config: DtManagementConfig,
    pub engine: Arc<FakeEngine>,
    pub containers: Arc<ContainerManager>,
    pub process: Arc<FakeConnector>,
    pub checker: Arc<FakeReadiness>,
    pub publisher: Arc<RecordingPublisher>,
    pub bridge: Arc<EventBridge>,
    pub forwarder: Arc<EventForwarder>,
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub service: ModuleService,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(DtManagementConfig::default(), true).await
    }

    pub async fn without_engine() -> Self {
        Self::with_config(DtManagementConfig::default(), false).await
    }

    pub async fn with_config(config: DtManagementConfig, engine_available: bool) -> Self {
        let engine = Arc::new(FakeEngine::default());
        let containers = if engine_available {
            ContainerManager::connect(
                Some(engine.clone() as Arc<dyn ContainerEngine>),
                &config.docker,
                None,
                CancellationToken::new(),
            )
            .await
        } else {
            ContainerManager::disabled(&config.docker)
        };
        let containers = Arc::new(containers);
        let translator = AddressTranslator::new(&config);

        let process = Arc::new(FakeConnector::default());
        let connectors = Connectors::new(
            process.clone(),
            Arc::new(ContainerConnector::new(
                containers.clone(),
                translator.clone(),
                &config.docker,
            )),
        );

        let publisher = Arc::new(RecordingPublisher::default());
        let bridge = Arc::new(EventBridge::started(
            publisher.clone(),
            &KafkaConfig::default(),
        ));
        let forwarder = Arc::new(EventForwarder::new(
            bridge.clone(),
            &ModuleEventsConfig::default(),
        ));
        forwarder.start();

        let checker = Arc::new(FakeReadiness::default());
        let orchestrator = Arc::new(DeploymentOrchestrator::new(
            translator,
            connectors,
            containers.clone(),
            checker.clone(),
            forwarder.clone(),
            config.readiness.clone(),
        ));
        let service = ModuleService::new(orchestrator.clone(), bridge.clone());

        Self {
            config,
            engine,
            containers,
            process,
            checker,
            publisher,
            bridge,
            forwarder,
            orchestrator,
            service,
        }
    }

    /// Flushes both relays so every published event reached the recorder.
    pub async fn drain_events(&self) {
        assert_eq!(self.forwarder.shutdown().await, 0);
        assert_eq!(self.bridge.shutdown().await, 0);
    }
}

pub fn model(shell_id_short: &str) -> EnvironmentContext {
    let mut context = EnvironmentContext::default();
    context
        .environment
        .asset_administration_shells
        .push(AssetAdministrationShell {
            id: format!("urn:shell:{shell_id_short}"),
            id_short: Some(shell_id_short.to_owned()),
            submodels: Vec::new(),
            extra: serde_json::Map::new(),
        });
    context
}

pub fn module(id: &str, deployment_type: DeploymentType) -> Module {
    let mut module = Module::new(id, deployment_type, model("Robot"));
    module.name = format!("module {id}");
    module
}

fn inputs(names: &[&str]) -> Vec<SubmodelElement> {
    names
        .iter()
        .map(|n| SubmodelElement::Property(Property::new(*n, VALUE_TYPE_DOUBLE)))
        .collect()
}

pub fn external_service(id: &str, name: &str) -> SmartService {
    let mut service = SmartService::new(
        id,
        name,
        ServiceKind::External {
            http: HttpEndpoint::new("http://forecast.example.com/api/run", "POST"),
        },
    );
    service.service_catalog_id = Some(format!("catalog-{id}"));
    service.input_parameters = inputs(&["a", "b", "c"]);
    service.output_parameters = inputs(&["result"]);
    service
}

pub fn internal_service(id: &str, name: &str) -> SmartService {
    let mut service = SmartService::new(
        id,
        name,
        ServiceKind::Internal {
            image: "acme/optimizer:1".to_owned(),
            internal_port: 5000,
            http: HttpEndpoint::new("/optimize", "POST"),
            external_port: None,
        },
    );
    service.input_parameters = inputs(&["load"]);
    service
}

pub fn with_mappings(mut service: SmartService, mappings: &[(&str, ArgumentMapping)]) -> SmartService {
    service.input_argument_types = mappings
        .iter()
        .map(|(name, mapping)| ((*name).to_owned(), mapping.clone()))
        .collect::<BTreeMap<_, _>>();
    service
}
