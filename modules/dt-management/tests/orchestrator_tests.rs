#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{Harness, external_service, internal_service, module, with_mappings};
use dt_management::domain::error::DomainError;
use dt_management::domain::model::{ArgumentMapping, DeploymentType};
use dt_management::domain::orchestrator::LifecycleState;
use dt_management::infra::docker::ContainerSpec;
use http::Method;

#[tokio::test]
async fn second_deploy_conflicts_and_leaves_first_untouched() {
    let h = Harness::new().await;
    let first = h
        .orchestrator
        .deploy(module("m1", DeploymentType::Containerized))
        .await
        .unwrap();
    let port = first.external_port.unwrap();

    let err = h
        .orchestrator
        .deploy(module("m1", DeploymentType::Containerized))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Conflict(_)));

    assert!(h.orchestrator.is_deployed("m1"));
    assert_eq!(h.orchestrator.allocated_port("m1"), Some(port));
    assert_eq!(h.engine.names(), ["modapto-module-m1"]);
    assert!(h.containers.is_running("container-1").await.unwrap());
}

#[tokio::test]
async fn containerized_deploy_publishes_endpoints_and_mounts_model() {
    let h = Harness::new().await;
    let mut m = module("m1", DeploymentType::Containerized);
    m.services.push(external_service("s1", "forecast"));

    let deployed = h.orchestrator.deploy(m).await.unwrap();
    let port = deployed.external_port.unwrap();
    let endpoint = deployed.external_endpoint.clone().unwrap();
    assert_eq!(endpoint, format!("http://localhost:{port}/api/v3.0"));
    assert!(deployed.actual_model.is_some());

    let service = deployed.service("s1").unwrap();
    let service_endpoint = service.endpoint.as_deref().unwrap();
    assert!(service_endpoint.starts_with(&format!("{endpoint}/submodels/")));
    assert!(service_endpoint.ends_with("/submodel-elements/forecast"));
    assert!(service.reference.is_some());
    assert!(h.forwarder.is_subscribed("m1"));

    let created = h.engine.created.lock().clone();
    let spec: &ContainerSpec = &created[0];
    assert_eq!(spec.port_bindings, vec![(port, 8080)]);
    assert!(spec.extra_hosts.contains(&"host.docker.internal:host-gateway".to_owned()));
    assert_eq!(spec.binds.len(), 3);

    let checks = h.checker.checks.lock().clone();
    assert_eq!(
        checks,
        vec![(Method::GET, format!("http://localhost:{port}/api/v3.0/shells"))]
    );
}

#[tokio::test]
async fn readiness_timeout_after_container_start_leaves_no_container() {
    let h = Harness::new().await;
    h.checker.never_ready("/shells");

    let err = h
        .orchestrator
        .deploy(module("m1", DeploymentType::Containerized))
        .await
        .unwrap_err();

    assert!(matches!(err, DomainError::DeploymentTimeout { .. }), "{err}");
    assert!(h.engine.names().is_empty());
    assert_eq!(h.orchestrator.state("m1"), None);
    assert!(!h.forwarder.is_subscribed("m1"));
}

#[tokio::test]
async fn rollback_removes_service_containers_started_before_the_runtime() {
    let h = Harness::new().await;
    h.checker.never_ready("/optimize");
    let mut m = module("m1", DeploymentType::Containerized);
    m.services.push(internal_service("svc-1", "optimizer"));

    let err = h.orchestrator.deploy(m).await.unwrap_err();
    assert!(matches!(err, DomainError::DeploymentTimeout { .. }), "{err}");
    assert!(h.engine.names().is_empty());
    assert_eq!(h.engine.created.lock().len(), 2);
}

#[tokio::test]
async fn exited_runtime_is_a_start_failure_not_a_timeout() {
    let h = Harness::new().await;
    *h.process.exits_immediately.lock() = true;
    h.checker.never_ready("/shells");

    let err = h
        .orchestrator
        .deploy(module("m1", DeploymentType::Internal))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::RuntimeStartFailure { .. }), "{err}");
    assert_eq!(h.process.stopped.lock().len(), 1);
    assert_eq!(h.orchestrator.state("m1"), None);
}

#[tokio::test]
async fn update_preserves_the_external_endpoint() {
    let h = Harness::new().await;
    let deployed = h
        .orchestrator
        .deploy(module("m1", DeploymentType::Internal))
        .await
        .unwrap();

    let mut changed = deployed.clone();
    changed.services.push(external_service("s1", "forecast"));
    let updated = h.orchestrator.update(changed).await.unwrap();

    assert_eq!(updated.external_endpoint, deployed.external_endpoint);
    assert_eq!(updated.external_port, deployed.external_port);
    let started = h.process.started.lock().clone();
    assert_eq!(started.len(), 2);
    assert_eq!(started[0].http_port, started[1].http_port);
    assert_eq!(h.process.stopped.lock().len(), 1);
    assert_eq!(h.process.running_count(), 1);
    assert!(updated.service("s1").unwrap().endpoint.is_some());
}

#[tokio::test]
async fn invalid_update_keeps_the_running_instance() {
    let h = Harness::new().await;
    let deployed = h
        .orchestrator
        .deploy(module("m1", DeploymentType::Internal))
        .await
        .unwrap();

    let mut changed = deployed.clone();
    changed.services.push(with_mappings(
        external_service("s1", "forecast"),
        &[("d", ArgumentMapping::User)],
    ));
    let err = h.orchestrator.update(changed).await.unwrap_err();

    assert!(matches!(err, DomainError::BindingValidationError { .. }));
    assert!(h.orchestrator.is_deployed("m1"));
    assert!(h.process.stopped.lock().is_empty());
}

#[tokio::test]
async fn binding_errors_surface_before_anything_starts() {
    let h = Harness::new().await;
    let mut m = module("m1", DeploymentType::Containerized);
    m.services.push(with_mappings(
        external_service("s1", "forecast"),
        &[
            ("a", ArgumentMapping::Constant("5".to_owned())),
            ("d", ArgumentMapping::Constant("1".to_owned())),
        ],
    ));

    let err = h.orchestrator.deploy(m).await.unwrap_err();
    assert!(matches!(err, DomainError::BindingValidationError { .. }));
    assert!(h.engine.created.lock().is_empty());
    assert!(h.checker.checks.lock().is_empty());
    assert_eq!(h.orchestrator.state("m1"), None);
}

#[tokio::test]
async fn internal_services_get_their_own_container_and_are_checked() {
    let h = Harness::new().await;
    let mut m = module("m1", DeploymentType::Containerized);
    m.services.push(internal_service("svc-1", "optimizer"));

    let deployed = h.orchestrator.deploy(m).await.unwrap();
    let mut names = h.engine.names();
    names.sort();
    assert_eq!(names, ["modapto-module-m1", "modapto-service-svc-1"]);

    let host_port = match &deployed.service("svc-1").unwrap().kind {
        dt_management::ServiceKind::Internal { external_port, .. } => external_port.unwrap(),
        other => panic!("unexpected kind {other:?}"),
    };
    let service_spec = h
        .engine
        .created
        .lock()
        .iter()
        .find(|s| s.name == "modapto-service-svc-1")
        .cloned()
        .unwrap();
    assert_eq!(service_spec.port_bindings, vec![(host_port, 5000)]);
    assert!(
        h.checker
            .checks
            .lock()
            .contains(&(Method::OPTIONS, format!("http://localhost:{host_port}/optimize")))
    );

    h.orchestrator.undeploy(deployed).await.unwrap();
    assert!(h.engine.names().is_empty());
}

#[tokio::test]
async fn undeploy_clears_state_and_tolerates_missing_resources() {
    let h = Harness::new().await;
    let mut m = module("m1", DeploymentType::Containerized);
    m.services.push(external_service("s1", "forecast"));
    let deployed = h.orchestrator.deploy(m).await.unwrap();

    h.engine.vanish("modapto-module-m1");
    let undeployed = h.orchestrator.undeploy(deployed).await.unwrap();

    assert!(undeployed.actual_model.is_none());
    assert!(undeployed.external_endpoint.is_none());
    assert!(undeployed.service("s1").unwrap().endpoint.is_none());
    assert_eq!(h.orchestrator.state("m1"), None);
    assert!(!h.forwarder.is_subscribed("m1"));

    let err = h.orchestrator.undeploy(undeployed).await.unwrap_err();
    assert!(matches!(err, DomainError::NotFound(_)));
}

#[tokio::test]
async fn containerized_deploy_without_engine_fails_fast() {
    let h = Harness::without_engine().await;
    let err = h
        .orchestrator
        .deploy(module("m1", DeploymentType::Containerized))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::ExternalSystemUnavailable { .. }));
    assert_eq!(h.orchestrator.state("m1"), None);

    let deployed = h
        .orchestrator
        .deploy(module("m2", DeploymentType::Internal))
        .await
        .unwrap();
    assert_eq!(h.orchestrator.state(&deployed.id), Some(LifecycleState::Running));
}

#[tokio::test]
async fn starting_the_same_container_twice_leaves_one() {
    let h = Harness::new().await;
    let spec = ContainerSpec {
        name: "modapto-module-m9".to_owned(),
        image: "dt:latest".to_owned(),
        ..ContainerSpec::default()
    };
    let first = h.containers.start_container(spec.clone()).await.unwrap();
    let second = h.containers.start_container(spec).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(h.engine.names(), ["modapto-module-m9"]);
    assert!(h.containers.is_running(&second).await.unwrap());
}

#[tokio::test]
async fn shutdown_tears_down_every_module() {
    let h = Harness::new().await;
    h.orchestrator
        .deploy(module("m1", DeploymentType::Containerized))
        .await
        .unwrap();
    h.orchestrator
        .deploy(module("m2", DeploymentType::Internal))
        .await
        .unwrap();

    h.orchestrator.shutdown().await;
    assert!(h.engine.names().is_empty());
    assert_eq!(h.process.running_count(), 0);
    assert!(!h.orchestrator.is_deployed("m1"));
}

#[tokio::test]
async fn lifecycle_calls_during_a_deploy_conflict() {
    let h = Harness::new().await;
    let gate = h.checker.hold("/shells");
    let orchestrator = h.orchestrator.clone();
    let deploying = tokio::spawn(async move {
        orchestrator
            .deploy(module("m1", DeploymentType::Internal))
            .await
    });
    gate.entered().await;
    assert_eq!(h.orchestrator.state("m1"), Some(LifecycleState::Deploying));

    let err = h
        .orchestrator
        .update(module("m1", DeploymentType::Internal))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Conflict(_)), "{err}");
    let err = h
        .orchestrator
        .undeploy(module("m1", DeploymentType::Internal))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Conflict(_)), "{err}");
    let err = h
        .orchestrator
        .deploy(module("m1", DeploymentType::Internal))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::Conflict(_)), "{err}");

    gate.release();
    deploying.await.unwrap().unwrap();
    assert!(h.orchestrator.is_deployed("m1"));
    assert_eq!(h.process.started.lock().len(), 1);
    assert_eq!(h.process.running_count(), 1);
}

#[tokio::test]
async fn shutdown_during_a_deploy_tears_the_new_runtime_down() {
    let h = Harness::new().await;
    let gate = h.checker.hold("/shells");
    let orchestrator = h.orchestrator.clone();
    let deploying = tokio::spawn(async move {
        orchestrator
            .deploy(module("m1", DeploymentType::Internal))
            .await
    });
    gate.entered().await;

    h.orchestrator.shutdown().await;
    gate.release();
    let err = deploying.await.unwrap().unwrap_err();
    assert!(matches!(err, DomainError::ExternalSystemUnavailable { .. }), "{err}");
    assert_eq!(h.process.running_count(), 0);
    assert_eq!(h.orchestrator.state("m1"), None);
    assert!(!h.forwarder.is_subscribed("m1"));

    let err = h
        .orchestrator
        .deploy(module("m2", DeploymentType::Internal))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::ExternalSystemUnavailable { .. }), "{err}");
    assert_eq!(h.process.started.lock().len(), 1);
}

#[tokio::test]
async fn restore_reuses_the_given_port() {
    let h = Harness::new().await;
    let deployed = h
        .orchestrator
        .deploy(module("m1", DeploymentType::Internal))
        .await
        .unwrap();
    let port = deployed.external_port.unwrap();
    h.orchestrator.undeploy(deployed.clone()).await.unwrap();

    let restored = h
        .orchestrator
        .restore(module("m1", DeploymentType::Internal), port)
        .await
        .unwrap();
    assert_eq!(restored.external_port, Some(port));
    assert_eq!(restored.external_endpoint, deployed.external_endpoint);
    assert_eq!(h.orchestrator.allocated_port("m1"), Some(port));
}
