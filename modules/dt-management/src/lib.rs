//! DT Management: deployment and addressing orchestrator for digital-twin modules.
//!
//! [`domain::service::ModuleService`] is the entry point; it drives the
//! [`domain::orchestrator::DeploymentOrchestrator`], which in turn uses the runtime
//! connectors, the container manager, the readiness checker and the event relays in
//! [`infra`].
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod domain;
pub mod infra;

pub use config::DtManagementConfig;
pub use domain::catalog::{ServiceCatalog, ServiceRequest};
pub use domain::error::DomainError;
pub use domain::model::{DeploymentType, Module, ServiceKind, SmartService};
pub use domain::orchestrator::DeploymentOrchestrator;
pub use domain::service::ModuleService;
