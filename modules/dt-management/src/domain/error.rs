//! Domain error types for the DT Management module.

use std::time::Duration;

use thiserror::Error;

/// Domain-level errors raised by the deployment orchestrator and its collaborators.
#[derive(Error, Debug)]
pub enum DomainError {
    /// A lifecycle operation is already registered or in flight for the module.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The requested module or service is not known.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Per-service settings contradict each other.
    #[error("Configuration conflict: {0}")]
    ConfigurationConflict(String),

    /// A required external system (e.g. the container engine) cannot be reached.
    #[error("External system unavailable ({system}): {message}")]
    ExternalSystemUnavailable { system: String, message: String },

    /// An endpoint did not become available before the timeout elapsed.
    #[error("{method} {url} not ready within {}", humantime::format_duration(*.timeout))]
    DeploymentTimeout {
        method: String,
        url: String,
        timeout: Duration,
    },

    /// The runtime rejected its configuration or exited during start.
    #[error("Runtime start failure for module {module_id}: {message}")]
    RuntimeStartFailure { module_id: String, message: String },

    /// An argument mapping names a parameter the operation does not have.
    #[error("Invalid argument mapping for service '{service}': {message}")]
    BindingValidationError { service: String, message: String },

    /// An address was requested for an illegal topology combination.
    #[error("Unreachable address: {0}")]
    Unreachable(String),

    /// Invalid input that is not tied to a specific service binding.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DomainError {
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    #[must_use]
    pub fn configuration_conflict(message: impl Into<String>) -> Self {
        Self::ConfigurationConflict(message.into())
    }

    #[must_use]
    pub fn unavailable(system: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalSystemUnavailable {
            system: system.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(method: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self::DeploymentTimeout {
            method: method.into(),
            url: url.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn start_failure(module_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RuntimeStartFailure {
            module_id: module_id.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn binding(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BindingValidationError {
            service: service.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable(message.into())
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns `true` for errors raised before any side effect could have happened.
    #[must_use]
    pub fn is_pre_provisioning(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationConflict(_)
                | Self::BindingValidationError { .. }
                | Self::Unreachable(_)
                | Self::Validation(_)
        )
    }
}
