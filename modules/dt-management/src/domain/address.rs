//! Address translation between the orchestrator, modules and their services.
//!
//! Every address decision goes through [`AddressTranslator`]; nothing else in the
//! crate builds host/port pairs by hand.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use super::error::DomainError;
use super::model::{DeploymentType, ServiceKind, SmartService};
use crate::config::DtManagementConfig;

pub const LOOPBACK: &str = "localhost";
pub const HOST_GATEWAY_ALIAS: &str = "host.docker.internal";
/// Port the runtime listens on inside its container.
pub const CONTAINER_HTTP_PORT: u16 = 8080;
pub const MODULE_API_PATH: &str = "/api/v3.0";
pub const PROXY_PATH: &str = "/digital-twins";

const DEFAULT_SCHEME: &str = "http";

/// Where a component runs relative to the container engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Directly on the host (or co-located with the orchestrator).
    Internal,
    /// Inside a container.
    Container,
}

impl From<DeploymentType> for Topology {
    fn from(value: DeploymentType) -> Self {
        match value {
            DeploymentType::Internal => Self::Internal,
            DeploymentType::Containerized => Self::Container,
        }
    }
}

impl FromStr for Topology {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" | "in-process" | "local" => Ok(Self::Internal),
            "container" | "containerized" | "docker" => Ok(Self::Container),
            other => Err(DomainError::unreachable(format!(
                "unsupported deployment topology '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => f.write_str("internal"),
            Self::Container => f.write_str("container"),
        }
    }
}

/// Host, optional port and optional path. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub scheme: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: Option<String>,
}

impl Address {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: None,
            host: host.into(),
            port: Some(port),
            path: None,
        }
    }

    #[must_use]
    pub fn host_only(host: impl Into<String>) -> Self {
        Self {
            scheme: None,
            host: host.into(),
            port: None,
            path: None,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.is_empty() { None } else { Some(path) };
        self
    }

    /// `scheme://host[:port]`, defaulting the scheme to `http`.
    #[must_use]
    pub fn base_url(&self) -> String {
        let scheme = self.scheme.as_deref().unwrap_or(DEFAULT_SCHEME);
        match self.port {
            Some(port) => format!("{scheme}://{}:{port}", self.host),
            None => format!("{scheme}://{}", self.host),
        }
    }

    /// Full URL including the path.
    #[must_use]
    pub fn as_url(&self) -> String {
        match &self.path {
            Some(path) if path.starts_with('/') => format!("{}{path}", self.base_url()),
            Some(path) => format!("{}/{path}", self.base_url()),
            None => self.base_url(),
        }
    }

    /// Parses a URL, inferring `http://` when no scheme is given.
    ///
    /// # Errors
    /// Returns `Validation` if the input is not a URL with a host.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let trimmed = input.trim();
        let normalized = if trimmed.contains("://") {
            trimmed.to_owned()
        } else {
            format!("{DEFAULT_SCHEME}://{trimmed}")
        };
        let url = url::Url::parse(&normalized)
            .map_err(|e| DomainError::validation(format!("invalid URL '{input}': {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| DomainError::validation(format!("URL '{input}' has no host")))?;
        let mut path = url.path().to_owned();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let path = if path == "/" { None } else { Some(path) };
        Ok(Self {
            scheme: Some(url.scheme().to_owned()),
            host: host.to_owned(),
            port: url.port(),
            path,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_url())
    }
}

/// Pure address table keyed by (orchestrator topology, module topology).
#[derive(Debug, Clone)]
pub struct AddressTranslator {
    host: Topology,
    hostname: String,
    external_port: Option<u16>,
    use_proxy: bool,
    expose_via_container_name: bool,
    orchestrator_container_name: String,
    bus_host_override: Option<String>,
    bus_port: u16,
    module_prefix: String,
    service_prefix: String,
}

impl AddressTranslator {
    #[must_use]
    pub fn new(cfg: &DtManagementConfig) -> Self {
        Self {
            host: cfg.host_deployment,
            hostname: cfg.hostname.clone(),
            external_port: cfg.external_port.filter(|port| *port > 0),
            use_proxy: cfg.use_proxy,
            expose_via_container_name: cfg.expose_via_container_name,
            orchestrator_container_name: cfg.docker.container_name.clone(),
            bus_host_override: cfg.events.mqtt_host_from_container.clone(),
            bus_port: cfg.events.mqtt_port,
            module_prefix: cfg.docker.module_container_prefix.clone(),
            service_prefix: cfg.docker.service_container_prefix.clone(),
        }
    }

    #[must_use]
    pub fn host_topology(&self) -> Topology {
        self.host
    }

    #[must_use]
    pub fn module_container_name(&self, module_id: &str) -> String {
        format!("{}{module_id}", self.module_prefix)
    }

    #[must_use]
    pub fn service_container_name(&self, service_id: &str) -> String {
        format!("{}{service_id}", self.service_prefix)
    }

    /// How the orchestrator reaches a module's API.
    #[must_use]
    pub fn host_to_module(&self, module: Topology, module_id: &str, port: u16) -> Address {
        match (self.host, module) {
            (Topology::Internal | Topology::Container, Topology::Internal)
            | (Topology::Internal, Topology::Container) => Address::new(LOOPBACK, port),
            (Topology::Container, Topology::Container) => {
                Address::new(self.module_container_name(module_id), CONTAINER_HTTP_PORT)
            }
        }
    }

    /// How a module reaches the orchestrator (host part only).
    #[must_use]
    pub fn module_to_host(&self, module: Topology) -> Address {
        match (self.host, module) {
            (Topology::Internal | Topology::Container, Topology::Internal) => {
                Address::host_only(LOOPBACK)
            }
            (Topology::Internal, Topology::Container) => Address::host_only(HOST_GATEWAY_ALIAS),
            (Topology::Container, Topology::Container) => Address::host_only(
                self.bus_host_override
                    .clone()
                    .unwrap_or_else(|| self.orchestrator_container_name.clone()),
            ),
        }
    }

    /// Event bus target handed to a module's runtime.
    #[must_use]
    pub fn event_bus_target(&self, module: Topology) -> Address {
        let mut address = self.module_to_host(module);
        address.port = Some(self.bus_port);
        address
    }

    /// How a module reaches one of its services.
    ///
    /// # Errors
    /// `Unreachable` for embedded services, which have no network endpoint;
    /// `ConfigurationConflict` for internal services without an allocated port.
    pub fn module_to_service(
        &self,
        module: Topology,
        service: &SmartService,
    ) -> Result<Address, DomainError> {
        match &service.kind {
            ServiceKind::Embedded { .. } => Err(DomainError::unreachable(format!(
                "embedded service '{}' has no network endpoint",
                service.id
            ))),
            ServiceKind::External { http } => Address::parse(&http.endpoint),
            ServiceKind::Internal {
                internal_port,
                external_port,
                http,
                ..
            } => {
                let address = match (self.host, module) {
                    (Topology::Internal | Topology::Container, Topology::Internal) => {
                        Address::new(LOOPBACK, allocated(service, *external_port)?)
                    }
                    (Topology::Internal | Topology::Container, Topology::Container) => {
                        Address::new(self.service_container_name(&service.id), *internal_port)
                    }
                };
                Ok(address.with_path(endpoint_path(&http.endpoint)))
            }
        }
    }

    /// How the orchestrator reaches an internal service, used for readiness probing.
    ///
    /// # Errors
    /// Same conditions as [`Self::module_to_service`].
    pub fn host_to_service(&self, service: &SmartService) -> Result<Address, DomainError> {
        match &service.kind {
            ServiceKind::Embedded { .. } => Err(DomainError::unreachable(format!(
                "embedded service '{}' has no network endpoint",
                service.id
            ))),
            ServiceKind::External { http } => Address::parse(&http.endpoint),
            ServiceKind::Internal {
                internal_port,
                external_port,
                http,
                ..
            } => {
                let address = match self.host {
                    Topology::Internal => Address::new(LOOPBACK, allocated(service, *external_port)?),
                    Topology::Container => {
                        Address::new(self.service_container_name(&service.id), *internal_port)
                    }
                };
                Ok(address.with_path(endpoint_path(&http.endpoint)))
            }
        }
    }

    /// Endpoint the orchestrator uses to talk to a module's API.
    #[must_use]
    pub fn internal_endpoint(&self, module: Topology, module_id: &str, port: u16) -> String {
        self.host_to_module(module, module_id, port)
            .with_path(MODULE_API_PATH)
            .as_url()
    }

    /// Endpoint advertised to clients outside the orchestrator.
    #[must_use]
    pub fn external_endpoint(&self, module: Topology, module_id: &str, port: u16) -> String {
        let address = if self.use_proxy {
            let host = match self.external_port {
                Some(port) => Address::new(&self.hostname, port),
                None => Address::host_only(&self.hostname),
            };
            host.with_path(format!("{PROXY_PATH}/{module_id}{MODULE_API_PATH}"))
        } else if self.expose_via_container_name && module == Topology::Container {
            Address::new(self.module_container_name(module_id), CONTAINER_HTTP_PORT)
                .with_path(MODULE_API_PATH)
        } else {
            Address::new(&self.hostname, port).with_path(MODULE_API_PATH)
        };
        address.as_url()
    }
}

/// Invocation endpoint of an operation below a module endpoint.
#[must_use]
pub fn service_endpoint(module_endpoint: &str, submodel_id: &str, id_short_path: &str) -> String {
    format!(
        "{}/submodels/{}/submodel-elements/{id_short_path}",
        module_endpoint.trim_end_matches('/'),
        URL_SAFE_NO_PAD.encode(submodel_id)
    )
}

fn allocated(service: &SmartService, port: Option<u16>) -> Result<u16, DomainError> {
    port.ok_or_else(|| {
        DomainError::configuration_conflict(format!(
            "internal service '{}' has no allocated port",
            service.id
        ))
    })
}

/// Path (and query) of a declared service endpoint, which may be a full URL or a bare path.
fn endpoint_path(endpoint: &str) -> String {
    if endpoint.starts_with('/') {
        return endpoint.to_owned();
    }
    Address::parse(endpoint)
        .ok()
        .and_then(|a| a.path)
        .unwrap_or_default()
}
