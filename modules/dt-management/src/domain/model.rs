//! Module and smart-service definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::aas::{EnvironmentContext, Reference, SubmodelElement};

/// How a module's digital-twin runtime is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentType {
    /// Co-located with the orchestrator as a child process.
    Internal,
    /// Inside its own container.
    #[default]
    Containerized,
}

/// A deployable unit wrapping one digital-twin model and its smart services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub deployment_type: DeploymentType,
    pub provided_model: EnvironmentContext,
    /// Rebuilt on every deploy or update, `None` while not deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_model: Option<EnvironmentContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_endpoint: Option<String>,
    #[serde(default)]
    pub services: Vec<SmartService>,
    /// Additional asset connections passed through to the runtime untouched.
    #[serde(default)]
    pub asset_connections: Vec<Value>,
}

impl Module {
    #[must_use]
    pub fn new(id: impl Into<String>, deployment_type: DeploymentType, model: EnvironmentContext) -> Self {
        Self {
            id: id.into(),
            deployment_type,
            provided_model: model,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn service(&self, service_id: &str) -> Option<&SmartService> {
        self.services.iter().find(|s| s.id == service_id)
    }

    /// Returns `true` while the module has a live runtime behind it.
    #[must_use]
    pub fn is_deployed(&self) -> bool {
        self.actual_model.is_some()
    }

    /// Drops everything a deployment derived: actual model, ports and endpoints.
    pub fn clear_deployment(&mut self) {
        self.actual_model = None;
        self.external_port = None;
        self.external_endpoint = None;
        for service in &mut self.services {
            service.endpoint = None;
            if let ServiceKind::Internal { external_port, .. } = &mut service.kind {
                *external_port = None;
            }
        }
    }
}

/// Per-parameter source of an operation argument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "UPPERCASE")]
pub enum ArgumentMapping {
    /// Supplied by the caller at invocation time.
    #[default]
    User,
    /// Fixed literal baked into the operation.
    Constant(String),
    /// Fetched at invocation time from the referenced model element.
    Reference(String),
}

/// Outbound HTTP call description of a REST-backed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpEndpoint {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Output parameter name to JSON path in the response body.
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
}

fn default_method() -> String {
    "POST".to_owned()
}

impl HttpEndpoint {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, method: &str) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.to_owned(),
            headers: BTreeMap::new(),
            payload: None,
            output_mapping: BTreeMap::new(),
        }
    }
}

/// Variant-specific part of a smart service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServiceKind {
    /// Bundled simulation artifact executed by the runtime itself.
    Embedded {
        #[serde(with = "fmu_bytes")]
        fmu: Vec<u8>,
    },
    /// Backed by a private container started next to the module.
    #[serde(rename_all = "camelCase")]
    Internal {
        image: String,
        internal_port: u16,
        http: HttpEndpoint,
        /// Host port allocated while deployed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_port: Option<u16>,
    },
    /// Backed by a pre-existing remote endpoint.
    External { http: HttpEndpoint },
}

/// A callable operation exposed through a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartService {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_catalog_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_parameters: Vec<SubmodelElement>,
    #[serde(default)]
    pub output_parameters: Vec<SubmodelElement>,
    #[serde(default)]
    pub input_argument_types: BTreeMap<String, ArgumentMapping>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(flatten)]
    pub kind: ServiceKind,
    /// Reference of the bound operation in the actual model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<Reference>,
    /// Resolved invocation endpoint, only set while the owning module is deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

const PROPERTY_RETURN_RESULTS_FOR_EACH_STEP: &str = "returnResultsForEachStep";
const PROPERTY_INITIAL_ARGUMENTS: &str = "initialArguments";

impl SmartService {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ServiceKind) -> Self {
        Self {
            id: id.into(),
            service_catalog_id: None,
            name: name.into(),
            description: String::new(),
            input_parameters: Vec::new(),
            output_parameters: Vec::new(),
            input_argument_types: BTreeMap::new(),
            properties: Map::new(),
            kind,
            reference: None,
            endpoint: None,
        }
    }

    #[must_use]
    pub fn http(&self) -> Option<&HttpEndpoint> {
        match &self.kind {
            ServiceKind::Internal { http, .. } | ServiceKind::External { http } => Some(http),
            ServiceKind::Embedded { .. } => None,
        }
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self.kind, ServiceKind::Internal { .. })
    }

    /// `returnResultsForEachStep` property of embedded services, `true` when absent.
    #[must_use]
    pub fn return_results_for_each_step(&self) -> bool {
        match self.properties.get(PROPERTY_RETURN_RESULTS_FOR_EACH_STEP) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => true,
        }
    }

    /// `initialArguments` property of embedded services.
    #[must_use]
    pub fn initial_arguments(&self) -> BTreeMap<String, String> {
        let Some(Value::Object(map)) = self.properties.get(PROPERTY_INITIAL_ARGUMENTS) else {
            return BTreeMap::new();
        };
        map.iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// Normalizes a user supplied service name into a valid operation idShort.
///
/// Spaces become underscores and anything outside `[A-Za-z0-9_]` is dropped. Names
/// that do not start with a letter or are shorter than five characters fall back to
/// the service id; longer names are truncated to 128 characters.
#[must_use]
pub fn sanitize_service_name(name: &str, service_id: &str) -> String {
    const MIN_LEN: usize = 5;
    const MAX_LEN: usize = 128;

    let cleaned: String = name
        .trim()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    if cleaned.is_empty()
        || !cleaned.starts_with(|c: char| c.is_ascii_alphabetic())
        || cleaned.len() < MIN_LEN
    {
        return service_id.to_owned();
    }
    cleaned.chars().take(MAX_LEN).collect()
}

mod fmu_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
