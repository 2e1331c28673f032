//! Outbound domain events and their wire format.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::DomainError;

pub const SOURCE_DT_MANAGEMENT: &str = "DT Management";
pub const SOURCE_DT: &str = "DT";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    #[default]
    Low,
    Mid,
    High,
}

/// Payload of module lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDetails {
    pub module_id: String,
    pub name: String,
    pub endpoint: Option<String>,
}

/// Payload of service (un)assignment events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAssignment {
    pub service_id: Option<String>,
    pub name: Option<String>,
    pub service_catalog_id: Option<String>,
    pub endpoint: Option<String>,
    pub success: bool,
}

/// Payload of operation invoke/finish events relayed from a running module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInvocation {
    pub service_id: String,
    pub service_catalog_id: Option<String>,
    pub name: String,
    pub endpoint: Option<String>,
    pub invocation_id: Option<String>,
    pub input_arguments: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_arguments: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Typed event payload; the variant determines topic, type and source.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    ModuleCreated(ModuleDetails),
    ModuleUpdated(ModuleDetails),
    ModuleDeleted,
    ServiceAssigned(ServiceAssignment),
    ServiceUnassigned(ServiceAssignment),
    ServiceInvoked(ServiceInvocation),
    ServiceFinished(ServiceInvocation),
}

impl EventPayload {
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Self::ModuleCreated(_) => "modapto-module-creation",
            Self::ModuleUpdated(_) => "modapto-module-update",
            Self::ModuleDeleted => "modapto-module-deletion",
            Self::ServiceAssigned(_) => "smart-service-assigned",
            Self::ServiceUnassigned(_) => "smart-service-unassigned",
            Self::ServiceInvoked(_) => "smart-service-invoke",
            Self::ServiceFinished(_) => "smart-service-finish",
        }
    }

    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ModuleCreated(_) => "Modapto Module created",
            Self::ModuleUpdated(_) => "Modapto Module updated",
            Self::ModuleDeleted => "Modapto Module deleted",
            Self::ServiceAssigned(_) => "Smart Service assigned",
            Self::ServiceUnassigned(_) => "Smart Service unassigned",
            Self::ServiceInvoked(_) => "Smart Service invoked",
            Self::ServiceFinished(_) => "Smart Service finished",
        }
    }

    #[must_use]
    pub fn source_component(&self) -> &'static str {
        match self {
            Self::ServiceInvoked(_) | Self::ServiceFinished(_) => SOURCE_DT,
            _ => SOURCE_DT_MANAGEMENT,
        }
    }

    fn smart_service(&self) -> Option<&str> {
        match self {
            Self::ServiceAssigned(a) | Self::ServiceUnassigned(a) => a.service_id.as_deref(),
            Self::ServiceInvoked(i) | Self::ServiceFinished(i) => Some(i.service_id.as_str()),
            Self::ModuleCreated(_) | Self::ModuleUpdated(_) | Self::ModuleDeleted => None,
        }
    }

    fn results(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::ModuleCreated(d) | Self::ModuleUpdated(d) => serde_json::to_value(d),
            Self::ModuleDeleted => Ok(Value::Null),
            Self::ServiceAssigned(a) | Self::ServiceUnassigned(a) => serde_json::to_value(a),
            Self::ServiceInvoked(i) | Self::ServiceFinished(i) => serde_json::to_value(i),
        }
    }
}

/// An event relayed to the outbound broker.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub priority: Priority,
    pub timestamp: NaiveDateTime,
    pub module_id: String,
    pub payload: EventPayload,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventMessage<'a> {
    priority: Priority,
    source_component: &'a str,
    event_type: &'a str,
    topic: &'a str,
    timestamp: String,
    module: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    smart_service: Option<&'a str>,
    results: Value,
}

impl DomainEvent {
    #[must_use]
    pub fn new(module_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            priority: Priority::default(),
            timestamp: Local::now().naive_local(),
            module_id: module_id.into(),
            payload,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &'static str {
        self.payload.topic()
    }

    /// Serializes the event into its JSON wire form.
    ///
    /// # Errors
    /// Returns `Internal` if the payload cannot be serialized.
    pub fn to_json(&self) -> Result<Vec<u8>, DomainError> {
        let message = EventMessage {
            priority: self.priority,
            source_component: self.payload.source_component(),
            event_type: self.payload.event_type(),
            topic: self.payload.topic(),
            timestamp: self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            module: &self.module_id,
            smart_service: self.payload.smart_service(),
            results: self.payload.results().map_err(anyhow::Error::from)?,
        };
        serde_json::to_vec(&message).map_err(|e| DomainError::Internal(e.into()))
    }
}
