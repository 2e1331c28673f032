//! Smart services assigned by service catalogue id.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::aas::SubmodelElement;
use super::error::DomainError;
use super::model::{ArgumentMapping, SmartService};

const MAX_NAME_LEN: usize = 128;

/// Resolves catalogue entries into smart services.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    /// Fetches entry `catalog_id`; `token` is forwarded as bearer credential.
    ///
    /// The returned service has a fresh id and no binding yet.
    ///
    /// # Errors
    /// `ExternalSystemUnavailable` when the catalogue cannot be reached or does not answer
    /// 200, `Validation` for entries that cannot become a service.
    async fn lookup(&self, catalog_id: &str, token: Option<&str>) -> Result<SmartService, DomainError>;
}

/// Assignment of a catalogue entry to a module. Every field that is set replaces the
/// corresponding value of the catalogue entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    pub service_catalog_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_parameters: Option<Vec<SubmodelElement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_parameters: Option<Vec<SubmodelElement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_argument_types: Option<BTreeMap<String, ArgumentMapping>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

impl ServiceRequest {
    #[must_use]
    pub fn new(service_catalog_id: impl Into<String>) -> Self {
        Self {
            service_catalog_id: service_catalog_id.into(),
            ..Self::default()
        }
    }

    /// # Errors
    /// `Validation` for a blank catalogue id or a name that is not an identifier of at
    /// most 128 characters starting with a letter.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.service_catalog_id.trim().is_empty() {
            return Err(DomainError::validation("serviceCatalogId must not be blank"));
        }
        if let Some(name) = &self.name
            && !is_identifier(name)
        {
            return Err(DomainError::validation(format!(
                "invalid service name '{name}': must start with a letter, contain only letters, digits or '_' and be at most {MAX_NAME_LEN} characters"
            )));
        }
        Ok(())
    }

    pub fn apply_to(self, service: &mut SmartService) {
        if let Some(name) = self.name {
            service.name = name;
        }
        if let Some(description) = self.description {
            service.description = description;
        }
        if let Some(input) = self.input_parameters {
            service.input_parameters = input;
        }
        if let Some(output) = self.output_parameters {
            service.output_parameters = output;
        }
        if let Some(types) = self.input_argument_types {
            service.input_argument_types = types;
        }
        if let Some(properties) = self.properties {
            service.properties = properties;
        }
    }
}

fn is_identifier(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
