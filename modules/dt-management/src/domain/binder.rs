//! Turns smart services into model operations and outbound call bindings.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::aas::{
    ElementCollection, LangString, Operation, OperationVariable, Property, Qualifier, Reference,
    SubmodelElement, VALUE_TYPE_DOUBLE, VALUE_TYPE_INT,
};
use super::address::Address;
use super::error::DomainError;
use super::model::{ArgumentMapping, ServiceKind, SmartService};

/// Qualifier marking an input whose value is resolved from another element at invocation time.
pub const QUALIFIER_VALUE_BY_REFERENCE: &str = "ValueByReference";
pub const QUALIFIER_RETURN_RESULTS_FOR_EACH_STEP: &str = "ReturnResultsForEachStep";
const QUALIFIERS_KEY: &str = "qualifiers";

pub const HTTP_ASSET_CONNECTION_CLASS: &str =
    "de.fraunhofer.iosb.ilt.faaast.service.assetconnection.http.HttpAssetConnection";

pub const ARG_CURRENT_TIME: &str = "currentTime";
pub const ARG_TIME_STEP: &str = "timeStep";
pub const ARG_STEP_COUNT: &str = "stepCount";
pub const ARG_ARGUMENTS_PER_STEP: &str = "argumentsPerStep";
pub const ARG_RESULT_PER_STEP: &str = "resultPerStep";

const ALLOWED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// HTTP asset connection handed to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpAssetConnection {
    #[serde(rename = "@class")]
    pub class: String,
    pub base_url: String,
    pub operation_providers: BTreeMap<String, HttpOperationProvider>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpOperationProvider {
    pub format: String,
    pub path: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Output parameter name to JSON path in the response.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub queries: BTreeMap<String, String>,
}

/// Result of binding one smart service.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationBinding {
    pub operation: Operation,
    pub asset_connection: Option<HttpAssetConnection>,
}

/// Builds the operation descriptor and call binding for a smart service.
///
/// `operation_ref` is the reference the operation will have in the actual model;
/// `service_address` is the module→service address for REST-backed services.
///
/// # Errors
/// `ConfigurationConflict` for duplicate parameter names or unsupported HTTP methods,
/// `BindingValidationError` when an argument mapping names an unknown input or assigns a
/// constant to an element that holds no value.
pub fn bind(
    service: &SmartService,
    operation_ref: &Reference,
    service_address: Option<&Address>,
) -> Result<OperationBinding, DomainError> {
    let mut operation = match &service.kind {
        ServiceKind::Embedded { .. } => simulation_operation(service)?,
        ServiceKind::Internal { .. } | ServiceKind::External { .. } => rest_operation(service)?,
    };
    apply_argument_mappings(&service.name, &mut operation, &service.input_argument_types)?;

    let asset_connection = match service.http() {
        None => None,
        Some(http) => {
            let address = service_address.ok_or_else(|| {
                DomainError::configuration_conflict(format!(
                    "service '{}' needs an endpoint address",
                    service.id
                ))
            })?;
            let method = http.method.to_ascii_uppercase();
            if !ALLOWED_METHODS.contains(&method.as_str()) {
                return Err(DomainError::configuration_conflict(format!(
                    "service '{}' uses unsupported HTTP method '{}'",
                    service.id, http.method
                )));
            }
            let provider = HttpOperationProvider {
                format: "JSON".to_owned(),
                path: address.path.clone().unwrap_or_else(|| "/".to_owned()),
                method,
                headers: http.headers.clone(),
                template: http.payload.clone(),
                queries: http.output_mapping.clone(),
            };
            Some(HttpAssetConnection {
                class: HTTP_ASSET_CONNECTION_CLASS.to_owned(),
                base_url: address.base_url(),
                operation_providers: BTreeMap::from([(operation_ref.to_string(), provider)]),
            })
        }
    };

    Ok(OperationBinding {
        operation,
        asset_connection,
    })
}

/// Applies per-input argument mappings to an operation.
///
/// Every mapped name must be an input variable of the operation, whatever the mapping
/// kind; the first unknown name fails the whole binding. Reference qualifiers are added
/// next to any qualifiers the parameter already carries.
///
/// # Errors
/// `BindingValidationError` naming the unknown parameter, or a constant mapped onto an
/// element other than a Property or File.
pub fn apply_argument_mappings(
    service_name: &str,
    operation: &mut Operation,
    mappings: &BTreeMap<String, ArgumentMapping>,
) -> Result<(), DomainError> {
    for (name, mapping) in mappings {
        let Some(variable) = operation.input_mut(name) else {
            return Err(DomainError::binding(
                service_name,
                format!("argument mapping refers to unknown input parameter '{name}'"),
            ));
        };
        match mapping {
            ArgumentMapping::User => {}
            ArgumentMapping::Constant(literal) => {
                set_value(service_name, &mut variable.value, literal)?;
            }
            ArgumentMapping::Reference(path) => add_qualifier(
                &mut variable.value,
                Qualifier::new(QUALIFIER_VALUE_BY_REFERENCE, path.clone()),
            )?,
        }
    }
    Ok(())
}

fn rest_operation(service: &SmartService) -> Result<Operation, DomainError> {
    ensure_unique(service, &service.input_parameters, "input")?;
    ensure_unique(service, &service.output_parameters, "output")?;
    Ok(Operation {
        id_short: Some(service.name.clone()),
        description: description(service),
        input_variables: variables(&service.input_parameters),
        output_variables: variables(&service.output_parameters),
        ..Operation::default()
    })
}

/// Operation executing a bundled simulation step by step.
fn simulation_operation(service: &SmartService) -> Result<Operation, DomainError> {
    let initial = service.initial_arguments();
    let mut per_step = service.input_parameters.clone();
    for element in &mut per_step {
        if let Some(value) = element.id_short().and_then(|n| initial.get(n)).cloned() {
            set_value(&service.name, element, &value)?;
        }
    }

    let inputs = vec![
        SubmodelElement::Property(Property::new(ARG_CURRENT_TIME, VALUE_TYPE_DOUBLE)),
        SubmodelElement::Property(Property::new(ARG_TIME_STEP, VALUE_TYPE_DOUBLE)),
        SubmodelElement::Property(Property::new(ARG_STEP_COUNT, VALUE_TYPE_INT)),
        SubmodelElement::SubmodelElementCollection(ElementCollection {
            id_short: Some(ARG_ARGUMENTS_PER_STEP.to_owned()),
            value: per_step,
            ..ElementCollection::default()
        }),
    ];
    let outputs = vec![SubmodelElement::SubmodelElementCollection(ElementCollection {
        id_short: Some(ARG_RESULT_PER_STEP.to_owned()),
        value: service.output_parameters.clone(),
        ..ElementCollection::default()
    })];

    Ok(Operation {
        id_short: Some(service.name.clone()),
        description: description(service),
        input_variables: variables(&inputs),
        output_variables: variables(&outputs),
        qualifiers: vec![Qualifier::new(
            QUALIFIER_RETURN_RESULTS_FOR_EACH_STEP,
            service.return_results_for_each_step().to_string(),
        )],
        ..Operation::default()
    })
}

fn ensure_unique(
    service: &SmartService,
    params: &[SubmodelElement],
    direction: &str,
) -> Result<(), DomainError> {
    let mut seen = HashSet::new();
    for name in params.iter().filter_map(SubmodelElement::id_short) {
        if !seen.insert(name) {
            return Err(DomainError::configuration_conflict(format!(
                "service '{}' declares {direction} parameter '{name}' more than once",
                service.id
            )));
        }
    }
    Ok(())
}

fn description(service: &SmartService) -> Option<Vec<LangString>> {
    if service.description.is_empty() {
        return None;
    }
    Some(vec![LangString {
        language: "en".to_owned(),
        text: service.description.clone(),
    }])
}

fn variables(elements: &[SubmodelElement]) -> Vec<OperationVariable> {
    elements
        .iter()
        .cloned()
        .map(|value| OperationVariable { value })
        .collect()
}

fn set_value(service_name: &str, element: &mut SubmodelElement, literal: &str) -> Result<(), DomainError> {
    match element {
        SubmodelElement::Property(p) => p.value = Some(literal.to_owned()),
        SubmodelElement::File(f) => f.value = Some(literal.to_owned()),
        other => {
            return Err(DomainError::binding(
                service_name,
                format!(
                    "constant value for parameter '{}' needs a Property or File element",
                    other.id_short().unwrap_or_default()
                ),
            ));
        }
    }
    Ok(())
}

fn add_qualifier(element: &mut SubmodelElement, qualifier: Qualifier) -> Result<(), DomainError> {
    let extra = match element {
        SubmodelElement::Property(p) => {
            p.qualifiers.push(qualifier);
            return Ok(());
        }
        SubmodelElement::Operation(o) => {
            o.qualifiers.push(qualifier);
            return Ok(());
        }
        SubmodelElement::SubmodelElementCollection(c) | SubmodelElement::SubmodelElementList(c) => {
            &mut c.extra
        }
        SubmodelElement::File(f) => &mut f.extra,
        SubmodelElement::Blob(o)
        | SubmodelElement::MultiLanguageProperty(o)
        | SubmodelElement::Range(o)
        | SubmodelElement::ReferenceElement(o)
        | SubmodelElement::Capability(o)
        | SubmodelElement::Entity(o)
        | SubmodelElement::RelationshipElement(o)
        | SubmodelElement::AnnotatedRelationshipElement(o)
        | SubmodelElement::BasicEventElement(o) => &mut o.extra,
    };
    let qualifier = serde_json::to_value(qualifier).map_err(|e| DomainError::Internal(e.into()))?;
    match extra.get_mut(QUALIFIERS_KEY) {
        Some(Value::Array(existing)) => existing.push(qualifier),
        _ => {
            extra.insert(QUALIFIERS_KEY.to_owned(), Value::Array(vec![qualifier]));
        }
    }
    Ok(())
}
