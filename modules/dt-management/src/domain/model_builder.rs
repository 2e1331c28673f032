//! Pure rebuild of a module's actual model from its provided model and services.

use serde_json::Value;

use super::aas::{
    ElementCollection, EnvironmentContext, FileElement, InMemoryFile, KeyType, Reference,
    Submodel, SubmodelElement,
};
use super::address::Address;
use super::binder;
use super::error::DomainError;
use super::model::{Module, ServiceKind, SmartService};

/// Semantic id of the submodel holding generated service operations.
pub const SMART_SERVICE_CONTAINER_SEMANTIC_ID: &str = "http://modapto.eu/smart-service-container";
pub const SMART_SERVICE_CONTAINER_ID_SHORT: &str = "SmartServices";

pub const SIMULATION_MODELS_SEMANTIC_ID: &str =
    "https://admin-shell.io/idta/SimulationModels/SimulationModels/1/0";
pub const SIMULATION_MODEL_SEMANTIC_ID: &str =
    "https://admin-shell.io/idta/SimulationModels/SimulationModel/1/0";
pub const SIMULATION_MODELS_ID_SHORT: &str = "SimulationModels";
const FMU_CONTENT_TYPE: &str = "application/octet-stream";

/// Operation generated for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundOperation {
    pub service_id: String,
    pub reference: Reference,
    pub submodel_id: String,
    pub id_short_path: String,
}

/// Output of a rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct ActualModel {
    pub context: EnvironmentContext,
    /// User supplied asset connections followed by one per REST-backed service.
    pub asset_connections: Vec<Value>,
    pub operations: Vec<BoundOperation>,
}

impl ActualModel {
    #[must_use]
    pub fn operation_for(&self, service_id: &str) -> Option<&BoundOperation> {
        self.operations.iter().find(|o| o.service_id == service_id)
    }
}

/// Rebuilds the actual model.
///
/// `resolve` yields the module→service address for REST-backed services. The provided
/// model is never modified; the result is derived from scratch on every call.
///
/// # Errors
/// `ConfigurationConflict` when two services would produce the same operation, plus
/// any error from address resolution or binding.
pub fn build_actual_model<F>(module: &Module, resolve: F) -> Result<ActualModel, DomainError>
where
    F: Fn(&SmartService) -> Result<Option<Address>, DomainError>,
{
    let mut context = module.provided_model.clone();
    let mut asset_connections = module.asset_connections.clone();
    let mut operations = Vec::with_capacity(module.services.len());

    if module.services.is_empty() {
        return Ok(ActualModel {
            context,
            asset_connections,
            operations,
        });
    }

    let container_idx = ensure_submodel(
        &mut context,
        SMART_SERVICE_CONTAINER_SEMANTIC_ID,
        &format!("{SMART_SERVICE_CONTAINER_SEMANTIC_ID}/{}", module.id),
        SMART_SERVICE_CONTAINER_ID_SHORT,
    );

    for service in &module.services {
        let submodel = &context.environment.submodels[container_idx];
        if submodel.element(&service.name).is_some() {
            return Err(DomainError::configuration_conflict(format!(
                "operation '{}' already exists in module '{}'",
                service.name, module.id
            )));
        }
        let submodel_id = submodel.id.clone();
        let reference = submodel.reference().child(KeyType::Operation, &service.name);

        let address = resolve(service)?;
        let binding = binder::bind(service, &reference, address.as_ref())?;

        context.environment.submodels[container_idx]
            .submodel_elements
            .push(SubmodelElement::Operation(binding.operation));
        if let Some(connection) = binding.asset_connection {
            let value = serde_json::to_value(connection).map_err(anyhow::Error::from)?;
            asset_connections.push(value);
        }
        if let ServiceKind::Embedded { fmu } = &service.kind {
            add_simulation_model(&mut context, service, fmu);
        }

        operations.push(BoundOperation {
            service_id: service.id.clone(),
            id_short_path: reference.id_short_path(),
            reference,
            submodel_id,
        });
    }

    Ok(ActualModel {
        context,
        asset_connections,
        operations,
    })
}

/// Index of the submodel carrying `semantic_id`, creating and linking it on first use.
fn ensure_submodel(
    context: &mut EnvironmentContext,
    semantic_id: &str,
    new_id: &str,
    id_short: &str,
) -> usize {
    if let Some(idx) = context
        .environment
        .submodels
        .iter()
        .position(|s| s.has_semantic_id(semantic_id))
    {
        return idx;
    }
    let submodel = Submodel::new(new_id, id_short, semantic_id);
    let reference = submodel.reference();
    if let Some(shell) = context.environment.asset_administration_shells.first_mut()
        && !shell.submodels.contains(&reference)
    {
        shell.submodels.push(reference);
    }
    context.environment.submodels.push(submodel);
    context.environment.submodels.len() - 1
}

fn add_simulation_model(context: &mut EnvironmentContext, service: &SmartService, fmu: &[u8]) {
    let file_path = format!("/{}.fmu", service.name);
    let submodel_id = format!(
        "{SIMULATION_MODELS_SEMANTIC_ID}/{}",
        context
            .environment
            .asset_administration_shells
            .first()
            .map_or("default", |s| s.id.as_str())
    );
    let idx = ensure_submodel(
        context,
        SIMULATION_MODELS_SEMANTIC_ID,
        &submodel_id,
        SIMULATION_MODELS_ID_SHORT,
    );

    let digital_file = SubmodelElement::File(FileElement {
        id_short: Some("DigitalFile".to_owned()),
        content_type: FMU_CONTENT_TYPE.to_owned(),
        value: Some(file_path.clone()),
        ..FileElement::default()
    });
    let version = SubmodelElement::SubmodelElementCollection(ElementCollection {
        id_short: Some("ModelFileVersion".to_owned()),
        value: vec![digital_file],
        ..ElementCollection::default()
    });
    let model_file = SubmodelElement::SubmodelElementCollection(ElementCollection {
        id_short: Some("ModelFile".to_owned()),
        value: vec![version],
        ..ElementCollection::default()
    });
    let simulation_model = SubmodelElement::SubmodelElementCollection(ElementCollection {
        id_short: Some(service.name.clone()),
        semantic_id: Some(Reference::external(SIMULATION_MODEL_SEMANTIC_ID)),
        value: vec![model_file],
        ..ElementCollection::default()
    });

    let submodel = &mut context.environment.submodels[idx];
    submodel
        .submodel_elements
        .retain(|e| e.id_short() != Some(service.name.as_str()));
    submodel.submodel_elements.push(simulation_model);

    context.files.retain(|f| f.path != file_path);
    context.files.push(InMemoryFile {
        path: file_path,
        content: fmu.to_vec(),
    });
}
