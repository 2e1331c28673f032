//! Minimal, lossless digital-twin model (asset administration shell environment).
//!
//! Only the parts the orchestrator inspects or generates are typed. Everything else
//! is kept in `extra` maps so a provided model round-trips through a rebuild untouched.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

pub const VALUE_TYPE_STRING: &str = "xs:string";
pub const VALUE_TYPE_DOUBLE: &str = "xs:double";
pub const VALUE_TYPE_INT: &str = "xs:int";

/// A model together with the binary files it references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentContext {
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<InMemoryFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InMemoryFile {
    pub path: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asset_administration_shells: Vec<AssetAdministrationShell>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub submodels: Vec<Submodel>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetAdministrationShell {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub submodels: Vec<Reference>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submodel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<Reference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub submodel_elements: Vec<SubmodelElement>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Submodel {
    #[must_use]
    pub fn new(id: impl Into<String>, id_short: impl Into<String>, semantic_id: &str) -> Self {
        Self {
            id: id.into(),
            id_short: Some(id_short.into()),
            semantic_id: Some(Reference::external(semantic_id)),
            submodel_elements: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Returns `true` when the submodel's semantic id carries the given marker.
    #[must_use]
    pub fn has_semantic_id(&self, marker: &str) -> bool {
        self.semantic_id
            .as_ref()
            .is_some_and(|r| r.keys.iter().any(|k| k.value == marker))
    }

    #[must_use]
    pub fn reference(&self) -> Reference {
        Reference::model(vec![Key::new(KeyType::Submodel, &self.id)])
    }

    #[must_use]
    pub fn element(&self, id_short: &str) -> Option<&SubmodelElement> {
        self.submodel_elements
            .iter()
            .find(|e| e.id_short() == Some(id_short))
    }
}

/// Submodel elements discriminated by `modelType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "modelType")]
pub enum SubmodelElement {
    Property(Property),
    Operation(Operation),
    SubmodelElementCollection(ElementCollection),
    SubmodelElementList(ElementCollection),
    File(FileElement),
    Blob(OpaqueElement),
    MultiLanguageProperty(OpaqueElement),
    Range(OpaqueElement),
    ReferenceElement(OpaqueElement),
    Capability(OpaqueElement),
    Entity(OpaqueElement),
    RelationshipElement(OpaqueElement),
    AnnotatedRelationshipElement(OpaqueElement),
    BasicEventElement(OpaqueElement),
}

impl SubmodelElement {
    #[must_use]
    pub fn id_short(&self) -> Option<&str> {
        match self {
            Self::Property(p) => p.id_short.as_deref(),
            Self::Operation(o) => o.id_short.as_deref(),
            Self::SubmodelElementCollection(c) | Self::SubmodelElementList(c) => {
                c.id_short.as_deref()
            }
            Self::File(f) => f.id_short.as_deref(),
            Self::Blob(o)
            | Self::MultiLanguageProperty(o)
            | Self::Range(o)
            | Self::ReferenceElement(o)
            | Self::Capability(o)
            | Self::Entity(o)
            | Self::RelationshipElement(o)
            | Self::AnnotatedRelationshipElement(o)
            | Self::BasicEventElement(o) => o.id_short.as_deref(),
        }
    }

    #[must_use]
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Operation(_) => KeyType::Operation,
            Self::SubmodelElementCollection(_) => KeyType::SubmodelElementCollection,
            Self::SubmodelElementList(_) => KeyType::SubmodelElementList,
            Self::File(_) => KeyType::File,
            Self::Property(_) => KeyType::Property,
            _ => KeyType::SubmodelElement,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(default = "default_value_type")]
    pub value_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualifiers: Vec<Qualifier>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_value_type() -> String {
    VALUE_TYPE_STRING.to_owned()
}

impl Property {
    #[must_use]
    pub fn new(id_short: impl Into<String>, value_type: &str) -> Self {
        Self {
            id_short: Some(id_short.into()),
            value_type: value_type.to_owned(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Vec<LangString>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_variables: Vec<OperationVariable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_variables: Vec<OperationVariable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inoutput_variables: Vec<OperationVariable>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub qualifiers: Vec<Qualifier>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Operation {
    #[must_use]
    pub fn input(&self, id_short: &str) -> Option<&OperationVariable> {
        self.input_variables
            .iter()
            .find(|v| v.value.id_short() == Some(id_short))
    }

    pub fn input_mut(&mut self, id_short: &str) -> Option<&mut OperationVariable> {
        self.input_variables
            .iter_mut()
            .find(|v| v.value.id_short() == Some(id_short))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationVariable {
    pub value: SubmodelElement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LangString {
    pub language: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementCollection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_id: Option<Reference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<SubmodelElement>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileElement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(default)]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpaqueElement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_short: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Qualifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "type")]
    pub qualifier_type: String,
    #[serde(default = "default_value_type")]
    pub value_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Qualifier {
    #[must_use]
    pub fn new(qualifier_type: &str, value: impl Into<String>) -> Self {
        Self {
            kind: Some("ConceptQualifier".to_owned()),
            qualifier_type: qualifier_type.to_owned(),
            value_type: VALUE_TYPE_STRING.to_owned(),
            value: Some(value.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceType {
    ModelReference,
    ExternalReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    GlobalReference,
    AssetAdministrationShell,
    Submodel,
    SubmodelElement,
    SubmodelElementCollection,
    SubmodelElementList,
    Operation,
    Property,
    File,
    Blob,
    ConceptDescription,
}

impl KeyType {
    fn as_str(self) -> &'static str {
        match self {
            Self::GlobalReference => "GlobalReference",
            Self::AssetAdministrationShell => "AssetAdministrationShell",
            Self::Submodel => "Submodel",
            Self::SubmodelElement => "SubmodelElement",
            Self::SubmodelElementCollection => "SubmodelElementCollection",
            Self::SubmodelElementList => "SubmodelElementList",
            Self::Operation => "Operation",
            Self::Property => "Property",
            Self::File => "File",
            Self::Blob => "Blob",
            Self::ConceptDescription => "ConceptDescription",
        }
    }
}

impl FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GlobalReference" => Self::GlobalReference,
            "AssetAdministrationShell" => Self::AssetAdministrationShell,
            "Submodel" => Self::Submodel,
            "SubmodelElement" => Self::SubmodelElement,
            "SubmodelElementCollection" => Self::SubmodelElementCollection,
            "SubmodelElementList" => Self::SubmodelElementList,
            "Operation" => Self::Operation,
            "Property" => Self::Property,
            "File" => Self::File,
            "Blob" => Self::Blob,
            "ConceptDescription" => Self::ConceptDescription,
            other => return Err(format!("unknown key type '{other}'")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub value: String,
}

impl Key {
    #[must_use]
    pub fn new(key_type: KeyType, value: impl Into<String>) -> Self {
        Self {
            key_type,
            value: value.into(),
        }
    }
}

/// Reference to a model element or an external concept.
///
/// The string form is `(Submodel)http://example.com/sm, (Property)temperature`.
/// Deserialization accepts both the string form and the JSON object form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Reference {
    #[serde(rename = "type")]
    pub reference_type: ReferenceType,
    pub keys: Vec<Key>,
}

impl Reference {
    #[must_use]
    pub fn model(keys: Vec<Key>) -> Self {
        Self {
            reference_type: ReferenceType::ModelReference,
            keys,
        }
    }

    #[must_use]
    pub fn external(value: &str) -> Self {
        Self {
            reference_type: ReferenceType::ExternalReference,
            keys: vec![Key::new(KeyType::GlobalReference, value)],
        }
    }

    #[must_use]
    pub fn child(&self, key_type: KeyType, value: impl Into<String>) -> Self {
        let mut keys = self.keys.clone();
        keys.push(Key::new(key_type, value));
        Self::model(keys)
    }

    /// Value of the first key of the given type.
    #[must_use]
    pub fn key_value(&self, key_type: KeyType) -> Option<&str> {
        self.keys
            .iter()
            .find(|k| k.key_type == key_type)
            .map(|k| k.value.as_str())
    }

    /// Dot-separated idShort path of the submodel elements below the submodel key.
    #[must_use]
    pub fn id_short_path(&self) -> String {
        self.keys
            .iter()
            .skip_while(|k| k.key_type != KeyType::Submodel)
            .skip(1)
            .map(|k| k.value.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .keys
            .iter()
            .map(|k| format!("({}){}", k.key_type.as_str(), k.value))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

impl FromStr for Reference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut keys = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let rest = part
                .strip_prefix('(')
                .ok_or_else(|| format!("malformed reference key '{part}'"))?;
            let (key_type, value) = rest
                .split_once(')')
                .ok_or_else(|| format!("malformed reference key '{part}'"))?;
            keys.push(Key::new(key_type.parse()?, value.trim()));
        }
        if keys.is_empty() {
            return Err("empty reference".to_owned());
        }
        let reference_type = if keys[0].key_type == KeyType::GlobalReference {
            ReferenceType::ExternalReference
        } else {
            ReferenceType::ModelReference
        };
        Ok(Self {
            reference_type,
            keys,
        })
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Structured {
            #[serde(rename = "type")]
            reference_type: ReferenceType,
            keys: Vec<Key>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Structured(Structured),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Structured(s) => Ok(Self {
                reference_type: s.reference_type,
                keys: s.keys,
            }),
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;

    use super::{Deserialize, Deserializer, STANDARD, Serializer};

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
