//! Schema files: types, members and calls to run, in TOML.
//!
//! ```toml
//! [[types]]
//! name = "Dog"
//! supertypes = ["Animal"]
//!
//! [[methods]]
//! type = "Animal"
//! name = "speak"
//! returns = "..."
//!
//! [[calls]]
//! receiver = "Dog"
//! member = "speak"
//! ```
//!
//! Every member returns a constant. Hook results may use `{name}` for the
//! missing member's name.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid schema: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown type `{0}`")]
    UnknownType(String),

    #[error("unsupported value in schema: {0}")]
    UnsupportedValue(String),

    #[error("unknown hook kind `{0}` (expected method_missing or property_missing)")]
    UnknownHook(String),

    #[error(transparent)]
    Registry(#[from] mop_runtime::RegistryError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Schema {
    pub types: Vec<TypeDecl>,
    pub methods: Vec<MethodDecl>,
    pub properties: Vec<PropertyDecl>,
    pub hooks: Vec<HookDecl>,
    pub mixins: Vec<MixinDecl>,
    pub calls: Vec<CallDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDecl {
    pub name: String,
    #[serde(default)]
    pub supertypes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDecl {
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub returns: toml::Value,
    /// Add as a dynamic method (shadowing) rather than a native one.
    #[serde(default)]
    pub dynamic: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDecl {
    #[serde(rename = "type")]
    pub type_name: String,
    pub name: String,
    pub value: toml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookDecl {
    #[serde(rename = "type")]
    pub type_name: String,
    pub kind: String,
    pub returns: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixinDecl {
    pub target: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDecl {
    /// Type name of a fresh receiver object.
    pub receiver: String,
    pub member: String,
    #[serde(default)]
    pub args: Vec<toml::Value>,
    #[serde(default)]
    pub property: bool,
}

impl Schema {
    pub fn from_toml_str(source: &str) -> Result<Self, SchemaError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}
