//! Persisted state model
//!
//! Reads and writes the `terraform.tfstate` document (format version 4) kept in
//! a resource's working directory. A working directory manages a single
//! resource, so a valid document holds at most one resource with exactly one
//! instance.

use crate::error::{CoreError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const STATE_VERSION: u64 = 4;
pub const STATE_FILE: &str = "terraform.tfstate";

/// Persisted state document, format version 4
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateV4 {
    pub version: u64,

    #[serde(default)]
    pub terraform_version: String,

    #[serde(default)]
    pub serial: u64,

    #[serde(default)]
    pub lineage: String,

    #[serde(default)]
    pub outputs: BTreeMap<String, OutputStateV4>,

    #[serde(default)]
    pub resources: Vec<ResourceStateV4>,
}

/// Root module output value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputStateV4 {
    pub value: serde_json::Value,

    #[serde(rename = "type")]
    pub value_type: serde_json::Value,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
}

/// A managed resource and its instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStateV4 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    pub mode: String,

    #[serde(rename = "type")]
    pub resource_type: String,

    pub name: String,

    #[serde(rename = "each", default, skip_serializing_if = "Option::is_none")]
    pub each_mode: Option<String>,

    #[serde(rename = "provider")]
    pub provider_config: String,

    #[serde(default)]
    pub instances: Vec<InstanceObjectStateV4>,
}

/// A single resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceObjectStateV4 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_key: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,

    #[serde(default)]
    pub schema_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes_flat: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitive_attributes: Option<serde_json::Value>,

    /// Base64-encoded provider private metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub create_before_destroy: bool,
}

impl StateV4 {
    /// Builds a state seeded with a single resource instance
    pub fn for_instance(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        provider_config: impl Into<String>,
        lineage: impl Into<String>,
        attributes: serde_json::Value,
        private: Option<&[u8]>,
    ) -> Self {
        Self {
            version: STATE_VERSION,
            terraform_version: String::new(),
            serial: 1,
            lineage: lineage.into(),
            outputs: BTreeMap::new(),
            resources: vec![ResourceStateV4 {
                module: None,
                mode: "managed".to_string(),
                resource_type: resource_type.into(),
                name: name.into(),
                each_mode: None,
                provider_config: provider_config.into(),
                instances: vec![InstanceObjectStateV4 {
                    index_key: None,
                    status: None,
                    deposed: None,
                    schema_version: 0,
                    attributes: Some(attributes),
                    attributes_flat: None,
                    sensitive_attributes: None,
                    private: private.map(|p| STANDARD.encode(p)),
                    dependencies: Vec::new(),
                    create_before_destroy: false,
                }],
            }],
        }
    }

    /// Parses and validates a state document
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let state: StateV4 = serde_json::from_slice(raw)?;
        state.validate()?;
        Ok(state)
    }

    fn validate(&self) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(CoreError::UnsupportedStateVersion {
                found: self.version,
                expected: STATE_VERSION,
            });
        }
        if self.resources.len() > 1 {
            return Err(CoreError::TooManyResources(self.resources.len()));
        }
        if let Some(resource) = self.resources.first() {
            if resource.instances.len() != 1 {
                return Err(CoreError::InstanceCount {
                    resource: format!("{}.{}", resource.resource_type, resource.name),
                    found: resource.instances.len(),
                });
            }
        }
        Ok(())
    }

    /// The only instance in the document, if any
    pub fn instance(&self) -> Option<&InstanceObjectStateV4> {
        self.resources.first()?.instances.first()
    }

    pub fn attributes(&self) -> Option<&serde_json::Value> {
        self.instance()?.attributes.as_ref()
    }

    pub fn sensitive_attributes(&self) -> Option<&serde_json::Value> {
        self.instance()?.sensitive_attributes.as_ref()
    }

    /// Private metadata exactly as stored (base64)
    pub fn private_raw(&self) -> Option<&str> {
        self.instance()?.private.as_deref()
    }

    /// Decoded private metadata
    pub fn private(&self) -> Result<Option<Vec<u8>>> {
        self.private_raw()
            .map(|p| {
                STANDARD
                    .decode(p)
                    .map_err(|e| CoreError::InvalidPrivate(e.to_string()))
            })
            .transpose()
    }

    /// The external identifier recorded in the `id` attribute
    pub fn id(&self) -> Option<&str> {
        self.attributes()?.get("id")?.as_str()
    }

    /// Whether the document describes an existing resource
    pub fn exists(&self) -> bool {
        self.attributes().is_some_and(|a| !a.is_null())
    }
}

/// Reads and writes the state file of one working directory
pub struct StateFile {
    dir: PathBuf,
}

impl StateFile {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(self.path()).await.unwrap_or(false)
    }

    /// Loads the state; a missing file is an error
    pub async fn load(&self) -> Result<StateV4> {
        let path = self.path();
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::StateNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let state = StateV4::parse(&raw)?;
        tracing::debug!(
            path = %path.display(),
            resources = state.resources.len(),
            "Loaded state"
        );
        Ok(state)
    }

    pub async fn save(&self, state: &StateV4) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)?;
        fs::write(self.path(), content).await?;
        tracing::debug!(path = %self.path().display(), "Saved state");
        Ok(())
    }

    /// Writes raw bytes as the state file
    pub async fn write_raw(&self, raw: &[u8]) -> Result<()> {
        fs::write(self.path(), raw).await?;
        Ok(())
    }
}
