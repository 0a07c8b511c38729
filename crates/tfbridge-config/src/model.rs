//! Runtime configuration model

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Process scheduling policy for native providers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Every invocation launches its own provider
    #[default]
    None,
    /// One process per provider configuration, reused across resources
    Shared,
    /// One process per workspace
    Workspace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    /// Borrows a shared process serves before it is replaced
    pub ttl: u64,
    /// Fraction of `ttl` a borrowed process may overshoot
    pub ttl_margin: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::None,
            ttl: 100,
            ttl_margin: 0.1,
        }
    }
}

fn default_protocol_version() -> u32 {
    5
}

fn default_reattach_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeProviderSettings {
    /// Provider plugin executable
    pub path: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Source address, e.g. `registry.terraform.io/hashicorp/aws`
    pub name: String,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,

    #[serde(default = "default_reattach_timeout_secs")]
    pub reattach_timeout_secs: u64,
}

impl NativeProviderSettings {
    pub fn reattach_timeout(&self) -> Duration {
        Duration::from_secs(self.reattach_timeout_secs)
    }
}

/// Settings of a tfbridge run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub terraform_path: String,
    pub workspace_root: PathBuf,
    pub async_timeout_secs: u64,
    pub native_provider: Option<NativeProviderSettings>,
    pub scheduler: SchedulerConfig,
    /// Extra environment for every tool invocation
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            terraform_path: "terraform".to_string(),
            workspace_root: std::env::temp_dir().join("tfbridge"),
            async_timeout_secs: 3600,
            native_provider: None,
            scheduler: SchedulerConfig::default(),
            env: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn async_timeout(&self) -> Duration {
        Duration::from_secs(self.async_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.terraform_path.trim().is_empty() {
            return Err(ConfigError::Invalid("terraform_path is empty".to_string()));
        }
        if self.async_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "async_timeout_secs must be positive".to_string(),
            ));
        }
        if self.scheduler.ttl == 0 {
            return Err(ConfigError::Invalid("scheduler.ttl must be positive".to_string()));
        }
        if self.scheduler.ttl_margin.is_nan() || self.scheduler.ttl_margin < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "scheduler.ttl_margin must not be negative: {}",
                self.scheduler.ttl_margin
            )));
        }
        if self.scheduler.kind != SchedulerKind::None && self.native_provider.is_none() {
            return Err(ConfigError::Invalid(format!(
                "scheduler kind {:?} requires native_provider",
                self.scheduler.kind
            )));
        }
        Ok(())
    }
}
