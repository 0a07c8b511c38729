pub mod error;
pub mod model;

pub use error::*;
pub use model::*;

use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "TFBRIDGE_CONFIG_PATH";

const CANDIDATES: [&str; 3] = ["tfbridge.local.yaml", "tfbridge.yaml", ".tfbridge.yaml"];

/// Returns the tfbridge directory under the user's config directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("tfbridge");
    Ok(config_dir)
}

/// Looks for a configuration file.
///
/// Search order:
/// 1. `TFBRIDGE_CONFIG_PATH`
/// 2. the current directory: tfbridge.local.yaml, tfbridge.yaml, .tfbridge.yaml
/// 3. `./.tfbridge/` with the same names
/// 4. `<config dir>/tfbridge/config.yaml`
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
        tracing::warn!(path = %path.display(), "{} points to a missing file", CONFIG_PATH_ENV);
    }

    let current_dir = std::env::current_dir()?;
    if let Some(path) = find_in(&current_dir) {
        return Ok(Some(path));
    }

    let local_dir = current_dir.join(".tfbridge");
    if local_dir.is_dir() {
        if let Some(path) = find_in(&local_dir) {
            return Ok(Some(path));
        }
    }

    if let Ok(config_dir) = get_config_dir() {
        let global_config = config_dir.join("config.yaml");
        if global_config.exists() {
            return Ok(Some(global_config));
        }
    }

    Ok(None)
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Reads and validates a configuration file
pub fn load_file(path: &Path) -> Result<RuntimeConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: RuntimeConfig = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    tracing::debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Loads `explicit` when given, otherwise the discovered file, otherwise
/// the defaults
pub fn load(explicit: Option<&Path>) -> Result<RuntimeConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file()?,
    };
    match path {
        Some(path) => load_file(&path),
        None => {
            tracing::debug!("No configuration file found, using defaults");
            Ok(RuntimeConfig::default())
        }
    }
}
