use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use iso_core::EngineConfig;

use crate::error::{Result, StoreError};

pub const CONFIG_FILE: &str = "iso.toml";

/// Read engine settings from a TOML file. A missing file means defaults;
/// a present but malformed one is an error.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!("no config at {}, using defaults", path.display());
            return Ok(EngineConfig::default());
        }
        Err(e) => {
            return Err(StoreError::Config(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        }
    };
    parse_config(&content)
        .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))
}

pub fn parse_config(content: &str) -> std::result::Result<EngineConfig, toml::de::Error> {
    toml::from_str(content)
}
