//! Loads a YAML config file into a validated [`MirrorConfig`].
//!
//! Every section and field is optional; anything left out keeps its default. Credentials never
//! live in this file: the object-store client is configured by the caller.

use std::fs;
use std::path::Path;

use tracing::{error, info};

use crate::config::MirrorConfig;
use crate::error::Result;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<MirrorConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        e
    })?;

    let config = parse_config(&content)?;
    info!(config_path = ?path_ref, "Parsed config YAML successfully");
    Ok(config)
}

/// Parse and validate YAML text.
pub fn parse_config(content: &str) -> Result<MirrorConfig> {
    // serde_yaml rejects an empty document, which should mean "all defaults".
    let config: MirrorConfig = if content.trim().is_empty() {
        MirrorConfig::default()
    } else {
        serde_yaml::from_str(content).map_err(|e| {
            error!(error = ?e, "Failed to parse config YAML");
            e
        })?
    };
    config.validate()?;
    config.trace_loaded();
    Ok(config)
}
