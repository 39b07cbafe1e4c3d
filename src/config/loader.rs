// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Handles loading configuration from JSON and YAML files in various locations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::comm::atomic_write;
use crate::error::ConfigError;

use super::types::{ThrottleConfigPartial, WorkerProgram, WorkspaceConfig};

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[
    ".swarmer.json",
    ".swarmer/config.json",
    "swarmer.config.json",
    ".swarmer.yaml",
];

/// Local config file name (for per-directory overrides).
pub const LOCAL_CONFIG_FILE: &str = ".swarmer.local.json";

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".swarmer";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.swarmer/config.json.
pub fn load_global_config() -> Result<Option<WorkspaceConfig>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Load workspace configuration from the workspace root.
///
/// The first file of [`CONFIG_FILES`] that exists wins.
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = workspace_root.join(filename);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load local configuration from .swarmer.local.json.
pub fn load_local_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    let path = workspace_root.join(LOCAL_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    load_config_file(&path).map(Some)
}

/// Load a configuration file (JSON or YAML).
pub fn load_config_file(path: &Path) -> Result<WorkspaceConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Save workspace configuration to a file.
pub fn save_workspace_config(
    workspace_root: &Path,
    config: &WorkspaceConfig,
    filename: Option<&str>,
) -> Result<PathBuf, ConfigError> {
    let filename = filename.unwrap_or(CONFIG_FILES[0]);
    let path = workspace_root.join(filename);

    let content = serde_json::to_string_pretty(config)?;
    atomic_write(&path, content.as_bytes()).map_err(|e| ConfigError::IoError(e.to_string()))?;

    Ok(path)
}

/// Initialize a new config file with default or provided configuration.
///
/// Refuses to overwrite an existing workspace config.
pub fn init_config(
    workspace_root: &Path,
    config: Option<WorkspaceConfig>,
) -> Result<PathBuf, ConfigError> {
    let existing = workspace_root.join(CONFIG_FILES[0]);
    if existing.exists() {
        return Err(ConfigError::InvalidValue {
            field: "init".to_string(),
            message: format!("{} already exists", existing.display()),
        });
    }
    let config = config.unwrap_or_else(get_example_config);
    save_workspace_config(workspace_root, &config, None)
}

/// Find the workspace root by searching for config files.
///
/// Walks up the directory tree from `start` until it finds a directory
/// containing a config file or reaches the filesystem root.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        for filename in CONFIG_FILES {
            if current.join(filename).exists() {
                return Some(current);
            }
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

/// Get an example configuration.
pub fn get_example_config() -> WorkspaceConfig {
    let mut workers = BTreeMap::new();
    workers.insert(
        "redis_watchdog".to_string(),
        WorkerProgram {
            program: "redis-cli".to_string(),
            args: vec!["ping".to_string()],
        },
    );
    WorkspaceConfig {
        universe: Some("default".to_string()),
        orchestrator_id: Some("matrix".to_string()),
        reconcile_timeout_secs: Some(60),
        throttle: Some(ThrottleConfigPartial {
            min_delay_millis: Some(1000),
            max_delay_millis: Some(30_000),
        }),
        workers: Some(workers),
        ..Default::default()
    }
}
