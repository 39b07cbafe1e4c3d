// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for the swarm.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.swarmer/config.json
//! - Workspace config: .swarmer.json, .swarmer/config.json, swarmer.config.json or .swarmer.yaml
//! - Local config: .swarmer.local.json (gitignored, for personal overrides)
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).
//! Spawned agents do not reload files: they inherit the parent's resolved
//! configuration through their boot bundle.

mod loader;
mod merger;
mod types;

pub use loader::{
    find_workspace_root, get_example_config, get_global_config_dir, get_global_config_path,
    init_config, load_config_file, load_global_config, load_local_config, load_workspace_config,
    save_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE, LOCAL_CONFIG_FILE,
};

pub use merger::{default_config, merge_config, CliOptions};

pub use types::{
    ResolvedConfig, ThrottleConfig, ThrottleConfigPartial, WorkerProgram, WorkspaceConfig,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources for a workspace.
///
/// Relative comm and pod roots are anchored at `workspace_root`.
pub fn load_config(
    workspace_root: &Path,
    cli_options: CliOptions,
) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(workspace_root)?;
    let local = load_local_config(workspace_root)?;

    let mut config = merge_config(global, workspace, local, cli_options);
    config.anchor_paths(workspace_root);
    validate(&config)?;
    Ok(config)
}

/// Reject settings the runtime cannot work with.
pub fn validate(config: &ResolvedConfig) -> Result<(), ConfigError> {
    crate::comm::CommLayout::validate_id(&config.orchestrator_id).map_err(|e| {
        ConfigError::InvalidValue {
            field: "orchestratorId".to_string(),
            message: e.to_string(),
        }
    })?;
    if config.reconcile_timeout_secs < config.heartbeat_interval_secs {
        return Err(ConfigError::InvalidValue {
            field: "reconcileTimeoutSecs".to_string(),
            message: format!(
                "{}s is shorter than the heartbeat interval ({}s); live agents would be respawned",
                config.reconcile_timeout_secs, config.heartbeat_interval_secs
            ),
        });
    }
    for (agent_type, worker) in &config.workers {
        if worker.program.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("workers.{}.program", agent_type),
                message: "must not be empty".to_string(),
            });
        }
    }
    Ok(())
}
