// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::PathBuf;

use super::types::{ResolvedConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub comm_root: Option<PathBuf>,
    pub pod_root: Option<PathBuf>,
    pub universe: Option<String>,
    pub orchestrator_id: Option<String>,
    pub strict_tree_load: Option<bool>,
}

/// Default configuration values.
pub fn default_config() -> ResolvedConfig {
    ResolvedConfig::default()
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.swarmer.local.json)
/// 3. Workspace config (.swarmer.json)
/// 4. Global config (~/.swarmer/config.json)
/// 5. Default values
pub fn merge_config(
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = default_config();

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, &config);
    }

    apply_cli_options(&mut result, &cli);

    result
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: &WorkspaceConfig) {
    if let Some(ref comm_root) = config.comm_root {
        result.comm_root = comm_root.clone();
    }

    if let Some(ref pod_root) = config.pod_root {
        result.pod_root = pod_root.clone();
    }

    if let Some(ref universe) = config.universe {
        result.universe = universe.clone();
    }

    if let Some(ref orchestrator_id) = config.orchestrator_id {
        result.orchestrator_id = orchestrator_id.clone();
    }

    if let Some(format) = config.snapshot_format {
        result.snapshot_format = format;
    }

    if let Some(secs) = config.heartbeat_interval_secs {
        result.heartbeat_interval_secs = secs;
    }

    if let Some(secs) = config.beacon_timeout_secs {
        result.beacon_timeout_secs = secs;
    }

    if let Some(secs) = config.reconcile_interval_secs {
        result.reconcile_interval_secs = secs;
    }

    if let Some(secs) = config.reconcile_timeout_secs {
        result.reconcile_timeout_secs = secs;
    }

    if let Some(millis) = config.bus_poll_millis {
        result.bus_poll_millis = millis;
    }

    if let Some(secs) = config.reaper_timeout_secs {
        result.reaper_timeout_secs = secs;
    }

    if let Some(millis) = config.reaper_poll_millis {
        result.reaper_poll_millis = millis;
    }

    if let Some(secs) = config.sigterm_grace_secs {
        result.sigterm_grace_secs = secs;
    }

    if let Some(ref throttle) = config.throttle {
        if let Some(min) = throttle.min_delay_millis {
            result.throttle.min_delay_millis = min;
        }
        if let Some(max) = throttle.max_delay_millis {
            result.throttle.max_delay_millis = max;
        }
    }

    if let Some(strict) = config.strict_tree_load {
        result.strict_tree_load = strict;
    }

    if let Some(watch) = config.watch_inboxes {
        result.watch_inboxes = watch;
    }

    if let Some(ref workers) = config.workers {
        // Merge worker tables; later sources replace same-named types
        result.workers.extend(workers.clone());
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    if let Some(ref comm_root) = cli.comm_root {
        result.comm_root = comm_root.clone();
    }

    if let Some(ref pod_root) = cli.pod_root {
        result.pod_root = pod_root.clone();
    }

    if let Some(ref universe) = cli.universe {
        result.universe = universe.clone();
    }

    if let Some(ref orchestrator_id) = cli.orchestrator_id {
        result.orchestrator_id = orchestrator_id.clone();
    }

    if let Some(strict) = cli.strict_tree_load {
        result.strict_tree_load = strict;
    }
}
