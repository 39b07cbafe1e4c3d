// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration types.
//!
//! Defines the structure of configuration files and the resolved configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::comm::CommLayout;
use crate::tree::{LoadPolicy, SnapshotFormat};

/// Workspace configuration loaded from .swarmer.json or similar files.
/// All fields are optional since configs can be partial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Root of the per-agent comm channels
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comm_root: Option<PathBuf>,

    /// Root of the runtime instance (pod) directories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_root: Option<PathBuf>,

    /// Universe/session id injected into every agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub universe: Option<String>,

    /// Id of the tree root, which owns the canonical snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator_id: Option<String>,

    /// Encoding of agent_tree_master (json or yaml)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_format: Option<SnapshotFormat>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub beacon_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_interval_secs: Option<u64>,

    /// Heartbeat age below which a child counts as alive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus_poll_millis: Option<u64>,

    /// Graceful wait window of the reaper
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaper_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaper_poll_millis: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sigterm_grace_secs: Option<u64>,

    /// Worker cadence band
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleConfigPartial>,

    /// Fail the whole tree load on a malformed node instead of pruning it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict_tree_load: Option<bool>,

    /// Wake inbox pollers on file-change notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_inboxes: Option<bool>,

    /// External agent type implementations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<BTreeMap<String, WorkerProgram>>,
}

/// Partial throttle configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleConfigPartial {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_delay_millis: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_millis: Option<u64>,
}

/// External program implementing an agent type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProgram {
    /// Executable path, or a bare name looked up on PATH
    pub program: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Resolved worker cadence band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleConfig {
    pub min_delay_millis: u64,
    pub max_delay_millis: u64,
}

impl ThrottleConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_millis)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_millis.max(self.min_delay_millis))
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_delay_millis: 1000,
            max_delay_millis: 30_000,
        }
    }
}

/// Resolved configuration with all values set.
/// This is the merged result of global, workspace, local, and CLI configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub comm_root: PathBuf,
    pub pod_root: PathBuf,
    pub universe: String,
    pub orchestrator_id: String,
    pub snapshot_format: SnapshotFormat,
    pub heartbeat_interval_secs: u64,
    pub beacon_timeout_secs: u64,
    pub reconcile_interval_secs: u64,
    pub reconcile_timeout_secs: u64,
    pub bus_poll_millis: u64,
    pub reaper_timeout_secs: u64,
    pub reaper_poll_millis: u64,
    pub sigterm_grace_secs: u64,
    pub throttle: ThrottleConfig,
    pub strict_tree_load: bool,
    /// Interval polling only when false.
    #[serde(default = "default_watch_inboxes")]
    pub watch_inboxes: bool,
    pub workers: BTreeMap<String, WorkerProgram>,
}

fn default_watch_inboxes() -> bool {
    true
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            comm_root: PathBuf::from(".swarmer/comm"),
            pod_root: PathBuf::from(".swarmer/pod"),
            universe: "default".to_string(),
            orchestrator_id: "matrix".to_string(),
            snapshot_format: SnapshotFormat::Json,
            heartbeat_interval_secs: 10,
            beacon_timeout_secs: 30,
            reconcile_interval_secs: 10,
            reconcile_timeout_secs: 60,
            bus_poll_millis: 1000,
            reaper_timeout_secs: 30,
            reaper_poll_millis: 500,
            sigterm_grace_secs: 3,
            throttle: ThrottleConfig::default(),
            strict_tree_load: false,
            watch_inboxes: default_watch_inboxes(),
            workers: BTreeMap::new(),
        }
    }
}

impl ResolvedConfig {
    /// Directory layout described by this configuration.
    pub fn layout(&self) -> CommLayout {
        CommLayout::new(&self.comm_root, &self.pod_root, &self.orchestrator_id)
            .with_snapshot_ext(self.snapshot_format.extension())
    }

    pub fn load_policy(&self) -> LoadPolicy {
        LoadPolicy::from_strict(self.strict_tree_load)
    }

    /// Make relative roots absolute against `base`.
    pub fn anchor_paths(&mut self, base: &Path) {
        if self.comm_root.is_relative() {
            self.comm_root = base.join(&self.comm_root);
        }
        if self.pod_root.is_relative() {
            self.pod_root = base.join(&self.pod_root);
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn beacon_timeout(&self) -> Duration {
        Duration::from_secs(self.beacon_timeout_secs.max(1))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn bus_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bus_poll_millis.max(10))
    }

    pub fn reaper_timeout(&self) -> Duration {
        Duration::from_secs(self.reaper_timeout_secs)
    }

    pub fn reaper_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_poll_millis.max(10))
    }

    pub fn sigterm_grace(&self) -> Duration {
        Duration::from_secs(self.sigterm_grace_secs)
    }
}
