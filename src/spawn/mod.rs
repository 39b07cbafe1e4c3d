// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Runtime instance spawning.
//!
//! Each launch gets a fresh instance id and pod directory. The launcher
//! binary is linked into the pod under the logical id, so the argv recorded
//! in the boot record and spawn receipt is unique to that instance and can
//! later be matched against `/proc/<pid>/cmdline`.
//!
//! Configuration travels in the [`BOOT_ENV`] environment variable, never on
//! the command line.

mod bundle;
mod filesystem;
mod records;
mod resolver;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::comm::CommLayout;
use crate::config::ResolvedConfig;
use crate::error::SpawnError;
use crate::heartbeat::HeartbeatMonitor;
use crate::telemetry::{metrics, Counter};
use crate::tree::{AgentRecord, FilesystemSpec};

pub use bundle::{BootBundle, BOOT_ENV};
pub use filesystem::materialize_filesystem;
pub use records::{
    boot_records_for, latest_receipt, list_receipts, read_boot_record, read_boot_records,
    write_boot_record, write_receipt, BootRecord, SpawnReceipt,
};
pub use resolver::{locate_program, ResolvedWorker, WorkerResolver};

/// Everything needed to materialise one logical agent.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRequest {
    pub id: String,
    pub agent_type: String,
    pub config: Map<String, Value>,
    pub filesystem: FilesystemSpec,
    pub parent_id: Option<String>,
}

impl SpawnRequest {
    pub fn from_record(record: &AgentRecord, parent_id: Option<&str>) -> Self {
        Self {
            id: record.id.clone(),
            agent_type: record.agent_type.clone(),
            config: record.config.clone(),
            filesystem: record.filesystem.clone(),
            parent_id: parent_id.map(String::from),
        }
    }
}

/// One live process incarnation of a logical agent.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeInstance {
    pub instance_id: String,
    pub logical_id: String,
    pub pid: u32,
    pub launch_command: Vec<String>,
    pub boot_time: DateTime<Utc>,
    pub pod_dir: PathBuf,
}

/// Materialises logical agents as OS processes.
#[async_trait]
pub trait Spawn: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<RuntimeInstance, SpawnError>;
}

/// Program and leading arguments every instance is launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Launcher {
    /// The running executable in `agent` mode.
    pub fn current_exe() -> Result<Self, SpawnError> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["agent".to_string()],
        })
    }
}

/// Spawner that launches detached processes on the local host.
pub struct RuntimeSpawner {
    layout: CommLayout,
    settings: Arc<ResolvedConfig>,
    resolver: WorkerResolver,
    monitor: HeartbeatMonitor,
    launcher: Launcher,
    alive_window: Duration,
}

impl RuntimeSpawner {
    pub fn new(
        settings: Arc<ResolvedConfig>,
        resolver: WorkerResolver,
        launcher: Launcher,
    ) -> Self {
        let layout = settings.layout();
        Self {
            monitor: HeartbeatMonitor::new(layout.clone()),
            alive_window: settings.reconcile_timeout(),
            layout,
            settings,
            resolver,
            launcher,
        }
    }

    pub fn layout(&self) -> &CommLayout {
        &self.layout
    }

    fn check_preconditions(&self, id: &str) -> Result<(), SpawnError> {
        CommLayout::validate_id(id)?;
        if self.layout.has_tombstone(id) {
            return Err(SpawnError::Tombstoned(id.to_string()));
        }
        if self.layout.has_die_marker(id) {
            return Err(SpawnError::DieMarkerPresent(id.to_string()));
        }
        if self
            .monitor
            .is_recently_alive(id, self.alive_window, Utc::now())
        {
            return Err(SpawnError::AlreadyAlive(id.to_string()));
        }
        Ok(())
    }

    async fn launch(&self, request: &SpawnRequest) -> Result<RuntimeInstance, SpawnError> {
        let id = request.id.as_str();
        self.resolver.resolve(&request.agent_type)?;

        let channel = self.layout.ensure_channel(id)?;
        materialize_filesystem(&channel, &request.filesystem)?;

        let instance_id = new_instance_id(id);
        let pod_dir = self.layout.ensure_pod(&instance_id)?;
        let entry = pod_dir.join(id);
        link_launcher(&self.launcher.program, &entry)?;

        let mut launch_command = vec![entry.display().to_string()];
        launch_command.extend(self.launcher.args.iter().cloned());

        let bundle = BootBundle {
            id: id.to_string(),
            instance_id: instance_id.clone(),
            agent_type: request.agent_type.clone(),
            parent_id: request.parent_id.clone(),
            universe: self.settings.universe.clone(),
            config: request.config.clone(),
            settings: (*self.settings).clone(),
        };
        let env = bundle
            .to_env_value()
            .map_err(|e| SpawnError::LaunchFailed(e.to_string()))?;

        let log_path = self.layout.logs_dir(id).join("stderr.log");
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut command = Command::new(&entry);
        command
            .args(&self.launcher.args)
            .current_dir(&pod_dir)
            .env(BOOT_ENV, env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| SpawnError::LaunchFailed(format!("{}: {}", entry.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| SpawnError::LaunchFailed(format!("{} exited immediately", id)))?;
        // Dropping the handle leaves the process running detached.
        drop(child);

        let boot_time = Utc::now();
        write_boot_record(
            &self.layout,
            &BootRecord {
                id: id.to_string(),
                instance_id: instance_id.clone(),
                agent_type: request.agent_type.clone(),
                pid,
                launch_command: launch_command.clone(),
                boot_time,
            },
        )?;
        write_receipt(
            &self.layout,
            &SpawnReceipt {
                id: id.to_string(),
                instance_id: instance_id.clone(),
                pid,
                launch_command: launch_command.clone(),
                spawned_at: boot_time,
                parent_id: request.parent_id.clone(),
            },
        )?;

        Ok(RuntimeInstance {
            instance_id,
            logical_id: id.to_string(),
            pid,
            launch_command,
            boot_time,
            pod_dir,
        })
    }
}

#[async_trait]
impl Spawn for RuntimeSpawner {
    #[instrument(skip(self, request), fields(agent_id = %request.id, agent_type = %request.agent_type))]
    async fn spawn(&self, request: SpawnRequest) -> Result<RuntimeInstance, SpawnError> {
        if let Err(e) = self.check_preconditions(&request.id) {
            if e.is_skip() {
                metrics::incr(Counter::SpawnsSkipped);
            }
            return Err(e);
        }

        match self.launch(&request).await {
            Ok(instance) => {
                metrics::incr(Counter::Spawns);
                info!(
                    instance_id = %instance.instance_id,
                    pid = instance.pid,
                    "Spawned runtime instance"
                );
                Ok(instance)
            }
            Err(e) => {
                metrics::incr(Counter::SpawnFailures);
                warn!(error = %e, "Spawn failed");
                Err(e)
            }
        }
    }
}

/// `<id>-<12 hex>`
pub fn new_instance_id(id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", id, &suffix[..12])
}

fn link_launcher(program: &Path, entry: &Path) -> Result<(), SpawnError> {
    if !program.is_file() {
        return Err(SpawnError::ImplementationMissing(program.display().to_string()));
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(program, entry)?;
    #[cfg(not(unix))]
    std::fs::copy(program, entry).map(|_| ())?;
    Ok(())
}

/// Register the current process as a runtime instance of `id`.
///
/// Used by agents started directly from the command line, which have no
/// parent spawner to write their boot record.
pub fn register_self(
    layout: &CommLayout,
    id: &str,
    agent_type: &str,
) -> Result<BootRecord, SpawnError> {
    layout.ensure_channel(id)?;
    let instance_id = new_instance_id(id);
    layout.ensure_pod(&instance_id)?;
    let record = BootRecord {
        id: id.to_string(),
        instance_id,
        agent_type: agent_type.to_string(),
        pid: std::process::id(),
        launch_command: std::env::args().collect(),
        boot_time: Utc::now(),
    };
    write_boot_record(layout, &record)?;
    Ok(record)
}
