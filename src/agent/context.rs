// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-process agent context.
//!
//! Everything a worker may touch is reached through [`AgentContext`]; there is
//! no process-wide mutable state besides the metrics registry.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::bus::{Channel, Envelope, FsDelivery, PacketDelivery};
use crate::comm::CommLayout;
use crate::config::ResolvedConfig;
use crate::error::BusError;
use crate::reaper::{LinuxProcessTable, ProcessTable, Reaper};
use crate::spawn::BootBundle;
use crate::tree::SnapshotWriter;

/// Name of the log sink inside `<comm>/<id>/logs/`.
pub const AGENT_LOG: &str = "agent.log";

pub struct AgentContext {
    bundle: BootBundle,
    settings: Arc<ResolvedConfig>,
    layout: CommLayout,
    delivery: Arc<FsDelivery>,
    log_path: PathBuf,
    writer: SnapshotWriter,
    processes: Arc<dyn ProcessTable>,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("id", &self.bundle.id)
            .field("instance_id", &self.bundle.instance_id)
            .field("type", &self.bundle.agent_type)
            .finish()
    }
}

impl AgentContext {
    pub fn new(bundle: BootBundle) -> Self {
        let settings = Arc::new(bundle.settings.clone());
        let layout = settings.layout();
        let log_path = layout.logs_dir(&bundle.id).join(AGENT_LOG);
        Self {
            delivery: Arc::new(FsDelivery::new(layout.clone())),
            bundle,
            settings,
            layout,
            log_path,
            writer: SnapshotWriter::new(),
            processes: Arc::new(LinuxProcessTable),
        }
    }

    /// Replace the process table used for identity checks and signalling.
    pub fn with_process_table(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.processes = processes;
        self
    }

    pub fn id(&self) -> &str {
        &self.bundle.id
    }

    pub fn instance_id(&self) -> &str {
        &self.bundle.instance_id
    }

    pub fn agent_type(&self) -> &str {
        &self.bundle.agent_type
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.bundle.parent_id.as_deref()
    }

    pub fn universe(&self) -> &str {
        &self.bundle.universe
    }

    /// Node configuration from the tree.
    pub fn config(&self) -> &Map<String, Value> {
        &self.bundle.config
    }

    pub fn bundle(&self) -> &BootBundle {
        &self.bundle
    }

    pub fn settings(&self) -> &Arc<ResolvedConfig> {
        &self.settings
    }

    pub fn layout(&self) -> &CommLayout {
        &self.layout
    }

    /// Whether this agent owns the canonical snapshot.
    pub fn is_orchestrator(&self) -> bool {
        self.bundle.id == self.settings.orchestrator_id
    }

    pub fn fs_delivery(&self) -> &Arc<FsDelivery> {
        &self.delivery
    }

    pub fn delivery(&self) -> Arc<dyn PacketDelivery> {
        self.delivery.clone()
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Lock shared by every task of this process that rewrites the snapshot.
    pub fn snapshot_writer(&self) -> &SnapshotWriter {
        &self.writer
    }

    pub fn processes(&self) -> &Arc<dyn ProcessTable> {
        &self.processes
    }

    /// Reaper bound to this agent's layout and process table.
    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.layout.clone(), self.processes.clone())
    }

    /// Append a line to the agent's log sink.
    ///
    /// Never fails: a sink that cannot be written is reported through tracing.
    pub fn log(&self, message: &str) {
        info!(agent_id = %self.bundle.id, "{}", message);
        let line = format!(
            "{} [{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            self.bundle.instance_id,
            message
        );
        let result = self
            .log_path
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&self.log_path))
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(path = %self.log_path.display(), error = %e, "Agent log sink not writable");
        }
    }

    pub async fn send_command(&self, target: &str, envelope: Envelope) -> Result<(), BusError> {
        self.delivery.deliver(target, &envelope, Channel::Command).await
    }

    pub async fn send_reflex(&self, target: &str, envelope: Envelope) -> Result<(), BusError> {
        self.delivery.deliver(target, &envelope, Channel::Reflex).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_log_sink_appends() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, "w-1", "redis_watchdog");
        ctx.log("first");
        ctx.log("second");

        let text = std::fs::read_to_string(ctx.log_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[w-1-test] first"));
        assert!(ctx.log_path().starts_with(temp.path().join("comm/w-1/logs")));
    }

    #[tokio::test]
    async fn test_send_reaches_inbox() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, "w-1", "redis_watchdog");
        ctx.send_reflex("matrix", Envelope::new("health", json!({"ok": true})))
            .await
            .unwrap();

        let got = ctx
            .fs_delivery()
            .receive("matrix", Channel::Reflex)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.kind, "health");
    }

    #[test]
    fn test_orchestrator_identity() {
        let temp = TempDir::new().unwrap();
        assert!(context(&temp, "matrix", "orchestrator").is_orchestrator());
        assert!(!context(&temp, "w-1", "redis_watchdog").is_orchestrator());
    }
}
