// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Spawn controller.
//!
//! Every supervising agent runs one controller. Each tick it reads its slice
//! of the canonical snapshot (reparsed only when the file changed) and makes
//! sure each direct child is materialised.
//!
//! A child is skipped when any of these hold:
//!
//! - it is `killed` or locked by a termination in progress
//! - a die marker or tombstone is present in its inbox
//! - its freshest alive beacon is younger than the reconcile timeout
//! - its latest spawn receipt is younger than the reconcile timeout
//!
//! The last rule makes back-to-back ticks idempotent while a fresh instance
//! has not written its first beacon yet.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::comm::CommLayout;
use crate::error::TreeError;
use crate::heartbeat::{HeartbeatMonitor, Liveness};
use crate::spawn::{latest_receipt, Spawn, SpawnRequest};
use crate::tree::{LoadPolicy, SnapshotCache, SnapshotWriter};

/// Why a child was not spawned on a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Killed,
    Locked,
    DieMarker,
    Tombstone,
    Heartbeat(Duration),
    RecentSpawn(Duration),
}

/// Outcome of one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub spawned: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    pub failed: Vec<(String, String)>,
    /// Ids whose first liveness was recorded in the snapshot on this tick.
    pub confirmed: Vec<String>,
}

pub struct SpawnController {
    supervisor_id: String,
    layout: CommLayout,
    cache: SnapshotCache,
    spawner: Arc<dyn Spawn>,
    monitor: HeartbeatMonitor,
    reconcile_timeout: Duration,
    interval: Duration,
    confirm_liveness: bool,
    writer: SnapshotWriter,
}

impl SpawnController {
    pub fn new(
        supervisor_id: impl Into<String>,
        layout: CommLayout,
        spawner: Arc<dyn Spawn>,
        policy: LoadPolicy,
    ) -> Self {
        let cache = SnapshotCache::new(layout.snapshot_path(), policy);
        Self {
            supervisor_id: supervisor_id.into(),
            monitor: HeartbeatMonitor::new(layout.clone()),
            layout,
            cache,
            spawner,
            reconcile_timeout: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            confirm_liveness: false,
            writer: SnapshotWriter::new(),
        }
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Record `confirmed_at` for agents seen alive. Only the snapshot owner
    /// should enable this.
    pub fn with_liveness_confirmation(mut self, enabled: bool) -> Self {
        self.confirm_liveness = enabled;
        self
    }

    /// Share the snapshot write lock with other tasks of this process.
    pub fn with_writer(mut self, writer: SnapshotWriter) -> Self {
        self.writer = writer;
        self
    }

    fn skip_reason(&self, id: &str, now: DateTime<Utc>) -> Option<SkipReason> {
        if self.layout.has_tombstone(id) {
            return Some(SkipReason::Tombstone);
        }
        if self.layout.has_die_marker(id) {
            return Some(SkipReason::DieMarker);
        }
        if let Some(age) = self.monitor.freshest_age(id, now) {
            if age < self.reconcile_timeout {
                return Some(SkipReason::Heartbeat(age));
            }
        }
        if let Some(receipt) = latest_receipt(&self.layout, id) {
            let age = (now - receipt.spawned_at).to_std().unwrap_or(Duration::ZERO);
            if age < self.reconcile_timeout {
                return Some(SkipReason::RecentSpawn(age));
            }
        }
        None
    }

    /// Run one reconciliation pass over the direct children.
    ///
    /// A missing snapshot or a supervisor absent from it is an empty pass.
    #[instrument(skip(self), fields(supervisor = %self.supervisor_id))]
    pub async fn reconcile_once(&mut self) -> Result<ReconcileReport, TreeError> {
        let _timer = crate::timed!("reconcile");
        let mut report = ReconcileReport::default();
        let now = Utc::now();

        let children = match self.cache.current()? {
            Some(tree) => tree
                .child_records(&self.supervisor_id)
                .into_iter()
                .cloned()
                .collect::<Vec<_>>(),
            None => {
                debug!("No snapshot yet");
                return Ok(report);
            }
        };

        for child in children {
            if child.killed {
                report.skipped.push((child.id, SkipReason::Killed));
                continue;
            }
            if child.operation_in_progress {
                report.skipped.push((child.id, SkipReason::Locked));
                continue;
            }
            if let Some(reason) = self.skip_reason(&child.id, now) {
                debug!(agent_id = %child.id, reason = ?reason, "Child skipped");
                report.skipped.push((child.id, reason));
                continue;
            }

            let request = SpawnRequest::from_record(&child, Some(&self.supervisor_id));
            match self.spawner.spawn(request).await {
                Ok(instance) => {
                    info!(agent_id = %child.id, instance_id = %instance.instance_id, "Child materialised");
                    report.spawned.push(child.id);
                }
                Err(e) if e.is_skip() => {
                    debug!(agent_id = %child.id, reason = %e, "Spawner skipped child");
                }
                Err(e) => {
                    error!(agent_id = %child.id, error = %e, "Failed to spawn child");
                    report.failed.push((child.id, e.to_string()));
                }
            }
        }

        if self.confirm_liveness {
            report.confirmed = self.confirm_alive(now)?;
        }

        Ok(report)
    }

    fn confirm_alive(&mut self, now: DateTime<Utc>) -> Result<Vec<String>, TreeError> {
        let writer = self.writer.clone();
        let _guard = writer.lock();
        let Some(tree) = self.cache.current()? else {
            return Ok(Vec::new());
        };
        let pending: Vec<String> = tree
            .flatten()
            .into_iter()
            .filter(|r| r.confirmed_at.is_none())
            .map(|r| r.id.clone())
            .filter(|id| self.monitor.liveness(id, now).liveness == Some(Liveness::Alive))
            .collect();
        if pending.is_empty() {
            return Ok(pending);
        }

        let mut updated = tree.clone();
        for id in &pending {
            updated.mark_confirmed(id, now);
        }
        self.cache.store(updated)?;
        info!(count = pending.len(), "Confirmed agent liveness");
        Ok(pending)
    }

    /// Reconcile on every interval until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(report) if !report.spawned.is_empty() || !report.failed.is_empty() => {
                            info!(
                                spawned = report.spawned.len(),
                                failed = report.failed.len(),
                                "Reconciliation tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(supervisor = %self.supervisor_id, error = %e, "Reconciliation failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpawnError;
    use crate::heartbeat::HeartbeatEmitter;
    use crate::spawn::{write_receipt, RuntimeInstance, SpawnReceipt};
    use crate::tree::{AgentNode, SupervisionTree};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records calls and writes a receipt the way the real spawner does.
    struct RecordingSpawner {
        layout: CommLayout,
        calls: Mutex<Vec<String>>,
        fail: Option<&'static str>,
    }

    #[async_trait]
    impl Spawn for RecordingSpawner {
        async fn spawn(&self, request: SpawnRequest) -> Result<RuntimeInstance, SpawnError> {
            self.calls.lock().unwrap().push(request.id.clone());
            if self.fail == Some(request.id.as_str()) {
                return Err(SpawnError::UnknownAgentType(request.agent_type));
            }
            let instance_id = format!("{}-test", request.id);
            let receipt = SpawnReceipt {
                id: request.id.clone(),
                instance_id: instance_id.clone(),
                pid: 1,
                launch_command: vec![instance_id.clone()],
                spawned_at: Utc::now(),
                parent_id: request.parent_id.clone(),
            };
            write_receipt(&self.layout, &receipt).unwrap();
            Ok(RuntimeInstance {
                instance_id,
                logical_id: request.id,
                pid: 1,
                launch_command: receipt.launch_command,
                boot_time: receipt.spawned_at,
                pod_dir: self.layout.pod_root().to_path_buf(),
            })
        }
    }

    fn setup(fail: Option<&'static str>) -> (TempDir, CommLayout, Arc<RecordingSpawner>, SpawnController) {
        let temp = TempDir::new().unwrap();
        let layout = CommLayout::new(temp.path().join("comm"), temp.path().join("pod"), "matrix");
        let tree = SupervisionTree::from_node(
            AgentNode::new("matrix", "orchestrator")
                .with_child(AgentNode::new("a", "worker"))
                .with_child(AgentNode::new("b", "worker"))
                .with_child(AgentNode::new("c", "worker")),
        )
        .unwrap();
        tree.save(&layout.snapshot_path()).unwrap();

        let spawner = Arc::new(RecordingSpawner {
            layout: layout.clone(),
            calls: Mutex::new(Vec::new()),
            fail,
        });
        let controller =
            SpawnController::new("matrix", layout.clone(), spawner.clone(), LoadPolicy::Lenient);
        (temp, layout, spawner, controller)
    }

    #[tokio::test]
    async fn test_reconcile_spawns_each_child_once() {
        let (_temp, _layout, spawner, mut controller) = setup(None);

        let first = controller.reconcile_once().await.unwrap();
        assert_eq!(first.spawned, vec!["a", "b", "c"]);

        let second = controller.reconcile_once().await.unwrap();
        assert!(second.spawned.is_empty());
        assert!(second
            .skipped
            .iter()
            .all(|(_, r)| matches!(r, SkipReason::RecentSpawn(_))));
        assert_eq!(spawner.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_die_marker_and_heartbeat_skip() {
        let (_temp, layout, spawner, mut controller) = setup(None);
        layout.write_die_marker("a", "kill").unwrap();
        HeartbeatEmitter::new(layout.clone(), "b").beat().unwrap();

        let report = controller.reconcile_once().await.unwrap();
        assert_eq!(report.spawned, vec!["c"]);
        assert!(report.skipped.contains(&("a".to_string(), SkipReason::DieMarker)));
        assert!(report
            .skipped
            .iter()
            .any(|(id, r)| id == "b" && matches!(r, SkipReason::Heartbeat(_))));
        assert_eq!(*spawner.calls.lock().unwrap(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_does_not_halt_siblings() {
        let (_temp, _layout, _spawner, mut controller) = setup(Some("a"));
        let report = controller.reconcile_once().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.spawned, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_killed_and_locked_children_skipped() {
        let (_temp, layout, spawner, mut controller) = setup(None);
        let mut tree = SupervisionTree::load_file(&layout.snapshot_path(), LoadPolicy::Lenient)
            .unwrap()
            .0;
        let lock = tree.lock_for_termination("a", false).unwrap();
        let _ = tree.confirm_termination(lock);
        let _lock_b = tree.lock_for_termination("b", false).unwrap();
        tree.save(&layout.snapshot_path()).unwrap();

        let report = controller.reconcile_once().await.unwrap();
        assert_eq!(report.spawned, vec!["c"]);
        assert!(report.skipped.contains(&("a".to_string(), SkipReason::Killed)));
        assert!(report.skipped.contains(&("b".to_string(), SkipReason::Locked)));
        assert_eq!(spawner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty_pass() {
        let temp = TempDir::new().unwrap();
        let layout = CommLayout::new(temp.path().join("comm"), temp.path().join("pod"), "matrix");
        let spawner = Arc::new(RecordingSpawner {
            layout: layout.clone(),
            calls: Mutex::new(Vec::new()),
            fail: None,
        });
        let mut controller = SpawnController::new("matrix", layout, spawner, LoadPolicy::Lenient);
        assert_eq!(controller.reconcile_once().await.unwrap(), ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_liveness_confirmation_persists() {
        let (_temp, layout, _spawner, controller) = setup(None);
        let mut controller = controller.with_liveness_confirmation(true);
        HeartbeatEmitter::new(layout.clone(), "a").beat().unwrap();

        let report = controller.reconcile_once().await.unwrap();
        assert_eq!(report.confirmed, vec!["a"]);

        let (tree, _) = SupervisionTree::load_file(&layout.snapshot_path(), LoadPolicy::Strict).unwrap();
        assert!(tree.get("a").unwrap().confirmed_at.is_some());
        assert!(tree.get("b").unwrap().confirmed_at.is_none());

        let again = controller.reconcile_once().await.unwrap();
        assert!(again.confirmed.is_empty());
    }
}
