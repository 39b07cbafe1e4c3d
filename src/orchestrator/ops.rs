// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Snapshot mutations shared by the command handlers and the CLI.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::agent::AgentContext;
use crate::bus::{Channel, Envelope, PacketDelivery};
use crate::comm::CommLayout;
use crate::config::ResolvedConfig;
use crate::error::{BusError, ReaperError, TreeError};
use crate::reaper::{Reaper, ReaperMission, ReaperReport};
use crate::tree::{AgentNode, LoadPolicy, SnapshotWriter, SupervisionTree};

use super::CONFIG_UPDATED;

/// Read-modify-write access to the canonical snapshot.
///
/// Every mutation reloads the file, applies the change and saves atomically
/// under the process-wide [`SnapshotWriter`]. Writers in other processes
/// are not excluded.
#[derive(Clone)]
pub struct TreeOps {
    settings: Arc<ResolvedConfig>,
    layout: CommLayout,
    writer: SnapshotWriter,
    reaper: Reaper,
    delivery: Arc<dyn PacketDelivery>,
    /// Agent serving these operations. Its own cascade is never terminated.
    host: Option<String>,
}

impl std::fmt::Debug for TreeOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeOps")
            .field("snapshot", &self.layout.snapshot_path())
            .finish()
    }
}

impl TreeOps {
    pub fn new(settings: Arc<ResolvedConfig>, reaper: Reaper, delivery: Arc<dyn PacketDelivery>) -> Self {
        Self {
            layout: settings.layout(),
            settings,
            writer: SnapshotWriter::new(),
            reaper,
            delivery,
            host: None,
        }
    }

    /// Operations bound to an agent's layout, process table and write lock.
    pub fn from_context(ctx: &AgentContext) -> Self {
        let mut ops = Self::new(ctx.settings().clone(), ctx.reaper(), ctx.delivery())
            .with_writer(ctx.snapshot_writer().clone());
        ops.host = Some(ctx.id().to_string());
        ops
    }

    pub fn with_writer(mut self, writer: SnapshotWriter) -> Self {
        self.writer = writer;
        self
    }

    pub fn layout(&self) -> &CommLayout {
        &self.layout
    }

    pub fn load_policy(&self) -> LoadPolicy {
        self.settings.load_policy()
    }

    pub fn load(&self) -> Result<SupervisionTree, TreeError> {
        let path = self.layout.snapshot_path();
        let (tree, report) = SupervisionTree::load_file(&path, self.settings.load_policy())?;
        if !report.is_clean() {
            warn!(
                duplicates = ?report.rejected_duplicates,
                pruned = ?report.pruned,
                "Snapshot loaded with rejected entries"
            );
        }
        Ok(tree)
    }

    fn store(&self, tree: &SupervisionTree) -> Result<(), TreeError> {
        let _timer = crate::timed!("snapshot_save");
        tree.save(&self.layout.snapshot_path())
    }

    /// Load, apply `f`, save. Nothing is written when `f` fails.
    pub fn update<T, F>(&self, f: F) -> Result<T, TreeError>
    where
        F: FnOnce(&mut SupervisionTree) -> Result<T, TreeError>,
    {
        let _guard = self.writer.lock();
        let mut tree = self.load()?;
        let out = f(&mut tree)?;
        self.store(&tree)?;
        Ok(out)
    }

    /// Replace the snapshot wholesale.
    pub fn install(&self, tree: &SupervisionTree) -> Result<(), TreeError> {
        let _guard = self.writer.lock();
        self.store(tree)
    }

    /// Insert `node` under `parent_id` (the root when `None`).
    pub fn inject(&self, parent_id: Option<&str>, node: AgentNode) -> Result<Vec<String>, TreeError> {
        let ids = self.update(|tree| {
            let parent = parent_id
                .map(String::from)
                .unwrap_or_else(|| tree.root_id().to_string());
            tree.insert(node, &parent)
        })?;
        info!(inserted = ?ids, "Injected subtree");
        Ok(ids)
    }

    /// Stop the cascade of `id` and keep it in the tree as `killed`.
    pub async fn kill(&self, id: &str) -> Result<ReaperReport, BusError> {
        self.terminate(id, false).await
    }

    /// Stop the cascade of `id`, remove it from the tree and delete its
    /// comm channels.
    pub async fn delete(&self, id: &str) -> Result<ReaperReport, BusError> {
        let report = self.terminate(id, true).await?;
        for member in &report.targets {
            self.layout.remove_channel(member)?;
        }
        Ok(report)
    }

    async fn terminate(&self, id: &str, detach: bool) -> Result<ReaperReport, BusError> {
        let lock = self.update(|tree| {
            if let Some(host) = &self.host {
                if tree.cascade(id).iter().any(|member| member == host) {
                    return Err(TreeError::SelfTermination(id.to_string()));
                }
            }
            tree.lock_for_termination(id, detach)
        })?;
        let verb = if detach { "delete" } else { "kill" };
        let mission = ReaperMission::new(format!("{}:{}", verb, id), lock.ids().to_vec())
            .with_settings(&self.settings)
            .with_tombstones(detach, detach);

        let report = self.reaper.run(&mission).await;

        if !report.is_complete() {
            let survivors: Vec<String> = report
                .survivors()
                .iter()
                .map(|s| s.instance_id.clone())
                .collect();
            warn!(agent_id = %id, survivors = ?survivors, "Termination incomplete, releasing lock");
            self.update(|tree| tree.abort_termination(lock))?;
            return Err(ReaperError::Survivors(survivors).into());
        }

        self.update(|tree| {
            tree.confirm_termination(lock);
            Ok(())
        })?;
        info!(agent_id = %id, targets = report.targets.len(), "Termination confirmed");
        Ok(report)
    }

    /// Clear `killed` and the die/tombstone markers on the cascade of `id`.
    pub fn resume(&self, id: &str) -> Result<Vec<String>, BusError> {
        let ids = self.update(|tree| tree.revive_subtree(id))?;
        for member in &ids {
            self.layout.clear_markers(member)?;
        }
        info!(agent_id = %id, revived = ids.len(), "Resumed subtree");
        Ok(ids)
    }

    /// Release termination locks left on the cascade of `id` by a
    /// supervisor that stopped before confirming or aborting.
    pub fn unlock(&self, id: &str) -> Result<Vec<String>, BusError> {
        let released = self.update(|tree| tree.release_locks(id))?;
        if released.is_empty() {
            info!(agent_id = %id, "No termination locks to release");
        } else {
            warn!(agent_id = %id, released = ?released, "Released stale termination locks");
        }
        Ok(released)
    }

    /// Replace the configuration of `id` and tell the running agent.
    pub async fn update_config(&self, id: &str, config: Map<String, Value>) -> Result<(), BusError> {
        let notice = Envelope::new(CONFIG_UPDATED, json!({ "id": id, "config": config.clone() }));
        self.update(|tree| tree.update_config(id, config))?;
        if let Err(e) = self.delivery.deliver(id, &notice, Channel::Reflex).await {
            warn!(agent_id = %id, error = %e, "Config update notice not delivered");
        }
        Ok(())
    }

    /// Deliver `envelope` to the command inbox of `target`, which must be
    /// in the tree.
    pub async fn forward(&self, target: &str, envelope: Envelope) -> Result<(), BusError> {
        if !self.load()?.contains(target) {
            return Err(TreeError::NodeNotFound(target.to_string()).into());
        }
        self.delivery.deliver(target, &envelope, Channel::Command).await
    }

    /// Nested form of the current snapshot.
    pub fn snapshot(&self) -> Result<AgentNode, TreeError> {
        Ok(self.load()?.to_node())
    }

    pub async fn reply(&self, target: &str, envelope: Envelope) -> Result<(), BusError> {
        self.delivery.deliver(target, &envelope, Channel::Reflex).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::context;
    use crate::reaper::{MockProcessTable, ProcessTable};
    use crate::spawn::{write_boot_record, BootRecord};
    use chrono::Utc;
    use tempfile::TempDir;

    fn seeded(temp: &TempDir, table: MockProcessTable) -> TreeOps {
        let ctx = context(temp, "matrix", "orchestrator")
            .with_process_table(Arc::new(table) as Arc<dyn ProcessTable>);
        let ops = TreeOps::from_context(&ctx);
        let tree = SupervisionTree::from_node(
            AgentNode::new("matrix", "orchestrator").with_child(
                AgentNode::new("watchdog-1", "redis_watchdog")
                    .with_child(AgentNode::new("probe-1", "probe")),
            ),
        )
        .unwrap();
        ops.install(&tree).unwrap();
        ops
    }

    fn nothing_running() -> MockProcessTable {
        let mut table = MockProcessTable::new();
        table.expect_cmdline().returning(|_| None);
        table.expect_signal().returning(|_, _| Ok(()));
        table
    }

    #[test]
    fn test_inject_rejects_collision_without_writing() {
        let temp = TempDir::new().unwrap();
        let ops = seeded(&temp, nothing_running());

        let ids = ops.inject(None, AgentNode::new("cache-1", "redis")).unwrap();
        assert_eq!(ids, vec!["cache-1"]);

        let colliding = AgentNode::new("fresh", "t").with_child(AgentNode::new("probe-1", "probe"));
        let err = ops.inject(Some("cache-1"), colliding).unwrap_err();
        assert!(matches!(err, TreeError::DuplicateId(ref id) if id == "probe-1"));

        let tree = ops.load().unwrap();
        assert!(!tree.contains("fresh"));
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_inject_under_missing_parent() {
        let temp = TempDir::new().unwrap();
        let ops = seeded(&temp, nothing_running());
        let err = ops.inject(Some("ghost"), AgentNode::new("x", "t")).unwrap_err();
        assert!(matches!(err, TreeError::ParentNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_marks_cascade_killed() {
        let temp = TempDir::new().unwrap();
        let ops = seeded(&temp, nothing_running());

        let report = ops.kill("watchdog-1").await.unwrap();
        assert_eq!(report.targets, vec!["watchdog-1", "probe-1"]);

        let tree = ops.load().unwrap();
        assert!(tree.get("watchdog-1").unwrap().killed);
        assert!(tree.get("probe-1").unwrap().killed);
        assert!(!tree.get("watchdog-1").unwrap().operation_in_progress);
        assert!(ops.layout().has_die_marker("watchdog-1"));

        let revived = ops.resume("watchdog-1").unwrap();
        assert_eq!(revived.len(), 2);
        assert!(!ops.load().unwrap().get("probe-1").unwrap().killed);
        assert!(!ops.layout().has_die_marker("watchdog-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_removes_subtree_and_channels() {
        let temp = TempDir::new().unwrap();
        let ops = seeded(&temp, nothing_running());
        ops.layout().ensure_channel("watchdog-1").unwrap();

        ops.delete("watchdog-1").await.unwrap();

        let tree = ops.load().unwrap();
        assert_eq!(tree.all_ids(), vec!["matrix"]);
        assert!(!ops.layout().channel("watchdog-1").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_survivor_releases_lock() {
        let temp = TempDir::new().unwrap();
        let argv = vec!["/pod/probe-1-x/probe-1".to_string(), "agent".to_string()];
        let running = argv.clone();
        let mut table = MockProcessTable::new();
        table.expect_cmdline().returning(move |_| Some(running.clone()));
        table.expect_signal().returning(|_, _| Ok(()));
        let ops = seeded(&temp, table);

        ops.layout().ensure_pod("probe-1-x").unwrap();
        write_boot_record(
            ops.layout(),
            &BootRecord {
                id: "probe-1".to_string(),
                instance_id: "probe-1-x".to_string(),
                agent_type: "probe".to_string(),
                pid: 4242,
                launch_command: argv,
                boot_time: Utc::now(),
            },
        )
        .unwrap();

        let err = ops.delete("watchdog-1").await.unwrap_err();
        assert!(matches!(err, BusError::Reaper(ReaperError::Survivors(_))));

        let tree = ops.load().unwrap();
        assert_eq!(tree.find_parent_of("watchdog-1"), Some("matrix"));
        assert!(!tree.get("probe-1").unwrap().operation_in_progress);
        assert!(!tree.get("probe-1").unwrap().killed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_releases_lock_left_by_crashed_supervisor() {
        let temp = TempDir::new().unwrap();
        let ops = seeded(&temp, nothing_running());
        // Lock persisted, handle lost before confirm or abort.
        drop(ops.update(|tree| tree.lock_for_termination("watchdog-1", false)).unwrap());

        assert!(matches!(ops.resume("watchdog-1"), Err(BusError::Tree(TreeError::Locked(_)))));
        assert!(matches!(ops.kill("watchdog-1").await, Err(BusError::Tree(TreeError::Locked(_)))));

        let mut released = ops.unlock("watchdog-1").unwrap();
        released.sort();
        assert_eq!(released, vec!["probe-1", "watchdog-1"]);
        let tree = ops.load().unwrap();
        assert!(!tree.get("probe-1").unwrap().operation_in_progress);
        assert!(!tree.get("probe-1").unwrap().killed);

        ops.delete("watchdog-1").await.unwrap();
        assert_eq!(ops.load().unwrap().all_ids(), vec!["matrix"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_to_terminate_own_cascade() {
        let temp = TempDir::new().unwrap();
        let ops = seeded(&temp, nothing_running());

        let err = ops.kill("matrix").await.unwrap_err();
        assert!(matches!(err, BusError::Tree(TreeError::SelfTermination(ref id)) if id == "matrix"));

        let tree = ops.load().unwrap();
        assert!(tree.all_ids().iter().all(|id| !tree.get(id).unwrap().operation_in_progress));
        assert!(!ops.layout().has_die_marker("matrix"));
        assert!(!ops.layout().has_die_marker("watchdog-1"));
    }

    #[tokio::test]
    async fn test_update_config_notifies_agent() {
        let temp = TempDir::new().unwrap();
        let ops = seeded(&temp, nothing_running());
        let mut config = Map::new();
        config.insert("redis_port".to_string(), json!(6380));

        ops.update_config("watchdog-1", config.clone()).await.unwrap();
        assert_eq!(ops.load().unwrap().get("watchdog-1").unwrap().config, config);

        let notice = crate::bus::FsDelivery::new(ops.layout().clone())
            .receive("watchdog-1", Channel::Reflex)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.kind, CONFIG_UPDATED);
        assert_eq!(notice.content["config"]["redis_port"], json!(6380));
    }

    #[tokio::test]
    async fn test_forward_requires_known_target() {
        let temp = TempDir::new().unwrap();
        let ops = seeded(&temp, nothing_running());
        let err = ops
            .forward("ghost", Envelope::new("restart", Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Tree(TreeError::NodeNotFound(_))));
        ops.forward("probe-1", Envelope::new("restart", Value::Null))
            .await
            .unwrap();
    }
}
