// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestrator agent.
//!
//! The tree root owns the canonical snapshot and serves the commands that
//! mutate it. Every mutation goes through [`TreeOps`]:
//!
//! | command            | content                              | effect |
//! |--------------------|--------------------------------------|--------|
//! | `inject`           | `{parent_id?, node}`                 | insert subtree, whole-subtree rejection on collision |
//! | `shutdown_subtree` | `{id}`                               | reap cascade, mark `killed` |
//! | `delete_agent`     | `{id}`                               | detach, reap with tombstones, drop channels |
//! | `resume_subtree`   | `{id}`                               | clear `killed` and markers |
//! | `release_lock`     | `{id}`                               | clear termination locks left by a crash |
//! | `update_agent`     | `{id, config}`                       | replace config, `config_updated` reflex |
//! | `forward_command`  | `{target, type, content, reply_to?}` | deliver to another inbox |
//! | `list_tree`        | none                                 | `tree_snapshot` reflex to `reply_to` |

mod client;
mod ops;

pub use client::OrchestratorClient;
pub use ops::TreeOps;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::agent::{AgentContext, Worker};
use crate::bus::{handler_fn, CommandResult, Envelope, HandlerRegistry, MessageHandler, COMMAND_RESULT};
use crate::comm::atomic_write;
use crate::error::{AgentError, BusError};
use crate::heartbeat::HeartbeatMonitor;
use crate::telemetry::GLOBAL_METRICS;
use crate::tree::{parse_node, AgentNode, LoadPolicy, LoadReport};

pub const INJECT: &str = "inject";
pub const SHUTDOWN_SUBTREE: &str = "shutdown_subtree";
pub const DELETE_AGENT: &str = "delete_agent";
pub const RESUME_SUBTREE: &str = "resume_subtree";
pub const RELEASE_LOCK: &str = "release_lock";
pub const UPDATE_AGENT: &str = "update_agent";
pub const FORWARD_COMMAND: &str = "forward_command";
pub const LIST_TREE: &str = "list_tree";

/// Commands the orchestrator must serve.
pub const COMMANDS: [&str; 8] = [
    INJECT,
    SHUTDOWN_SUBTREE,
    DELETE_AGENT,
    RESUME_SUBTREE,
    RELEASE_LOCK,
    UPDATE_AGENT,
    FORWARD_COMMAND,
    LIST_TREE,
];

/// Reflex sent to an agent whose tree config was replaced.
pub const CONFIG_UPDATED: &str = "config_updated";
/// Reflex answering `list_tree`.
pub const TREE_SNAPSHOT: &str = "tree_snapshot";
/// Metrics report rewritten by the orchestrator every work cycle, inside its logs dir.
pub const METRICS_REPORT: &str = "metrics.txt";

#[derive(Debug, Deserialize)]
struct InjectRequest {
    #[serde(default)]
    parent_id: Option<String>,
    node: Value,
}

#[derive(Debug, Deserialize)]
struct TargetRequest {
    #[serde(alias = "target_id", alias = "universal_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    id: String,
    #[serde(default)]
    config: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ForwardRequest {
    target: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    reply_to: Option<String>,
}

/// Parse a subtree offered for injection.
///
/// Malformed descendants are pruned under the lenient policy; a malformed
/// root rejects the whole offer.
pub fn parse_injected(value: &Value, policy: LoadPolicy) -> Result<(AgentNode, LoadReport), BusError> {
    let mut report = LoadReport::default();
    let node = parse_node(value, policy, &mut report)?
        .ok_or_else(|| BusError::InvalidContent(format!("node rejected: {}", report.pruned.join("; "))))?;
    Ok((node, report))
}

async fn inject(ops: Arc<TreeOps>, message: Envelope) -> Result<Value, BusError> {
    let request: InjectRequest = message.content_as()?;
    let (node, report) = parse_injected(&request.node, ops.load_policy())?;
    let inserted = ops.inject(request.parent_id.as_deref(), node)?;
    Ok(json!({ "inserted": inserted, "pruned": report.pruned }))
}

async fn shutdown_subtree(ops: Arc<TreeOps>, message: Envelope) -> Result<Value, BusError> {
    let request: TargetRequest = message.content_as()?;
    let report = ops.kill(&request.id).await?;
    Ok(serde_json::to_value(report)?)
}

async fn delete_agent(ops: Arc<TreeOps>, message: Envelope) -> Result<Value, BusError> {
    let request: TargetRequest = message.content_as()?;
    let report = ops.delete(&request.id).await?;
    Ok(serde_json::to_value(report)?)
}

async fn resume_subtree(ops: Arc<TreeOps>, message: Envelope) -> Result<Value, BusError> {
    let request: TargetRequest = message.content_as()?;
    let revived = ops.resume(&request.id)?;
    Ok(json!({ "revived": revived }))
}

async fn release_lock(ops: Arc<TreeOps>, message: Envelope) -> Result<Value, BusError> {
    let request: TargetRequest = message.content_as()?;
    let released = ops.unlock(&request.id)?;
    Ok(json!({ "released": released }))
}

async fn update_agent(ops: Arc<TreeOps>, message: Envelope) -> Result<Value, BusError> {
    let request: UpdateRequest = message.content_as()?;
    ops.update_config(&request.id, request.config).await?;
    Ok(Value::Null)
}

async fn forward_command(ops: Arc<TreeOps>, message: Envelope) -> Result<Value, BusError> {
    let request: ForwardRequest = message.content_as()?;
    let mut envelope = Envelope::new(request.kind, request.content);
    if let Some(reply_to) = request.reply_to {
        envelope = envelope.with_reply_to(reply_to);
    }
    ops.forward(&request.target, envelope).await?;
    Ok(Value::Null)
}

async fn list_tree(ops: Arc<TreeOps>, message: Envelope) -> Result<Value, BusError> {
    let tree = serde_json::to_value(ops.snapshot()?)?;
    if let Some(reply_to) = &message.reply_to {
        let mut answer = Envelope::new(TREE_SNAPSHOT, tree.clone());
        if let Some(id) = &message.id {
            answer = answer.with_id(id.clone());
        }
        ops.reply(reply_to, answer).await?;
    }
    Ok(tree)
}

fn route<F, Fut>(ops: &Arc<TreeOps>, f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<TreeOps>, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BusError>> + Send + 'static,
{
    let ops = ops.clone();
    handler_fn(move |message| f(ops.clone(), message))
}

/// Register every orchestrator command on `registry`.
pub fn register_commands(ops: Arc<TreeOps>, registry: &mut HandlerRegistry) {
    registry
        .register(INJECT, route(&ops, inject))
        .register(SHUTDOWN_SUBTREE, route(&ops, shutdown_subtree))
        .register(DELETE_AGENT, route(&ops, delete_agent))
        .register(RESUME_SUBTREE, route(&ops, resume_subtree))
        .register(RELEASE_LOCK, route(&ops, release_lock))
        .register(UPDATE_AGENT, route(&ops, update_agent))
        .register(FORWARD_COMMAND, route(&ops, forward_command))
        .register(LIST_TREE, route(&ops, list_tree));
}

/// Worker of the tree root.
///
/// Each cycle reports channels that have no runtime instance on record and
/// publishes the process metrics for `swarmer status --metrics`.
#[derive(Debug, Default)]
pub struct OrchestratorWorker {
    phantoms: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl Worker for OrchestratorWorker {
    async fn work(&self, ctx: &AgentContext) -> Result<(), AgentError> {
        let current: BTreeSet<String> = HeartbeatMonitor::new(ctx.layout().clone())
            .phantoms()
            .into_iter()
            .collect();
        let mut known = self.phantoms.lock().unwrap_or_else(|p| p.into_inner());
        for id in current.difference(&known) {
            warn!(agent_id = %id, "Phantom channel: no runtime instance on record");
            ctx.log(&format!("phantom channel {}", id));
        }
        *known = current;
        drop(known);

        let report = GLOBAL_METRICS.snapshot().format_report();
        atomic_write(&ctx.layout().logs_dir(ctx.id()).join(METRICS_REPORT), report.as_bytes())?;
        Ok(())
    }

    fn register_commands(&self, ctx: &Arc<AgentContext>, registry: &mut HandlerRegistry) {
        register_commands(Arc::new(TreeOps::from_context(ctx)), registry);
    }

    fn register_reflexes(&self, ctx: &Arc<AgentContext>, registry: &mut HandlerRegistry) {
        let ctx = ctx.clone();
        registry.register(
            COMMAND_RESULT,
            handler_fn(move |message: Envelope| {
                let ctx = ctx.clone();
                async move {
                    let result: CommandResult = message.content_as()?;
                    if result.success {
                        info!(command = %result.command, "Forwarded command succeeded");
                    } else {
                        warn!(command = %result.command, error = ?result.error, "Forwarded command failed");
                    }
                    ctx.log(&format!(
                        "{} -> {}",
                        result.command,
                        if result.success { "ok" } else { "failed" }
                    ));
                    Ok::<_, BusError>(Value::Null)
                }
            }),
        );
    }

    fn required_commands(&self) -> Vec<&'static str> {
        COMMANDS.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::context;
    use crate::bus::{Channel, FsDelivery, MessagePoller, PacketDelivery};
    use crate::reaper::MockProcessTable;
    use crate::tree::{AgentNode, SupervisionTree};
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        delivery: Arc<FsDelivery>,
        poller: MessagePoller,
        ops: Arc<TreeOps>,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let mut table = MockProcessTable::new();
        table.expect_cmdline().returning(|_| None);
        table.expect_signal().returning(|_, _| Ok(()));
        let ctx = Arc::new(context(&temp, "matrix", "orchestrator").with_process_table(Arc::new(table)));

        let ops = Arc::new(TreeOps::from_context(&ctx));
        ops.install(
            &SupervisionTree::from_node(
                AgentNode::new("matrix", "orchestrator")
                    .with_child(AgentNode::new("watchdog-1", "redis_watchdog")),
            )
            .unwrap(),
        )
        .unwrap();

        let mut registry = HandlerRegistry::new(Channel::Command);
        OrchestratorWorker::default().register_commands(&ctx, &mut registry);
        registry.require(COMMANDS).unwrap();

        let delivery = ctx.fs_delivery().clone();
        let poller = MessagePoller::new("matrix", Arc::new(registry), ctx.delivery());
        Harness {
            _temp: temp,
            delivery,
            poller,
            ops,
        }
    }

    impl Harness {
        async fn command(&self, kind: &str, content: Value) -> CommandResult {
            self.delivery
                .deliver(
                    "matrix",
                    &Envelope::new(kind, content).with_reply_to("operator"),
                    Channel::Command,
                )
                .await
                .unwrap();
            self.poller.poll_once().await;
            let reply = self
                .delivery
                .receive("operator", Channel::Reflex)
                .await
                .unwrap()
                .unwrap();
            reply.content_as().unwrap()
        }
    }

    #[tokio::test]
    async fn test_inject_collision_reported_to_sender() {
        let h = harness();
        let ok = h
            .command(INJECT, json!({"node": {"id": "cache-1", "type": "redis"}}))
            .await;
        assert!(ok.success);

        let dup = h
            .command(
                INJECT,
                json!({"parent_id": "cache-1", "node": {"id": "watchdog-1", "type": "redis_watchdog"}}),
            )
            .await;
        assert!(!dup.success);
        assert!(dup.error.unwrap().contains("watchdog-1"));
        assert_eq!(h.ops.load().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_inject_malformed_node_rejected() {
        let h = harness();
        let result = h.command(INJECT, json!({"node": {"id": "no-type"}})).await;
        assert!(!result.success);
        assert_eq!(h.ops.load().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_and_resume() {
        let h = harness();
        let killed = h.command(SHUTDOWN_SUBTREE, json!({"id": "watchdog-1"})).await;
        assert!(killed.success, "{:?}", killed.error);
        assert!(h.ops.load().unwrap().get("watchdog-1").unwrap().killed);

        let resumed = h.command(RESUME_SUBTREE, json!({"id": "watchdog-1"})).await;
        assert!(resumed.success);
        assert_eq!(resumed.result["revived"], json!(["watchdog-1"]));
    }

    #[tokio::test]
    async fn test_shutdown_of_own_cascade_refused() {
        let h = harness();
        let result = h.command(SHUTDOWN_SUBTREE, json!({"id": "matrix"})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("orchestrator"));
        assert!(!h.ops.layout().has_die_marker("matrix"));
        assert!(!h.ops.load().unwrap().get("matrix").unwrap().operation_in_progress);
    }

    #[tokio::test]
    async fn test_release_lock_clears_stale_lock() {
        let h = harness();
        drop(h.ops.update(|tree| tree.lock_for_termination("watchdog-1", false)).unwrap());

        let result = h.command(RELEASE_LOCK, json!({"id": "watchdog-1"})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result["released"], json!(["watchdog-1"]));
        assert!(!h.ops.load().unwrap().get("watchdog-1").unwrap().operation_in_progress);
    }

    #[tokio::test]
    async fn test_list_tree_answers_with_snapshot() {
        let h = harness();
        h.delivery
            .deliver(
                "matrix",
                &Envelope::new(LIST_TREE, Value::Null)
                    .with_reply_to("operator")
                    .with_id("req-1"),
                Channel::Command,
            )
            .await
            .unwrap();
        h.poller.poll_once().await;

        let replies: Vec<Envelope> = h
            .delivery
            .receive_all("operator", Channel::Reflex)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        let snapshot = replies.iter().find(|e| e.kind == TREE_SNAPSHOT).unwrap();
        assert_eq!(snapshot.id.as_deref(), Some("req-1"));
        assert_eq!(snapshot.content["children"][0]["id"], json!("watchdog-1"));
        assert!(replies.iter().any(|e| e.kind == COMMAND_RESULT));
    }

    #[tokio::test]
    async fn test_forward_reaches_target_inbox() {
        let h = harness();
        let result = h
            .command(
                FORWARD_COMMAND,
                json!({"target": "watchdog-1", "type": "flush", "content": {"db": 0}}),
            )
            .await;
        assert!(result.success);
        let forwarded = h
            .delivery
            .receive("watchdog-1", Channel::Command)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.kind, "flush");
        assert_eq!(forwarded.content["db"], json!(0));
    }

    #[tokio::test]
    async fn test_phantoms_reported_once() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, "matrix", "orchestrator");
        ctx.layout().ensure_channel("stray").unwrap();
        let worker = OrchestratorWorker::default();
        worker.work(&ctx).await.unwrap();
        worker.work(&ctx).await.unwrap();

        let log = std::fs::read_to_string(ctx.log_path()).unwrap();
        assert_eq!(log.matches("phantom channel stray").count(), 1);

        let report = std::fs::read_to_string(ctx.layout().logs_dir("matrix").join(METRICS_REPORT)).unwrap();
        assert!(report.starts_with("=== Metrics Report ==="));
    }
}
