// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker implementations and their registry.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::bus::HandlerRegistry;
use crate::config::{ResolvedConfig, WorkerProgram};
use crate::error::AgentError;
use crate::orchestrator::OrchestratorWorker;
use crate::spawn::{locate_program, WorkerResolver};

use super::AgentContext;

/// Domain behaviour of one agent type.
///
/// `work` runs on the throttled cadence. Message handlers are registered
/// once at startup; anything not registered is dropped by the bus.
#[async_trait]
pub trait Worker: Send + Sync {
    /// One unit of work. An error is logged and the next cycle still runs.
    async fn work(&self, ctx: &AgentContext) -> Result<(), AgentError>;

    fn register_commands(&self, _ctx: &Arc<AgentContext>, _registry: &mut HandlerRegistry) {}

    fn register_reflexes(&self, _ctx: &Arc<AgentContext>, _registry: &mut HandlerRegistry) {}

    /// Command types that must have a handler once registration is done.
    fn required_commands(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

/// Builds a worker for one process.
pub type WorkerFactory = Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;

/// Agent types compiled into the binary.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    factories: BTreeMap<String, WorkerFactory>,
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `orchestrator` and `supervisor`.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            "orchestrator",
            Arc::new(|| Arc::new(OrchestratorWorker::default()) as Arc<dyn Worker>),
        );
        registry.register(
            "supervisor",
            Arc::new(|| Arc::new(SupervisorWorker) as Arc<dyn Worker>),
        );
        registry
    }

    pub fn register(&mut self, agent_type: impl Into<String>, factory: WorkerFactory) -> &mut Self {
        self.factories.insert(agent_type.into(), factory);
        self
    }

    pub fn types(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Spawn-side view: built-in types plus configured external programs.
    pub fn resolver(&self, settings: &ResolvedConfig) -> WorkerResolver {
        WorkerResolver::new(self.types(), settings.workers.clone())
    }

    /// Worker for `agent_type`: built-in first, then configured programs.
    pub fn create(
        &self,
        agent_type: &str,
        settings: &ResolvedConfig,
    ) -> Result<Arc<dyn Worker>, AgentError> {
        if let Some(factory) = self.factories.get(agent_type) {
            return Ok(factory());
        }
        match settings.workers.get(agent_type) {
            Some(program) => Ok(Arc::new(ExecWorker::new(program.clone()))),
            None => Err(AgentError::UnknownWorker(agent_type.to_string())),
        }
    }
}

/// Pure supervisor: its only job is the spawn controller that every agent
/// runs for its children.
#[derive(Debug, Default)]
pub struct SupervisorWorker;

#[async_trait]
impl Worker for SupervisorWorker {
    async fn work(&self, _ctx: &AgentContext) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Runs an external program once per work cycle.
///
/// The program gets the agent's identity and node configuration through the
/// environment and runs inside the agent's comm channel. Its output goes to
/// the agent log sink.
#[derive(Debug, Clone)]
pub struct ExecWorker {
    program: WorkerProgram,
}

impl ExecWorker {
    pub fn new(program: WorkerProgram) -> Self {
        Self { program }
    }
}

#[async_trait]
impl Worker for ExecWorker {
    async fn work(&self, ctx: &AgentContext) -> Result<(), AgentError> {
        let path = locate_program(&self.program.program).ok_or_else(|| {
            AgentError::WorkerFailed(format!("program not found: {}", self.program.program))
        })?;
        let config = serde_json::to_string(ctx.config())
            .map_err(|e| AgentError::WorkerFailed(e.to_string()))?;

        let output = Command::new(&path)
            .args(&self.program.args)
            .current_dir(ctx.layout().channel(ctx.id()))
            .env("SWARMER_AGENT_ID", ctx.id())
            .env("SWARMER_INSTANCE_ID", ctx.instance_id())
            .env("SWARMER_AGENT_TYPE", ctx.agent_type())
            .env("SWARMER_UNIVERSE", ctx.universe())
            .env("SWARMER_COMM_DIR", ctx.layout().channel(ctx.id()))
            .env("SWARMER_CONFIG", config)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AgentError::WorkerFailed(format!("{}: {}", path.display(), e)))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            ctx.log(line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            ctx.log(&format!("stderr: {}", line));
        }
        debug!(program = %path.display(), status = %output.status, "Work cycle finished");

        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::WorkerFailed(format!(
                "{} exited with {}",
                self.program.program, output.status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::context::test_support::context;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_types() {
        let registry = WorkerRegistry::builtin();
        assert_eq!(registry.types(), vec!["orchestrator", "supervisor"]);
        let settings = ResolvedConfig::default();
        assert!(registry.create("supervisor", &settings).is_ok());
        assert!(matches!(
            registry.create("ghost", &settings),
            Err(AgentError::UnknownWorker(_))
        ));
    }

    #[test]
    fn test_configured_program_becomes_exec_worker() {
        let registry = WorkerRegistry::builtin();
        let mut settings = ResolvedConfig::default();
        settings.workers.insert(
            "redis_watchdog".to_string(),
            WorkerProgram {
                program: "true".to_string(),
                args: Vec::new(),
            },
        );
        assert!(registry.create("redis_watchdog", &settings).is_ok());
        assert!(registry
            .resolver(&settings)
            .known_types()
            .contains(&"redis_watchdog".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_worker_logs_output() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, "w-1", "echoer");
        ctx.layout().ensure_channel("w-1").unwrap();

        let worker = ExecWorker::new(WorkerProgram {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo \"hello $SWARMER_AGENT_ID\"".to_string()],
        });
        worker.work(&ctx).await.unwrap();

        let log = std::fs::read_to_string(ctx.log_path()).unwrap();
        assert!(log.contains("hello w-1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_worker_failure_is_reported() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, "w-1", "failer");
        ctx.layout().ensure_channel("w-1").unwrap();

        let worker = ExecWorker::new(WorkerProgram {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
        });
        assert!(matches!(worker.work(&ctx).await, Err(AgentError::WorkerFailed(_))));
    }
}
