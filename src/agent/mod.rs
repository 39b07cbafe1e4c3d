// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent module - the per-process supervision runtime.
//!
//! Every agent process runs the same task set around its domain [`Worker`]:
//!
//! - heartbeat emitter writing the `main` beacon
//! - singleton guard (die marker, younger duplicate instance)
//! - spawn controller for the agent's own children
//! - command and reflex inbox pollers
//! - load throttle publishing the worker delay
//! - the worker loop itself, observed by a watchdog
//!
//! The runtime returns an [`ExitReason`] once any of these decides the
//! process must end; the caller turns it into the process exit status.
//!
//! # Example
//!
//! ```rust,ignore
//! use swarmer::agent::{AgentContext, AgentRuntime, WorkerRegistry};
//! use swarmer::spawn::BootBundle;
//!
//! let ctx = AgentContext::new(BootBundle::from_env()?);
//! let runtime = AgentRuntime::new(ctx, WorkerRegistry::builtin())?;
//! let reason = runtime.run().await?;
//! std::process::exit(reason.exit_code());
//! ```

mod context;
mod singleton;
mod throttle;
mod types;
mod worker;

pub use context::{AgentContext, AGENT_LOG};
pub use singleton::SingletonGuard;
pub use throttle::{read_loadavg, Throttle};
pub use types::{ExitReason, RuntimeOptions};
pub use worker::{ExecWorker, SupervisorWorker, Worker, WorkerFactory, WorkerRegistry};

#[cfg(test)]
pub(crate) use context::test_support;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::bus::{Channel, HandlerRegistry, MessagePoller};
use crate::controller::SpawnController;
use crate::error::AgentError;
use crate::heartbeat::HeartbeatEmitter;
use crate::spawn::{read_boot_record, Launcher, RuntimeSpawner};

/// Task set of one agent process.
pub struct AgentRuntime {
    ctx: Arc<AgentContext>,
    worker: Arc<dyn Worker>,
    workers: WorkerRegistry,
    options: RuntimeOptions,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("ctx", &self.ctx)
            .field("workers", &self.workers)
            .field("options", &self.options)
            .finish()
    }
}

impl AgentRuntime {
    /// Runtime for the worker registered under the context's agent type.
    pub fn new(ctx: AgentContext, workers: WorkerRegistry) -> Result<Self, AgentError> {
        let worker = workers.create(ctx.agent_type(), ctx.settings())?;
        Ok(Self::with_worker(ctx, worker, workers))
    }

    /// Runtime for an explicit worker. `workers` is still used to resolve
    /// the types of this agent's children.
    pub fn with_worker(ctx: AgentContext, worker: Arc<dyn Worker>, workers: WorkerRegistry) -> Self {
        let options = RuntimeOptions::from_settings(ctx.settings());
        Self {
            ctx: Arc::new(ctx),
            worker,
            workers,
            options,
        }
    }

    pub fn with_options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Command and reflex tables, checked against the worker's requirements.
    pub fn registries(&self) -> Result<(HandlerRegistry, HandlerRegistry), AgentError> {
        let mut commands = HandlerRegistry::new(Channel::Command);
        let mut reflexes = HandlerRegistry::new(Channel::Reflex);
        self.worker.register_commands(&self.ctx, &mut commands);
        self.worker.register_reflexes(&self.ctx, &mut reflexes);
        commands.require(self.worker.required_commands())?;
        Ok((commands, reflexes))
    }

    fn controller(&self) -> Result<SpawnController, AgentError> {
        let launcher = match &self.options.launcher {
            Some(launcher) => launcher.clone(),
            None => Launcher::current_exe()?,
        };
        let settings = self.ctx.settings().clone();
        let spawner = RuntimeSpawner::new(settings.clone(), self.workers.resolver(&settings), launcher);
        Ok(SpawnController::new(
            self.ctx.id(),
            self.ctx.layout().clone(),
            Arc::new(spawner),
            settings.load_policy(),
        )
        .with_interval(self.options.reconcile_interval)
        .with_reconcile_timeout(self.options.reconcile_timeout)
        .with_liveness_confirmation(self.ctx.is_orchestrator())
        .with_writer(self.ctx.snapshot_writer().clone()))
    }

    fn singleton(&self) -> SingletonGuard {
        let layout = self.ctx.layout();
        let boot_time = read_boot_record(layout, self.ctx.instance_id())
            .map(|record| record.boot_time)
            .unwrap_or_else(Utc::now);
        SingletonGuard::new(
            layout.clone(),
            self.ctx.id(),
            self.ctx.instance_id(),
            boot_time,
            self.ctx.processes().clone(),
        )
        .with_interval(self.options.singleton_interval)
    }

    /// Run every task until one of them ends the process.
    pub async fn run(self) -> Result<ExitReason, AgentError> {
        self.run_until(shutdown_signal()).await
    }

    /// Like [`run`](Self::run), with `stop` standing in for the OS signals.
    pub async fn run_until<F>(self, stop: F) -> Result<ExitReason, AgentError>
    where
        F: std::future::Future<Output = ()>,
    {
        let ctx = self.ctx.clone();
        let layout = ctx.layout().clone();
        layout.ensure_channel(ctx.id())?;

        let (commands, reflexes) = self.registries()?;
        let controller = self.controller()?;
        let guard = self.singleton();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        tasks.spawn(
            HeartbeatEmitter::new(layout.clone(), ctx.id())
                .with_task("main")
                .with_interval(self.options.heartbeat_interval)
                .with_timeout(self.options.beacon_timeout)
                .run(shutdown_rx.clone()),
        );

        for registry in [commands, reflexes] {
            let mut poller = MessagePoller::new(ctx.id(), Arc::new(registry), ctx.delivery())
                .with_interval(self.options.bus_poll_interval);
            if self.options.watch_inboxes {
                let inbox = poller.channel().dir(&layout, ctx.id());
                poller = poller.with_watch(inbox);
            }
            ctx.fs_delivery()
                .register_waker(ctx.id(), poller.channel(), poller.waker());
            tasks.spawn(poller.run(shutdown_rx.clone()));
        }

        tasks.spawn(controller.run(shutdown_rx.clone()));

        let throttle = Throttle::new(self.options.throttle);
        let (delay_tx, delay_rx) = watch::channel(throttle.min_delay());
        tasks.spawn(throttle.run(delay_tx, self.options.throttle_sample, shutdown_rx.clone()));

        let mut worker_task = tokio::spawn(worker_loop(
            ctx.clone(),
            self.worker.clone(),
            delay_rx,
            shutdown_rx.clone(),
        ));
        let mut guard_task = tokio::spawn(guard.run(shutdown_rx));

        info!(
            agent_id = %ctx.id(),
            instance_id = %ctx.instance_id(),
            agent_type = %ctx.agent_type(),
            "Agent started"
        );
        ctx.log(&format!("started as {} ({})", ctx.instance_id(), ctx.agent_type()));

        let mut worker_joined = false;
        let reason = tokio::select! {
            joined = &mut worker_task => {
                worker_joined = true;
                match joined {
                    Ok(()) => ExitReason::WorkerStopped,
                    Err(e) => ExitReason::WorkerCrashed(join_message(e)),
                }
            }
            guarded = &mut guard_task => match guarded {
                Ok(Some(reason)) => reason,
                Ok(None) => ExitReason::Signal,
                Err(e) => ExitReason::WorkerCrashed(format!("singleton guard: {}", join_message(e))),
            },
            _ = stop => ExitReason::Signal,
        };

        if reason.is_failure() {
            error!(agent_id = %ctx.id(), reason = %reason, "Agent stopping");
        } else {
            info!(agent_id = %ctx.id(), reason = %reason, "Agent stopping");
        }
        ctx.log(&format!("stopping: {}", reason));

        let _ = shutdown_tx.send(true);
        let drain = async {
            while tasks.join_next().await.is_some() {}
            if !worker_joined {
                let _ = (&mut worker_task).await;
            }
        };
        if tokio::time::timeout(self.options.shutdown_grace, drain).await.is_err() {
            warn!(agent_id = %ctx.id(), "Tasks did not stop in time, aborting");
            tasks.abort_all();
        }
        worker_task.abort();
        guard_task.abort();

        Ok(reason)
    }
}

/// Run the worker on the throttled cadence. Errors are logged and the loop
/// goes on; only a panic ends it early.
async fn worker_loop(
    ctx: Arc<AgentContext>,
    worker: Arc<dyn Worker>,
    delay: watch::Receiver<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(e) = worker.work(&ctx).await {
            warn!(agent_id = %ctx.id(), error = %e, "Work cycle failed");
            ctx.log(&format!("work failed: {}", e));
        }
        let wait = *delay.borrow();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn join_message(err: JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        err.to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{handler_fn, Envelope, PacketDelivery};
    use crate::config::ThrottleConfig;
    use crate::heartbeat::{BeaconStatus, HeartbeatMonitor};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn fast_options() -> RuntimeOptions {
        RuntimeOptions {
            heartbeat_interval: Duration::from_millis(20),
            beacon_timeout: Duration::from_secs(5),
            bus_poll_interval: Duration::from_millis(20),
            watch_inboxes: false,
            reconcile_interval: Duration::from_millis(50),
            reconcile_timeout: Duration::from_secs(5),
            singleton_interval: Duration::from_millis(20),
            throttle_sample: Duration::from_millis(50),
            throttle: ThrottleConfig {
                min_delay_millis: 10,
                max_delay_millis: 20,
            },
            shutdown_grace: Duration::from_secs(2),
            launcher: Some(Launcher {
                program: std::path::PathBuf::from("/bin/true"),
                args: Vec::new(),
            }),
        }
    }

    struct CountingWorker(Arc<AtomicUsize>);

    #[async_trait]
    impl Worker for CountingWorker {
        async fn work(&self, _ctx: &AgentContext) -> Result<(), AgentError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                Err(AgentError::WorkerFailed("odd cycle".to_string()))
            } else {
                Ok(())
            }
        }

        fn register_commands(&self, _ctx: &Arc<AgentContext>, registry: &mut HandlerRegistry) {
            registry.register("ping", handler_fn(|_m: Envelope| async { Ok(json!("pong")) }));
        }

        fn required_commands(&self) -> Vec<&'static str> {
            vec!["ping"]
        }
    }

    struct PanickingWorker;

    #[async_trait]
    impl Worker for PanickingWorker {
        async fn work(&self, _ctx: &AgentContext) -> Result<(), AgentError> {
            panic!("worker exploded");
        }
    }

    struct MissingHandlerWorker;

    #[async_trait]
    impl Worker for MissingHandlerWorker {
        async fn work(&self, _ctx: &AgentContext) -> Result<(), AgentError> {
            Ok(())
        }

        fn required_commands(&self) -> Vec<&'static str> {
            vec!["inject"]
        }
    }

    #[tokio::test]
    async fn test_die_marker_stops_runtime() {
        let temp = TempDir::new().unwrap();
        let ctx = test_support::context(&temp, "w-1", "counter");
        let layout = ctx.layout().clone();
        let cycles = Arc::new(AtomicUsize::new(0));
        let runtime = AgentRuntime::with_worker(
            ctx,
            Arc::new(CountingWorker(cycles.clone())),
            WorkerRegistry::builtin(),
        )
        .with_options(fast_options());

        let handle = tokio::spawn(runtime.run_until(std::future::pending()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        layout.write_die_marker("w-1", "kill").unwrap();

        let reason = handle.await.unwrap().unwrap();
        assert_eq!(reason, ExitReason::DieMarker);
        // Failed cycles do not stop the loop.
        assert!(cycles.load(Ordering::SeqCst) >= 2);

        let beacons = HeartbeatMonitor::new(layout).read_beacons("w-1");
        assert!(beacons.iter().all(|(_, b)| b.status == BeaconStatus::Dead));
    }

    #[tokio::test]
    async fn test_worker_panic_is_fatal() {
        let temp = TempDir::new().unwrap();
        let ctx = test_support::context(&temp, "w-1", "boom");
        let runtime = AgentRuntime::with_worker(ctx, Arc::new(PanickingWorker), WorkerRegistry::builtin())
            .with_options(fast_options());

        let reason = runtime.run_until(std::future::pending()).await.unwrap();
        assert_eq!(reason, ExitReason::WorkerCrashed("worker exploded".to_string()));
        assert_ne!(reason.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_stop_future_ends_runtime() {
        let temp = TempDir::new().unwrap();
        let ctx = test_support::context(&temp, "w-1", "supervisor");
        let runtime = AgentRuntime::new(ctx, WorkerRegistry::builtin())
            .unwrap()
            .with_options(fast_options());

        let reason = runtime
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(reason, ExitReason::Signal);
    }

    #[tokio::test]
    async fn test_commands_are_served() {
        let temp = TempDir::new().unwrap();
        let ctx = test_support::context(&temp, "w-1", "counter");
        let delivery = ctx.fs_delivery().clone();
        let runtime = AgentRuntime::with_worker(
            ctx,
            Arc::new(CountingWorker(Arc::new(AtomicUsize::new(0)))),
            WorkerRegistry::builtin(),
        )
        .with_options(fast_options());
        let handle = tokio::spawn(runtime.run_until(tokio::time::sleep(Duration::from_millis(500))));

        delivery
            .deliver(
                "w-1",
                &Envelope::new("ping", Value::Null).with_reply_to("operator"),
                Channel::Command,
            )
            .await
            .unwrap();

        let mut answer = None;
        for _ in 0..40 {
            if let Some(reply) = delivery.receive("operator", Channel::Reflex).await.unwrap() {
                answer = Some(reply);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reply = answer.expect("command_result reflex");
        assert_eq!(reply.content["success"], json!(true));
        assert_eq!(reply.content["result"], json!("pong"));
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_missing_required_handler_fails_startup() {
        let temp = TempDir::new().unwrap();
        let ctx = test_support::context(&temp, "w-1", "strict");
        let runtime =
            AgentRuntime::with_worker(ctx, Arc::new(MissingHandlerWorker), WorkerRegistry::builtin());
        assert!(matches!(runtime.registries(), Err(AgentError::Bus(_))));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let temp = TempDir::new().unwrap();
        let ctx = test_support::context(&temp, "w-1", "no_such_type");
        assert!(matches!(
            AgentRuntime::new(ctx, WorkerRegistry::builtin()),
            Err(AgentError::UnknownWorker(_))
        ));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7u8)), "panic");
    }
}
