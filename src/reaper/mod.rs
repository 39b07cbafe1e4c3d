// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Termination protocol.
//!
//! ```text
//!  TargetLocked ─▶ DieSignaled ─▶ AwaitingGracefulExit ─┬─▶ ConfirmedDead ─▶ Terminated
//!                                                       └─▶ Escalating ────▶ Terminated
//! ```
//!
//! Locking the targets in the tree is the caller's job (see
//! [`crate::tree::SupervisionTree::lock_for_termination`]); the reaper only
//! touches the filesystem and the process table. Survivors of the graceful
//! window get SIGTERM, then SIGKILL after a grace period.

mod mission;
mod process;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::comm::CommLayout;
use crate::spawn::{boot_records_for, latest_receipt, BootRecord};
use crate::telemetry::{metrics, Counter};

pub use mission::{ExitPath, InstanceOutcome, ReaperMission, ReaperPhase, ReaperReport};
pub use process::{command_matches, is_running, LinuxProcessTable, ProcessTable, Signal};

#[cfg(test)]
pub use process::MockProcessTable;

/// Runs [`ReaperMission`]s against one comm layout.
#[derive(Clone)]
pub struct Reaper {
    layout: CommLayout,
    processes: Arc<dyn ProcessTable>,
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper").field("layout", &self.layout).finish()
    }
}

/// An instance being tracked through the mission.
struct Tracked {
    record: BootRecord,
    exit: Option<ExitPath>,
}

impl Tracked {
    fn pending(&self) -> bool {
        self.exit.is_none()
    }
}

impl Reaper {
    pub fn new(layout: CommLayout, processes: Arc<dyn ProcessTable>) -> Self {
        Self { layout, processes }
    }

    /// Reaper over the host's real process table.
    pub fn local(layout: CommLayout) -> Self {
        Self::new(layout, Arc::new(LinuxProcessTable))
    }

    pub fn layout(&self) -> &CommLayout {
        &self.layout
    }

    /// Run a mission over its own target set.
    pub async fn run(&self, mission: &ReaperMission) -> ReaperReport {
        let targets: Vec<String> = mission.targets.iter().cloned().collect();
        self.run_on(mission, targets).await
    }

    /// Run a mission over `offered` ids. Ids outside the mission scope are
    /// refused and left untouched.
    #[instrument(skip(self, mission, offered), fields(mission = %mission.name))]
    pub async fn run_on<I, S>(&self, mission: &ReaperMission, offered: I) -> ReaperReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut report = ReaperReport {
            mission: mission.name.clone(),
            ..Default::default()
        };

        let mut seen = BTreeSet::new();
        for id in offered.into_iter().map(Into::into) {
            if !seen.insert(id.clone()) {
                continue;
            }
            match mission.ensure_in_scope(&id) {
                Ok(()) => report.targets.push(id),
                Err(e) => {
                    warn!(agent_id = %id, error = %e, "Refusing out-of-scope target");
                    report.refused.push(id);
                }
            }
        }
        self.enter(&mut report, ReaperPhase::TargetLocked);

        let mut tracked = Vec::new();
        for id in &report.targets {
            self.signal_die(mission, id);
            for record in self.instances_of(id) {
                if mission.tombstone_pod && self.layout.pod_dir(&record.instance_id).is_dir() {
                    if let Err(e) = self.layout.write_pod_tombstone(&record.instance_id, &mission.name) {
                        warn!(instance_id = %record.instance_id, error = %e, "Failed to write pod tombstone");
                    }
                }
                let exit = (!self.alive(&record)).then_some(ExitPath::AlreadyGone);
                tracked.push(Tracked { record, exit });
            }
        }
        self.enter(&mut report, ReaperPhase::DieSignaled);

        self.enter(&mut report, ReaperPhase::AwaitingGracefulExit);
        let deadline = Instant::now() + mission.timeout;
        loop {
            self.sweep(&mut tracked, ExitPath::Graceful);
            if !tracked.iter().any(Tracked::pending) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(mission.poll_interval.min(deadline - now)).await;
        }

        if tracked.iter().any(Tracked::pending) {
            self.enter(&mut report, ReaperPhase::Escalating);
            self.escalate(mission, &mut tracked).await;
        } else {
            self.enter(&mut report, ReaperPhase::ConfirmedDead);
        }

        self.clean_up(mission, &report.targets, &tracked);
        report.instances = tracked
            .into_iter()
            .map(|t| InstanceOutcome {
                id: t.record.id,
                instance_id: t.record.instance_id,
                pid: t.record.pid,
                exit: t.exit.unwrap_or(ExitPath::Survived),
            })
            .collect();
        self.enter(&mut report, ReaperPhase::Terminated);

        if report.is_complete() {
            info!(
                targets = report.targets.len(),
                instances = report.instances.len(),
                "Mission complete"
            );
        } else {
            warn!(survivors = report.survivors().len(), "Mission left survivors");
        }
        report
    }

    fn enter(&self, report: &mut ReaperReport, phase: ReaperPhase) {
        debug!(mission = %report.mission, phase = %phase, "Reaper phase");
        report.phases.push(phase);
    }

    fn signal_die(&self, mission: &ReaperMission, id: &str) {
        match self.layout.write_die_marker(id, &mission.name) {
            Ok(()) => metrics::incr(Counter::DieMarkers),
            Err(e) => warn!(agent_id = %id, error = %e, "Failed to write die marker"),
        }
        if mission.tombstone_comm {
            if let Err(e) = self.layout.write_tombstone(id, &mission.name) {
                warn!(agent_id = %id, error = %e, "Failed to write tombstone");
            }
        }
    }

    /// Boot records of `id`, plus the latest receipt when its pod is gone.
    fn instances_of(&self, id: &str) -> Vec<BootRecord> {
        let mut records = boot_records_for(&self.layout, id);
        if let Some(receipt) = latest_receipt(&self.layout, id) {
            if !records.iter().any(|r| r.instance_id == receipt.instance_id) {
                records.push(BootRecord::from(&receipt));
            }
        }
        records
    }

    fn alive(&self, record: &BootRecord) -> bool {
        is_running(self.processes.as_ref(), record.pid, &record.launch_command)
    }

    /// Mark every pending instance that has exited with `exit`.
    fn sweep(&self, tracked: &mut [Tracked], exit: ExitPath) {
        for t in tracked.iter_mut().filter(|t| t.pending()) {
            if !self.alive(&t.record) {
                debug!(instance_id = %t.record.instance_id, pid = t.record.pid, ?exit, "Instance exited");
                t.exit = Some(exit);
            }
        }
    }

    async fn escalate(&self, mission: &ReaperMission, tracked: &mut [Tracked]) {
        self.send_to_pending(tracked, Signal::Term);
        sleep(mission.sigterm_grace).await;
        self.sweep(tracked, ExitPath::Terminated);
        if !tracked.iter().any(Tracked::pending) {
            return;
        }

        self.send_to_pending(tracked, Signal::Kill);
        sleep(mission.poll_interval).await;
        self.sweep(tracked, ExitPath::Killed);
    }

    fn send_to_pending(&self, tracked: &[Tracked], signal: Signal) {
        for t in tracked.iter().filter(|t| t.pending()) {
            // Re-check identity right before signalling; the pid may have been recycled.
            if !self.alive(&t.record) {
                continue;
            }
            match self.processes.signal(t.record.pid, signal) {
                Ok(()) => {
                    metrics::incr(match signal {
                        Signal::Term => Counter::Sigterms,
                        Signal::Kill => Counter::Sigkills,
                    });
                    warn!(
                        agent_id = %t.record.id,
                        instance_id = %t.record.instance_id,
                        pid = t.record.pid,
                        signal = %signal,
                        "Escalating termination"
                    );
                }
                Err(e) => warn!(instance_id = %t.record.instance_id, error = %e, "Signal failed"),
            }
        }
    }

    fn clean_up(&self, mission: &ReaperMission, targets: &[String], tracked: &[Tracked]) {
        if mission.reap_pods {
            for t in tracked.iter().filter(|t| !t.pending()) {
                if let Err(e) = self.layout.remove_pod(&t.record.instance_id) {
                    warn!(instance_id = %t.record.instance_id, error = %e, "Failed to remove pod");
                }
            }
        }
        if mission.cleanup_die {
            for id in targets {
                let survived = tracked.iter().any(|t| t.pending() && &t.record.id == id);
                if !survived {
                    if let Err(e) = self.layout.clear_die_marker(id) {
                        warn!(agent_id = %id, error = %e, "Failed to clear die marker");
                    }
                }
            }
        }
    }
}
