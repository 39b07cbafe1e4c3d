// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Termination jobs and their results.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::ResolvedConfig;
use crate::error::{ReaperError, TreeError};
use crate::tree::SupervisionTree;

/// One termination job. Created on demand, consumed once, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaperMission {
    /// Label used in logs and marker contents.
    pub name: String,
    /// Ids this mission may act on. Empty means unrestricted.
    pub targets: BTreeSet<String>,
    pub tombstone_comm: bool,
    pub tombstone_pod: bool,
    /// Remove die markers of targets confirmed dead.
    pub cleanup_die: bool,
    /// Remove pod directories of instances confirmed dead.
    pub reap_pods: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub sigterm_grace: Duration,
}

impl ReaperMission {
    pub fn new<I, S>(name: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            targets: targets.into_iter().map(Into::into).collect(),
            tombstone_comm: false,
            tombstone_pod: false,
            cleanup_die: false,
            reap_pods: true,
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            sigterm_grace: Duration::from_secs(3),
        }
    }

    /// A mission that acts on whatever it is offered.
    pub fn unrestricted(name: impl Into<String>) -> Self {
        Self::new(name, Vec::<String>::new())
    }

    /// Targets are `roots` plus every descendant of each.
    pub fn for_cascade(
        name: impl Into<String>,
        tree: &SupervisionTree,
        roots: &[String],
    ) -> Result<Self, ReaperError> {
        if let Some(missing) = roots.iter().find(|id| !tree.contains(id)) {
            return Err(TreeError::NodeNotFound(missing.clone()).into());
        }
        Ok(Self::new(name, tree.cascade_all(roots)))
    }

    /// Timing from configuration.
    pub fn with_settings(mut self, settings: &ResolvedConfig) -> Self {
        self.timeout = settings.reaper_timeout();
        self.poll_interval = settings.reaper_poll_interval();
        self.sigterm_grace = settings.sigterm_grace();
        self
    }

    pub fn with_tombstones(mut self, comm: bool, pod: bool) -> Self {
        self.tombstone_comm = comm;
        self.tombstone_pod = pod;
        self
    }

    pub fn with_cleanup_die(mut self, cleanup: bool) -> Self {
        self.cleanup_die = cleanup;
        self
    }

    pub fn with_reap_pods(mut self, reap: bool) -> Self {
        self.reap_pods = reap;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_sigterm_grace(mut self, grace: Duration) -> Self {
        self.sigterm_grace = grace;
        self
    }

    pub fn is_unrestricted(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn in_scope(&self, id: &str) -> bool {
        self.is_unrestricted() || self.targets.contains(id)
    }

    pub fn ensure_in_scope(&self, id: &str) -> Result<(), ReaperError> {
        if self.in_scope(id) {
            Ok(())
        } else {
            Err(ReaperError::OutOfScope(id.to_string()))
        }
    }
}

/// States a mission moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaperPhase {
    TargetLocked,
    DieSignaled,
    AwaitingGracefulExit,
    ConfirmedDead,
    Escalating,
    Terminated,
}

impl fmt::Display for ReaperPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaperPhase::TargetLocked => "target_locked",
            ReaperPhase::DieSignaled => "die_signaled",
            ReaperPhase::AwaitingGracefulExit => "awaiting_graceful_exit",
            ReaperPhase::ConfirmedDead => "confirmed_dead",
            ReaperPhase::Escalating => "escalating",
            ReaperPhase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How one runtime instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPath {
    /// Not running when the mission started.
    AlreadyGone,
    /// Exited on its die marker within the timeout.
    Graceful,
    /// Exited after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
    /// Still running after SIGKILL.
    Survived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceOutcome {
    pub id: String,
    pub instance_id: String,
    pub pid: u32,
    pub exit: ExitPath,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReaperReport {
    pub mission: String,
    /// Ids acted on, in the order offered.
    pub targets: Vec<String>,
    /// Offered ids outside the mission scope. Nothing was done to them.
    pub refused: Vec<String>,
    pub instances: Vec<InstanceOutcome>,
    pub phases: Vec<ReaperPhase>,
}

impl ReaperReport {
    /// No instance outlived the mission.
    pub fn is_complete(&self) -> bool {
        self.survivors().is_empty()
    }

    pub fn survivors(&self) -> Vec<&InstanceOutcome> {
        self.instances
            .iter()
            .filter(|i| i.exit == ExitPath::Survived)
            .collect()
    }

    pub fn count(&self, exit: ExitPath) -> usize {
        self.instances.iter().filter(|i| i.exit == exit).count()
    }

    pub fn escalated(&self) -> bool {
        self.phases.contains(&ReaperPhase::Escalating)
    }
}
