// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent runtime types and configuration.

use std::fmt;
use std::time::Duration;

use crate::config::{ResolvedConfig, ThrottleConfig};
use crate::spawn::Launcher;

/// Why an agent process stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Die marker found in the inbox.
    DieMarker,
    /// A younger live instance of the same logical id exists.
    Superseded(String),
    /// The worker task panicked.
    WorkerCrashed(String),
    /// The worker loop ended on its own.
    WorkerStopped,
    /// SIGTERM or Ctrl-C.
    Signal,
}

impl ExitReason {
    /// Process exit status for this reason.
    ///
    /// Cooperative exits are 0. A crashed or vanished worker is non-zero so
    /// the failure is visible to whoever launched the process.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DieMarker | Self::Superseded(_) | Self::Signal => 0,
            Self::WorkerCrashed(_) => 70,
            Self::WorkerStopped => 71,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.exit_code() != 0
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DieMarker => write!(f, "die marker"),
            Self::Superseded(younger) => write!(f, "superseded by {}", younger),
            Self::WorkerCrashed(message) => write!(f, "worker crashed: {}", message),
            Self::WorkerStopped => write!(f, "worker stopped"),
            Self::Signal => write!(f, "signal"),
        }
    }
}

/// Timing of the runtime's task set.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Beacon write interval.
    pub heartbeat_interval: Duration,
    /// `timeout` written into each beacon.
    pub beacon_timeout: Duration,
    /// Inbox poll fallback.
    pub bus_poll_interval: Duration,
    /// Wake pollers on file-change notifications.
    pub watch_inboxes: bool,
    pub reconcile_interval: Duration,
    pub reconcile_timeout: Duration,
    /// Die marker and duplicate instance check interval.
    pub singleton_interval: Duration,
    /// How often the load average is sampled.
    pub throttle_sample: Duration,
    pub throttle: ThrottleConfig,
    /// How long stopped tasks get to finish before the process exits anyway.
    pub shutdown_grace: Duration,
    /// Program children are launched with. `None` means the running binary.
    pub launcher: Option<Launcher>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self::from_settings(&ResolvedConfig::default())
    }
}

impl RuntimeOptions {
    pub fn from_settings(settings: &ResolvedConfig) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval(),
            beacon_timeout: settings.beacon_timeout(),
            bus_poll_interval: settings.bus_poll_interval(),
            watch_inboxes: settings.watch_inboxes,
            reconcile_interval: settings.reconcile_interval(),
            reconcile_timeout: settings.reconcile_timeout(),
            singleton_interval: Duration::from_secs(1),
            throttle_sample: Duration::from_secs(5),
            throttle: settings.throttle,
            shutdown_grace: Duration::from_secs(5),
            launcher: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = Some(launcher);
        self
    }
}
