// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One live instance per logical id.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::warn;

use crate::comm::CommLayout;
use crate::reaper::{is_running, ProcessTable};
use crate::spawn::boot_records_for;

use super::ExitReason;

/// Watches for the two conditions that end an instance cooperatively.
pub struct SingletonGuard {
    layout: CommLayout,
    id: String,
    instance_id: String,
    boot_time: DateTime<Utc>,
    processes: Arc<dyn ProcessTable>,
    interval: Duration,
}

impl SingletonGuard {
    pub fn new(
        layout: CommLayout,
        id: impl Into<String>,
        instance_id: impl Into<String>,
        boot_time: DateTime<Utc>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            layout,
            id: id.into(),
            instance_id: instance_id.into(),
            boot_time,
            processes,
            interval: Duration::from_secs(1),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The reason this instance must stop now, if any.
    pub fn check(&self) -> Option<ExitReason> {
        if self.layout.has_die_marker(&self.id) {
            return Some(ExitReason::DieMarker);
        }
        boot_records_for(&self.layout, &self.id)
            .into_iter()
            .filter(|r| r.instance_id != self.instance_id && r.boot_time > self.boot_time)
            .find(|r| is_running(self.processes.as_ref(), r.pid, &r.launch_command))
            .map(|r| {
                warn!(
                    agent_id = %self.id,
                    younger = %r.instance_id,
                    pid = r.pid,
                    "Younger instance is live, yielding"
                );
                ExitReason::Superseded(r.instance_id)
            })
    }

    /// Check on every interval; resolves with the first exit reason found.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Option<ExitReason> {
        loop {
            if let Some(reason) = self.check() {
                return Some(reason);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
            }
        }
    }
}
