// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Emitting side of the heartbeat.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::comm::{atomic_write_json, CommLayout};
use crate::error::CommError;

use super::{Beacon, BEACON_EXT};

/// Writes the beacon of one task on a fixed interval.
#[derive(Debug, Clone)]
pub struct HeartbeatEmitter {
    layout: CommLayout,
    agent_id: String,
    task: String,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatEmitter {
    pub fn new(layout: CommLayout, agent_id: impl Into<String>) -> Self {
        Self {
            layout,
            agent_id: agent_id.into(),
            task: "main".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn beacon_path(&self) -> PathBuf {
        self.layout
            .hello_dir(&self.agent_id)
            .join(format!("{}.{}", self.task, BEACON_EXT))
    }

    /// Write one alive beacon.
    pub fn beat(&self) -> Result<(), CommError> {
        atomic_write_json(&self.beacon_path(), &Beacon::alive(self.timeout))
    }

    /// Record that the task stopped.
    pub fn mark_dead(&self, reason: &str) -> Result<(), CommError> {
        atomic_write_json(&self.beacon_path(), &Beacon::dead(self.timeout, reason))
    }

    /// Beat until `shutdown` flips to true, then mark the beacon dead.
    ///
    /// Write failures are logged and never stop the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.beat() {
                        Ok(()) => debug!(agent_id = %self.agent_id, task = %self.task, "Heartbeat"),
                        Err(e) => warn!(agent_id = %self.agent_id, error = %e, "Heartbeat write failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.mark_dead("shutdown") {
            warn!(agent_id = %self.agent_id, error = %e, "Failed to write final beacon");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::read_json;
    use crate::heartbeat::{BeaconStatus, Liveness};
    use chrono::Utc;
    use tempfile::TempDir;

    fn emitter(temp: &TempDir) -> HeartbeatEmitter {
        let layout = CommLayout::new(temp.path().join("comm"), temp.path().join("pod"), "matrix");
        HeartbeatEmitter::new(layout, "watchdog-1")
            .with_interval(Duration::from_millis(10))
            .with_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_beat_writes_alive_beacon() {
        let temp = TempDir::new().unwrap();
        let emitter = emitter(&temp);
        emitter.beat().unwrap();

        let beacon: Beacon = read_json(&emitter.beacon_path()).unwrap().unwrap();
        assert_eq!(beacon.status, BeaconStatus::Alive);
        assert_eq!(beacon.timeout, 5);
        assert_eq!(beacon.classify(Utc::now()), Liveness::Alive);
    }

    #[tokio::test]
    async fn test_run_marks_dead_on_shutdown() {
        let temp = TempDir::new().unwrap();
        let emitter = emitter(&temp);
        let path = emitter.beacon_path();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(emitter.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(path.exists());

        tx.send(true).unwrap();
        handle.await.unwrap();

        let beacon: Beacon = read_json(&path).unwrap().unwrap();
        assert_eq!(beacon.status, BeaconStatus::Dead);
        assert_eq!(beacon.error.as_deref(), Some("shutdown"));
    }
}
