// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reading side of the heartbeat.

use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::comm::{is_temp_name, CommLayout};
use crate::spawn::read_boot_records;

use super::{Beacon, BeaconStatus, Liveness, BEACON_EXT};

/// Aggregated liveness of one logical agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentLiveness {
    pub id: String,
    /// Best classification over all beacons, `None` when nothing was ever written.
    pub liveness: Option<Liveness>,
    /// Age of the freshest alive beacon.
    #[serde(with = "opt_secs")]
    pub age: Option<Duration>,
    pub beacons: usize,
}

mod opt_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }
}

/// Read-only view over every agent's beacons.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    layout: CommLayout,
}

impl HeartbeatMonitor {
    pub fn new(layout: CommLayout) -> Self {
        Self { layout }
    }

    /// All readable beacons of `id`, keyed by task name.
    ///
    /// Unreadable or half-written files are skipped.
    pub fn read_beacons(&self, id: &str) -> Vec<(String, Beacon)> {
        let dir = self.layout.hello_dir(id);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut beacons = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if is_temp_name(name) {
                continue;
            }
            let Some(task) = name.strip_suffix(&format!(".{}", BEACON_EXT)) else {
                continue;
            };
            match fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice::<Beacon>(&b).map_err(|e| e.to_string()))
            {
                Ok(beacon) => beacons.push((task.to_string(), beacon)),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable beacon"),
            }
        }
        beacons.sort_by(|a, b| a.0.cmp(&b.0));
        beacons
    }

    /// Age of the freshest beacon reporting `alive`.
    pub fn freshest_age(&self, id: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.read_beacons(id)
            .iter()
            .filter(|(_, b)| b.status == BeaconStatus::Alive)
            .map(|(_, b)| b.age(now))
            .min()
    }

    /// Whether `id` has an alive beacon younger than `threshold`.
    pub fn is_recently_alive(&self, id: &str, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.freshest_age(id, now)
            .map(|age| age < threshold)
            .unwrap_or(false)
    }

    pub fn liveness(&self, id: &str, now: DateTime<Utc>) -> AgentLiveness {
        let beacons = self.read_beacons(id);
        let liveness = beacons
            .iter()
            .filter(|(_, b)| b.status != BeaconStatus::Unused)
            .map(|(_, b)| b.classify(now))
            .min();
        let age = beacons
            .iter()
            .filter(|(_, b)| b.status == BeaconStatus::Alive)
            .map(|(_, b)| b.age(now))
            .min();
        AgentLiveness {
            id: id.to_string(),
            liveness,
            age,
            beacons: beacons.len(),
        }
    }

    /// Liveness of several agents, in the given order.
    pub fn liveness_table<I, S>(&self, ids: I, now: DateTime<Utc>) -> Vec<AgentLiveness>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ids.into_iter()
            .map(|id| self.liveness(id.as_ref(), now))
            .collect()
    }

    /// Ids that own a comm channel but appear in no runtime instance boot record.
    pub fn phantoms(&self) -> Vec<String> {
        let booted: HashSet<String> = read_boot_records(&self.layout)
            .into_iter()
            .map(|record| record.id)
            .collect();
        self.layout
            .list_channel_ids()
            .into_iter()
            .filter(|id| !booted.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{atomic_write_json, temp_path_for};
    use crate::spawn::BootRecord;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CommLayout, HeartbeatMonitor) {
        let temp = TempDir::new().unwrap();
        let layout = CommLayout::new(temp.path().join("comm"), temp.path().join("pod"), "matrix");
        let monitor = HeartbeatMonitor::new(layout.clone());
        (temp, layout, monitor)
    }

    fn write_beacon(layout: &CommLayout, id: &str, task: &str, status: BeaconStatus, age_secs: i64) {
        let beacon = Beacon {
            status,
            last_seen: Utc::now() - ChronoDuration::seconds(age_secs),
            timeout: 30,
            error: None,
        };
        atomic_write_json(&layout.hello_dir(id).join(format!("{}.json", task)), &beacon).unwrap();
    }

    #[test]
    fn test_no_beacons() {
        let (_temp, _layout, monitor) = setup();
        let now = Utc::now();
        assert!(monitor.freshest_age("ghost", now).is_none());
        assert!(!monitor.is_recently_alive("ghost", Duration::from_secs(60), now));
        assert_eq!(monitor.liveness("ghost", now).liveness, None);
    }

    #[test]
    fn test_freshest_alive_beacon_wins() {
        let (_temp, layout, monitor) = setup();
        write_beacon(&layout, "a", "main", BeaconStatus::Alive, 100);
        write_beacon(&layout, "a", "worker", BeaconStatus::Alive, 5);
        write_beacon(&layout, "a", "old", BeaconStatus::Dead, 0);

        let now = Utc::now();
        let age = monitor.freshest_age("a", now).unwrap();
        assert!(age >= Duration::from_secs(5) && age < Duration::from_secs(10));
        assert!(monitor.is_recently_alive("a", Duration::from_secs(60), now));

        let liveness = monitor.liveness("a", now);
        assert_eq!(liveness.liveness, Some(Liveness::Alive));
        assert_eq!(liveness.beacons, 3);
    }

    #[test]
    fn test_garbage_and_temp_files_ignored() {
        let (_temp, layout, monitor) = setup();
        fs::create_dir_all(layout.hello_dir("a")).unwrap();
        fs::write(layout.hello_dir("a").join("main.json"), b"{ half").unwrap();
        let in_flight = serde_json::to_vec(&Beacon::alive(std::time::Duration::from_secs(30))).unwrap();
        fs::write(temp_path_for(&layout.hello_dir("a").join("main.json")), in_flight).unwrap();
        assert!(monitor.read_beacons("a").is_empty());
    }

    #[test]
    fn test_dot_named_task_is_read() {
        let (_temp, layout, monitor) = setup();
        write_beacon(&layout, "a", ".sidecar", BeaconStatus::Alive, 1);
        let beacons = monitor.read_beacons("a");
        assert_eq!(beacons.len(), 1);
        assert_eq!(beacons[0].0, ".sidecar");
    }

    #[test]
    fn test_phantoms() {
        let (_temp, layout, monitor) = setup();
        layout.ensure_channel("booted").unwrap();
        layout.ensure_channel("phantom").unwrap();
        let record = BootRecord {
            id: "booted".to_string(),
            instance_id: "booted-1".to_string(),
            agent_type: "worker".to_string(),
            pid: 4242,
            launch_command: vec!["/pod/booted-1/booted".to_string()],
            boot_time: Utc::now(),
        };
        atomic_write_json(&layout.boot_record("booted-1"), &record).unwrap();

        assert_eq!(monitor.phantoms(), vec!["phantom".to_string()]);
    }
}
