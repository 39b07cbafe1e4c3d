// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Heartbeat beacons.
//!
//! Every running agent writes one small JSON record per monitored task into
//! `<comm_root>/<id>/hello.moto/<task>.json`. Everyone else only reads them.
//!
//! A beacon is classified at read time from its age:
//!
//! | age                  | [`Liveness`] |
//! |----------------------|--------------|
//! | status `dead`        | `Dead`       |
//! | `age > 2 * timeout`  | `Expired`    |
//! | `age > timeout`      | `Stale`      |
//! | otherwise            | `Alive`      |

mod emitter;
mod monitor;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use emitter::HeartbeatEmitter;
pub use monitor::{AgentLiveness, HeartbeatMonitor};

/// Extension of beacon files.
pub const BEACON_EXT: &str = "json";

/// Self-reported state of a monitored task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeaconStatus {
    Alive,
    Dead,
    /// The task exists but is intentionally idle; ignored by liveness checks.
    Unused,
}

/// One liveness record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub status: BeaconStatus,
    pub last_seen: DateTime<Utc>,
    /// Seconds after which the beacon counts as stale.
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Read-time classification of a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Alive,
    Stale,
    Expired,
    Dead,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Liveness::Alive => "alive",
            Liveness::Stale => "stale",
            Liveness::Expired => "expired",
            Liveness::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl Beacon {
    pub fn alive(timeout: Duration) -> Self {
        Self {
            status: BeaconStatus::Alive,
            last_seen: Utc::now(),
            timeout: timeout.as_secs(),
            error: None,
        }
    }

    pub fn dead(timeout: Duration, error: impl Into<String>) -> Self {
        Self {
            status: BeaconStatus::Dead,
            last_seen: Utc::now(),
            timeout: timeout.as_secs(),
            error: Some(error.into()),
        }
    }

    /// Age at `now`. Beacons from the future count as age zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn classify(&self, now: DateTime<Utc>) -> Liveness {
        if self.status == BeaconStatus::Dead {
            return Liveness::Dead;
        }
        let age = self.age(now);
        let timeout = Duration::from_secs(self.timeout);
        // Beacons come from other processes; the timeout field is untrusted.
        if age > timeout.saturating_mul(2) {
            Liveness::Expired
        } else if age > timeout {
            Liveness::Stale
        } else {
            Liveness::Alive
        }
    }
}
