// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Load-based worker cadence.

use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::config::ThrottleConfig;

/// Maps the host's load average onto the configured delay band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttle {
    min: Duration,
    max: Duration,
    cpus: f64,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_cpus(config, cpus)
    }

    pub fn with_cpus(config: ThrottleConfig, cpus: usize) -> Self {
        Self {
            min: config.min_delay(),
            max: config.max_delay(),
            cpus: cpus.max(1) as f64,
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.min
    }

    /// Delay for a 1-minute load average of `load`.
    ///
    /// Idle maps to the minimum, one runnable task per CPU or more to the
    /// maximum, linearly in between.
    pub fn delay_for(&self, load: f64) -> Duration {
        let pressure = if load.is_finite() {
            (load / self.cpus).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.min + (self.max - self.min).mul_f64(pressure)
    }

    /// Delay for the current host load; the minimum if it cannot be read.
    pub fn current_delay(&self) -> Duration {
        read_loadavg()
            .map(|load| self.delay_for(load))
            .unwrap_or(self.min)
    }

    /// Publish the current delay every `every` until `shutdown`.
    pub async fn run(
        self,
        delay: watch::Sender<Duration>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let next = self.current_delay();
            delay.send_if_modified(|current| {
                if *current != next {
                    debug!(delay_ms = next.as_millis() as u64, "Worker delay adjusted");
                    *current = next;
                    true
                } else {
                    false
                }
            });
            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// 1-minute load average from `/proc/loadavg`.
pub fn read_loadavg() -> Option<f64> {
    let text = std::fs::read_to_string("/proc/loadavg").ok()?;
    parse_loadavg(&text)
}

fn parse_loadavg(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}
