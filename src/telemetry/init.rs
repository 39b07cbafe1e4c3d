// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subscriber initialisation.
//!
//! Every process installs exactly one subscriber writing to stderr. What it
//! looks like depends on the role of the process:
//!
//! | role           | level | ansi | notes |
//! |----------------|-------|------|-------|
//! | `Operator`     | warn  | yes  | one-shot CLI commands |
//! | `Orchestrator` | info  | yes  | `swarmer boot` in the foreground |
//! | `Agent`        | info  | no   | stderr is redirected into `<comm>/<id>/logs/stderr.log` |
//!
//! `RUST_LOG` always wins over the configured level or directive.

use std::io;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// What kind of process is logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Operator,
    Orchestrator,
    Agent,
}

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub role: ProcessRole,
    /// Level used when neither `RUST_LOG` nor `directive` is set.
    pub level: Level,
    /// Filter directive, e.g. `swarmer::reaper=debug`.
    pub directive: Option<String>,
    /// Log span enter/exit (reconcile ticks, reaper runs, handler spans).
    pub span_events: bool,
    pub source_location: bool,
    pub show_target: bool,
    pub ansi: bool,
    pub compact: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::for_role(ProcessRole::Operator)
    }
}

impl TelemetryConfig {
    pub fn for_role(role: ProcessRole) -> Self {
        let (level, ansi) = match role {
            ProcessRole::Operator => (Level::WARN, true),
            ProcessRole::Orchestrator => (Level::INFO, true),
            ProcessRole::Agent => (Level::INFO, false),
        };
        Self {
            role,
            level,
            directive: None,
            span_events: false,
            source_location: false,
            show_target: role != ProcessRole::Operator,
            ansi,
            compact: true,
        }
    }

    /// Preset for a spawned agent process.
    pub fn agent() -> Self {
        Self::for_role(ProcessRole::Agent)
    }

    /// Debug level with span events and source locations.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            span_events: true,
            source_location: true,
            compact: false,
            ..Self::for_role(ProcessRole::Orchestrator)
        }
    }

    /// Warnings only, no colors, no targets.
    pub fn production() -> Self {
        Self {
            level: Level::WARN,
            show_target: false,
            ansi: false,
            ..Self::for_role(ProcessRole::Orchestrator)
        }
    }

    /// Everything from this crate, uncolored.
    pub fn testing() -> Self {
        Self {
            level: Level::TRACE,
            directive: Some("swarmer=trace".to_string()),
            span_events: true,
            source_location: true,
            ansi: false,
            compact: false,
            ..Self::for_role(ProcessRole::Agent)
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Raise the level for `-v` (info) or `--debug` (debug). Never lowers it.
    pub fn with_verbosity(self, verbose: bool, debug: bool) -> Self {
        let wanted = if debug {
            Level::DEBUG
        } else if verbose {
            Level::INFO
        } else {
            return self;
        };
        // Level ordering: TRACE > DEBUG > INFO > WARN > ERROR
        if wanted > self.level {
            self.with_level(wanted)
        } else {
            self
        }
    }

    pub fn with_filter(mut self, directive: impl Into<String>) -> Self {
        self.directive = Some(directive.into());
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| match &self.directive {
                Some(directive) => EnvFilter::try_new(directive),
                None => EnvFilter::try_new(self.level.to_string()),
            })
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }
}

/// Keep alive for the lifetime of the process.
pub struct TelemetryGuard {
    role: ProcessRole,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::debug!(role = ?self.role, "Telemetry shut down");
    }
}

/// Install the process-wide subscriber.
///
/// Fails if a subscriber is already installed.
///
/// # Example
///
/// ```rust,ignore
/// use swarmer::telemetry::{init_telemetry, TelemetryConfig};
///
/// let _guard = init_telemetry(&TelemetryConfig::agent())?;
/// ```
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let span_events = if config.span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi)
        .with_target(config.show_target)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(span_events);

    let registry = tracing_subscriber::registry().with(config.filter());
    let installed = if config.compact {
        registry.with(fmt_layer.compact()).try_init()
    } else {
        registry.with(fmt_layer).try_init()
    };
    installed.map_err(|e| io::Error::other(e.to_string()))?;

    Ok(TelemetryGuard { role: config.role })
}
