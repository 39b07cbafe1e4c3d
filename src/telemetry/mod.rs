// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry, tracing, and metrics infrastructure.
//!
//! - **Tracing**: structured logging through `tracing`, initialised once per
//!   process with [`init_telemetry`]. Logs go to stderr; spawned agents have
//!   stderr redirected into their comm channel.
//! - **Metrics**: per-process counters for spawns, messages and signals, plus
//!   latency histograms for named operations.
//!
//! # Usage
//!
//! ```rust,ignore
//! use swarmer::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! Time an operation into the registry:
//!
//! ```rust,ignore
//! let _timer = swarmer::timed!("reconcile");
//! ```

mod init;
pub mod metrics;
pub mod spans;

pub use init::{init_telemetry, ProcessRole, TelemetryConfig, TelemetryGuard};
pub use metrics::{
    Counter, HandlerMetrics, Histogram, Metrics, MetricsSnapshot, OperationMetrics,
    GLOBAL_METRICS,
};
pub use spans::{HandlerSpan, TimedOperation};
