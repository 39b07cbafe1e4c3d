// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Span helpers for consistent instrumentation.

use std::time::Instant;
use tracing::{info_span, Span};

/// RAII guard for timing one message handler invocation.
///
/// Records the channel, message type, duration and outcome to metrics.
pub struct HandlerSpan {
    channel: &'static str,
    kind: String,
    start: Instant,
    span: Span,
}

impl HandlerSpan {
    pub fn start(channel: &'static str, kind: &str) -> Self {
        let span = info_span!(
            "handler",
            channel = channel,
            kind = %kind,
            duration_ms = tracing::field::Empty,
            success = tracing::field::Empty,
        );

        Self {
            channel,
            kind: kind.to_string(),
            start: Instant::now(),
            span,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Finish the span, recording duration and success.
    pub fn finish(self, success: bool) {
        let duration = self.start.elapsed();
        self.span.record("duration_ms", duration.as_secs_f64() * 1000.0);
        self.span.record("success", success);

        super::metrics::GLOBAL_METRICS.record_handler(self.channel, &self.kind, duration, success);
    }

    pub fn finish_with_result<T, E>(self, result: &Result<T, E>) {
        self.finish(result.is_ok());
    }
}

/// RAII guard for timing any operation.
///
/// Records the operation name and duration to metrics when finished or
/// dropped, whichever comes first.
pub struct TimedOperation {
    name: String,
    start: Instant,
    span: Span,
    recorded: bool,
}

impl TimedOperation {
    pub fn start(name: &str) -> Self {
        let span = info_span!(
            "operation",
            op = %name,
            duration_ms = tracing::field::Empty,
        );

        Self {
            name: name.to_string(),
            start: Instant::now(),
            span,
            recorded: false,
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Finish and record the operation.
    pub fn finish(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let duration = self.start.elapsed();
        self.span.record("duration_ms", duration.as_secs_f64() * 1000.0);
        super::metrics::GLOBAL_METRICS.record_operation(&self.name, duration);
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        self.record();
    }
}

/// Macro for timing an operation.
///
/// # Example
///
/// ```rust,ignore
/// use swarmer::timed;
///
/// fn save_snapshot() {
///     let _timer = timed!("snapshot_save");
///     // ... work happens ...
/// } // Timer records on drop
/// ```
#[macro_export]
macro_rules! timed {
    ($name:expr) => {
        $crate::telemetry::TimedOperation::start($name)
    };
}
