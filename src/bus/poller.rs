// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Inbox poller.
//!
//! One poller per (agent, channel). Each tick takes every waiting message
//! (removing it from the inbox first) and dispatches it to its registered
//! handler. Delivery is at-most-once and unordered: a message whose handler
//! fails or panics is gone, and nothing is retried.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, warn, Instrument};

use crate::error::BusError;
use crate::telemetry::{metrics, Counter, HandlerSpan};

use super::delivery::PacketDelivery;
use super::envelope::{Channel, Envelope};
use super::registry::HandlerRegistry;
use super::watcher::InboxWatcher;

/// Counts for one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub dispatched: usize,
    pub dropped: usize,
    pub malformed: usize,
    pub failed: usize,
}

impl PollStats {
    pub fn total(&self) -> usize {
        self.dispatched + self.dropped + self.malformed + self.failed
    }
}

enum Outcome {
    Dispatched,
    Dropped,
    Failed,
}

pub struct MessagePoller {
    agent_id: String,
    registry: Arc<HandlerRegistry>,
    delivery: Arc<dyn PacketDelivery>,
    interval: Duration,
    wake: Arc<Notify>,
    watch_dir: Option<PathBuf>,
}

impl MessagePoller {
    pub fn new(
        agent_id: impl Into<String>,
        registry: Arc<HandlerRegistry>,
        delivery: Arc<dyn PacketDelivery>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            registry,
            delivery,
            interval: Duration::from_secs(1),
            wake: Arc::new(Notify::new()),
            watch_dir: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Watch `dir` for new messages while running. The interval stays as
    /// the fallback when the watch cannot be set up.
    pub fn with_watch(mut self, dir: impl Into<PathBuf>) -> Self {
        self.watch_dir = Some(dir.into());
        self
    }

    pub fn channel(&self) -> Channel {
        self.registry.channel()
    }

    /// Notified to poll immediately instead of waiting for the interval.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Take and dispatch everything currently waiting.
    pub async fn poll_once(&self) -> PollStats {
        let mut stats = PollStats::default();
        let channel = self.channel();

        for received in self.delivery.receive_all(&self.agent_id, channel).await {
            match received {
                Ok(envelope) => match self.dispatch(envelope).await {
                    Outcome::Dispatched => stats.dispatched += 1,
                    Outcome::Dropped => stats.dropped += 1,
                    Outcome::Failed => stats.failed += 1,
                },
                Err(e @ BusError::Malformed { .. }) => {
                    warn!(agent_id = %self.agent_id, channel = %channel, error = %e, "Discarded malformed message");
                    metrics::incr(Counter::MessagesMalformed);
                    stats.malformed += 1;
                }
                Err(e) => {
                    debug!(agent_id = %self.agent_id, channel = %channel, error = %e, "Inbox not readable");
                }
            }
        }
        stats
    }

    async fn dispatch(&self, envelope: Envelope) -> Outcome {
        let channel = self.channel();
        let Some(handler) = self.registry.get(&envelope.kind) else {
            warn!(
                agent_id = %self.agent_id,
                channel = %channel,
                kind = %envelope.kind,
                "No handler registered, message dropped"
            );
            metrics::incr(Counter::MessagesDropped);
            let err = BusError::UnregisteredHandler {
                channel: channel.name(),
                name: envelope.kind.clone(),
            };
            self.reply(&envelope, &Err(err)).await;
            return Outcome::Dropped;
        };

        let span = HandlerSpan::start(channel.name(), &envelope.kind);
        let task = {
            let envelope = envelope.clone();
            tokio::spawn(async move { handler.handle(envelope).await }.instrument(span.span().clone()))
        };
        let result = match task.await {
            Ok(result) => result,
            Err(join) => Err(BusError::HandlerFailed(if join.is_panic() {
                "handler panicked".to_string()
            } else {
                join.to_string()
            })),
        };
        span.finish_with_result(&result);

        let outcome = match &result {
            Ok(_) => {
                metrics::incr(Counter::MessagesDispatched);
                Outcome::Dispatched
            }
            Err(e) => {
                error!(
                    agent_id = %self.agent_id,
                    channel = %channel,
                    kind = %envelope.kind,
                    error = %e,
                    "Message handler failed"
                );
                metrics::incr(Counter::MessagesFailed);
                Outcome::Failed
            }
        };
        self.reply(&envelope, &result).await;
        outcome
    }

    /// Answer a command that asked for a result. Reflexes are never answered.
    async fn reply(&self, envelope: &Envelope, result: &Result<Value, BusError>) {
        if self.channel() != Channel::Command {
            return;
        }
        let Some(target) = envelope.reply_to.as_deref() else {
            return;
        };
        if let Err(e) = self
            .delivery
            .deliver(target, &envelope.result(result), Channel::Reflex)
            .await
        {
            warn!(agent_id = %self.agent_id, target = %target, error = %e, "Failed to send command result");
        }
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let _watcher = self.watch_dir.as_deref().and_then(|dir| {
            InboxWatcher::watch(dir, self.wake.clone())
                .map_err(|e| {
                    warn!(agent_id = %self.agent_id, channel = %self.channel(), error = %e, "Inbox watch unavailable, polling on interval");
                })
                .ok()
        });
        loop {
            let stats = self.poll_once().await;
            if stats.total() > 0 {
                debug!(agent_id = %self.agent_id, channel = %self.channel(), ?stats, "Poll tick");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
