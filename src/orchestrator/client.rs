// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command client for processes outside the tree.
//!
//! The CLI talks to a running orchestrator through the same inboxes agents
//! use. A request that wants an answer gets a short-lived reply channel
//! `cli-<hex>`, which is removed once the `command_result` arrives or the
//! wait times out.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{Channel, CommandResult, Envelope, FsDelivery, PacketDelivery, COMMAND_RESULT};
use crate::comm::CommLayout;
use crate::error::BusError;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sends commands to one agent's command inbox, by default the orchestrator.
#[derive(Debug)]
pub struct OrchestratorClient {
    delivery: FsDelivery,
    target: String,
    poll_interval: Duration,
}

impl OrchestratorClient {
    pub fn new(layout: CommLayout) -> Self {
        Self {
            target: layout.orchestrator_id().to_string(),
            delivery: FsDelivery::new(layout),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Address another agent instead of the orchestrator.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Drop `envelope` into the target's command inbox without waiting.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), BusError> {
        self.delivery
            .deliver(&self.target, envelope, Channel::Command)
            .await
    }

    /// Send `envelope` and wait up to `timeout` for its `command_result`.
    ///
    /// Other reflexes arriving on the reply channel are discarded.
    pub async fn request(
        &self,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<CommandResult, BusError> {
        let reply_id = format!("cli-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let layout = self.delivery.layout();
        layout.ensure_channel(&reply_id)?;

        let envelope = envelope.with_reply_to(reply_id.clone());
        let outcome = match self.send(&envelope).await {
            Ok(()) => self.await_result(&reply_id, &envelope, timeout).await,
            Err(e) => Err(e),
        };

        if let Err(e) = layout.remove_channel(&reply_id) {
            warn!(reply_id = %reply_id, error = %e, "Reply channel not removed");
        }
        outcome
    }

    async fn await_result(
        &self,
        reply_id: &str,
        request: &Envelope,
        timeout: Duration,
    ) -> Result<CommandResult, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            for received in self.delivery.receive_all(reply_id, Channel::Reflex).await {
                let message = match received {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Unreadable reply");
                        continue;
                    }
                };
                if message.kind != COMMAND_RESULT {
                    debug!(kind = %message.kind, "Ignoring reflex on reply channel");
                    continue;
                }
                let result: CommandResult = message.content_as()?;
                if result.request_id == request.id {
                    return Ok(result);
                }
            }
            if Instant::now() >= deadline {
                return Err(BusError::ReplyTimeout {
                    command: request.kind.clone(),
                    secs: timeout.as_secs(),
                });
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn layout(temp: &TempDir) -> CommLayout {
        CommLayout::new(temp.path().join("comm"), temp.path().join("pod"), "matrix")
    }

    #[tokio::test]
    async fn test_send_lands_in_orchestrator_inbox() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        layout.ensure_channel("matrix").unwrap();
        let client = OrchestratorClient::new(layout.clone());

        client
            .send(&Envelope::new("list_tree", Value::Null))
            .await
            .unwrap();

        let delivery = FsDelivery::new(layout);
        let message = delivery.receive("matrix", Channel::Command).await.unwrap().unwrap();
        assert_eq!(message.kind, "list_tree");
        assert!(message.reply_to.is_none());
    }

    #[tokio::test]
    async fn test_request_returns_matching_result() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        layout.ensure_channel("matrix").unwrap();
        let client = OrchestratorClient::new(layout.clone())
            .with_poll_interval(Duration::from_millis(10));

        let responder = {
            let delivery = FsDelivery::new(layout.clone());
            tokio::spawn(async move {
                loop {
                    if let Ok(Some(message)) = delivery.receive("matrix", Channel::Command).await {
                        let reply_to = message.reply_to.clone().unwrap();
                        delivery
                            .deliver(&reply_to, &Envelope::new("noise", Value::Null), Channel::Reflex)
                            .await
                            .unwrap();
                        let answer = message.result(&Ok(json!({ "revived": ["w-1"] })));
                        delivery.deliver(&reply_to, &answer, Channel::Reflex).await.unwrap();
                        return reply_to;
                    }
                    sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let result = client
            .request(
                Envelope::new("resume_subtree", json!({ "id": "w-1" })),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.command, "resume_subtree");
        assert_eq!(result.result["revived"][0], "w-1");

        let reply_to = responder.await.unwrap();
        assert!(!layout.channel(&reply_to).exists());
    }

    #[tokio::test]
    async fn test_request_times_out_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        layout.ensure_channel("matrix").unwrap();
        let client = OrchestratorClient::new(layout.clone())
            .with_poll_interval(Duration::from_millis(10));

        let err = client
            .request(Envelope::new("list_tree", Value::Null), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::ReplyTimeout { .. }));
        assert_eq!(layout.list_channel_ids(), vec!["matrix"]);
    }
}
