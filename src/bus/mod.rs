// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Command/reflex message bus.
//!
//! Every agent has two inboxes under its comm channel: `incoming/` for
//! commands and `payload/` for reflexes. Senders drop one JSON file per
//! message; the receiving agent polls its inboxes and dispatches each
//! message to the handler registered for its `type`. An [`InboxWatcher`]
//! wakes the poller on OS file-change events; the poll interval is the
//! fallback.
//!
//! ```text
//!   sender ──deliver──▶ <comm>/<id>/incoming/<ts>_<rand>.json
//!                                   │
//!                         MessagePoller (per channel)
//!                                   │ take (delete) + parse
//!                                   ▼
//!                        HandlerRegistry[type].handle()
//!                                   │ reply_to set?
//!                                   ▼
//!          <comm>/<reply_to>/payload/…  {"type": "command_result", …}
//! ```

mod delivery;
mod envelope;
mod poller;
mod registry;
mod watcher;

pub use delivery::{is_message_file, message_file_name, FsDelivery, PacketDelivery, MAX_BATCH, MESSAGE_EXT};
pub use envelope::{Channel, CommandResult, Envelope, COMMAND_RESULT};
pub use poller::{MessagePoller, PollStats};
pub use registry::{handler_fn, FnHandler, HandlerRegistry, MessageHandler};
pub use watcher::InboxWatcher;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommLayout;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, watch};

    #[tokio::test]
    async fn test_local_delivery_wakes_running_poller() {
        let temp = TempDir::new().unwrap();
        let layout = CommLayout::new(temp.path().join("comm"), temp.path().join("pod"), "matrix");
        let delivery = Arc::new(FsDelivery::new(layout));

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let registry = HandlerRegistry::new(Channel::Reflex).with(
            "status",
            handler_fn(move |m: Envelope| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(m.content);
                    Ok(Value::Null)
                }
            }),
        );
        // Long interval: only the waker can make this poller see the message in time.
        let poller = MessagePoller::new("worker-1", Arc::new(registry), delivery.clone())
            .with_interval(Duration::from_secs(3600));
        delivery.register_waker("worker-1", Channel::Reflex, poller.waker());

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(stop_rx));
        tokio::task::yield_now().await;

        delivery
            .deliver("worker-1", &Envelope::new("status", json!({"ok": true})), Channel::Reflex)
            .await
            .unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, json!({"ok": true}));

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_delivery_wakes_watching_poller() {
        let temp = TempDir::new().unwrap();
        let layout = CommLayout::new(temp.path().join("comm"), temp.path().join("pod"), "matrix");
        layout.ensure_channel("worker-1").unwrap();
        let receiver = Arc::new(FsDelivery::new(layout.clone()));
        // Separate instance with no wakers, like another process writing the file.
        let sender = FsDelivery::new(layout.clone());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let registry = HandlerRegistry::new(Channel::Command).with(
            "restart",
            handler_fn(move |m: Envelope| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(m.content);
                    Ok(Value::Null)
                }
            }),
        );
        let poller = MessagePoller::new("worker-1", Arc::new(registry), receiver)
            .with_interval(Duration::from_secs(3600))
            .with_watch(Channel::Command.dir(&layout, "worker-1"));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        sender
            .deliver("worker-1", &Envelope::new("restart", json!({"n": 1})), Channel::Command)
            .await
            .unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, json!({"n": 1}));

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_content_reported_to_sender() {
        #[derive(serde::Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            target: String,
        }

        let temp = TempDir::new().unwrap();
        let layout = CommLayout::new(temp.path().join("comm"), temp.path().join("pod"), "matrix");
        let delivery = Arc::new(FsDelivery::new(layout));
        let registry = HandlerRegistry::new(Channel::Command).with(
            "typed",
            handler_fn(|m: Envelope| async move { m.content_as::<Needs>().map(|_| Value::Null) }),
        );
        let poller = MessagePoller::new("worker-1", Arc::new(registry), delivery.clone());

        delivery
            .deliver(
                "worker-1",
                &Envelope::new("typed", json!({})).with_reply_to("cli"),
                Channel::Command,
            )
            .await
            .unwrap();
        assert_eq!(poller.poll_once().await.failed, 1);

        let reply = delivery.receive("cli", Channel::Reflex).await.unwrap().unwrap();
        let result: CommandResult = reply.content_as().unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("typed"));
    }
}
