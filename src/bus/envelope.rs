// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message envelopes and channels.

use std::fmt;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::comm::CommLayout;
use crate::error::BusError;

/// Reflex sent back to `reply_to` after a command was handled.
pub const COMMAND_RESULT: &str = "command_result";

/// The two inboxes of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Imperative instructions, `<id>/incoming/`.
    Command,
    /// Informational and query-response messages, `<id>/payload/`.
    Reflex,
}

impl Channel {
    pub fn name(self) -> &'static str {
        match self {
            Channel::Command => "command",
            Channel::Reflex => "reflex",
        }
    }

    /// Inbox directory of `id` for this channel.
    pub fn dir(self, layout: &CommLayout, id: &str) -> PathBuf {
        match self {
            Channel::Command => layout.incoming_dir(id),
            Channel::Reflex => layout.payload_dir(id),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `{type, content}` plus optional request correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
    /// Request id, echoed in the `command_result` reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Agent id that wants a `command_result` reflex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, content: Value) -> Self {
        Self {
            kind: kind.into(),
            content,
            id: None,
            reply_to: None,
        }
    }

    /// Ask for a `command_result` reflex; assigns a request id if missing.
    pub fn with_reply_to(mut self, agent_id: impl Into<String>) -> Self {
        self.reply_to = Some(agent_id.into());
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4().to_string());
        }
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Deserialize the content into a typed request.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.content.clone())
            .map_err(|e| BusError::InvalidContent(format!("{}: {}", self.kind, e)))
    }

    /// Build the `command_result` reflex answering this envelope.
    pub fn result(&self, outcome: &Result<Value, BusError>) -> Envelope {
        let content = match outcome {
            Ok(result) => json!({
                "request_id": self.id,
                "command": self.kind,
                "success": true,
                "error": Value::Null,
                "result": result,
            }),
            Err(e) => json!({
                "request_id": self.id,
                "command": self.kind,
                "success": false,
                "error": e.to_string(),
                "result": Value::Null,
            }),
        };
        Envelope::new(COMMAND_RESULT, content)
    }
}

/// Typed view of a `command_result` reflex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub request_id: Option<String>,
    pub command: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Value,
}
