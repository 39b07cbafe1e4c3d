// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Handler registration.
//!
//! Every message type an agent understands is registered explicitly against
//! a handler. Types without a handler are dropped at dispatch time, and
//! [`HandlerRegistry::require`] lets startup code and tests assert that the
//! expected types are wired.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::error::BusError;

use super::envelope::{Channel, Envelope};

/// Handles one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a message. The returned value is sent back as the `result` of
    /// a `command_result` reflex when the sender asked for one.
    async fn handle(&self, message: Envelope) -> Result<Value, BusError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BusError>> + Send + 'static,
{
    async fn handle(&self, message: Envelope) -> Result<Value, BusError> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BusError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Message type to handler table for one channel.
#[derive(Clone)]
pub struct HandlerRegistry {
    channel: Channel,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("channel", &self.channel)
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            handlers: HashMap::new(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) -> &mut Self {
        let kind = kind.into();
        if self.handlers.insert(kind.clone(), handler).is_some() {
            warn!(channel = %self.channel, kind = %kind, "Replaced message handler");
        }
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered types, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Fail on the first type in `kinds` that has no handler.
    pub fn require<I, S>(&self, kinds: I) -> Result<(), BusError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for kind in kinds {
            if !self.contains(kind.as_ref()) {
                return Err(BusError::UnregisteredHandler {
                    channel: self.channel.name(),
                    name: kind.as_ref().to_string(),
                });
            }
        }
        Ok(())
    }
}
