// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the swarm supervisor.
//!
//! This module provides strongly-typed errors for each subsystem,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error propagation.

use thiserror::Error;

/// Errors raised by the supervision tree.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("Duplicate agent id: {0}")]
    DuplicateId(String),

    #[error("Parent not found: {0}")]
    ParentNotFound(String),

    #[error("Agent not found: {0}")]
    NodeNotFound(String),

    #[error("Malformed node: {0}")]
    MalformedNode(String),

    #[error("Agent is locked by an operation in progress: {0}")]
    Locked(String),

    #[error("Cascade of {0} contains the orchestrator serving the request")]
    SelfTermination(String),

    #[error("The root node cannot be {0}")]
    RootImmutable(&'static str),

    #[error("Snapshot parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl TreeError {
    /// Check if this error rejects an operation on identity grounds.
    ///
    /// Identity errors leave the tree untouched and are reported back to the
    /// requester rather than logged as failures of the supervisor itself.
    pub fn is_identity_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateId(_) | Self::ParentNotFound(_) | Self::NodeNotFound(_)
        )
    }
}

impl From<std::io::Error> for TreeError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for TreeError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

impl From<serde_yaml::Error> for TreeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

/// Errors raised by comm channel file primitives.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("Invalid agent id for a filesystem path: {0}")]
    InvalidId(String),

    #[error("IO error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CommError {
    /// Attach a path to an IO error.
    pub fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CommError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised while materialising a runtime instance.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("No implementation registered for agent type: {0}")]
    UnknownAgentType(String),

    #[error("Agent implementation not found at {0}")]
    ImplementationMissing(String),

    #[error("Die marker present for {0}, spawn skipped")]
    DieMarkerPresent(String),

    #[error("Tombstone present for {0}, spawn skipped")]
    Tombstoned(String),

    #[error("Agent {0} already has a live heartbeat")]
    AlreadyAlive(String),

    #[error("Failed to launch process: {0}")]
    LaunchFailed(String),

    #[error("Comm error: {0}")]
    Comm(#[from] CommError),

    #[error("IO error: {0}")]
    IoError(String),
}

impl SpawnError {
    /// Check if this error is a deliberate skip rather than a failure.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::DieMarkerPresent(_) | Self::Tombstoned(_) | Self::AlreadyAlive(_)
        )
    }
}

impl From<std::io::Error> for SpawnError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Errors raised by the command/reflex message bus.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Malformed message {file}: {message}")]
    Malformed { file: String, message: String },

    #[error("No handler registered for {channel} message type: {name}")]
    UnregisteredHandler { channel: &'static str, name: String },

    #[error("Invalid message content: {0}")]
    InvalidContent(String),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("No reply to {command} within {secs}s")]
    ReplyTimeout { command: String, secs: u64 },

    #[error("Inbox watch failed: {0}")]
    WatchFailed(String),

    #[error("Comm error: {0}")]
    Comm(#[from] CommError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Reaper error: {0}")]
    Reaper(#[from] ReaperError),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidContent(err.to_string())
    }
}

/// Errors raised by the reaper.
#[derive(Error, Debug)]
pub enum ReaperError {
    #[error("Target {0} is outside the mission scope")]
    OutOfScope(String),

    #[error("Failed to signal pid {pid}: {message}")]
    SignalFailed { pid: u32, message: String },

    #[error("Instances still running after SIGKILL: {}", .0.join(", "))]
    Survivors(Vec<String>),

    #[error("Comm error: {0}")]
    Comm(#[from] CommError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config format: {0}")]
    InvalidFormat(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors that can occur while running an agent process.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Missing boot bundle: {0}")]
    MissingBoot(String),

    #[error("Invalid boot bundle: {0}")]
    InvalidBoot(String),

    #[error("No worker registered for agent type: {0}")]
    UnknownWorker(String),

    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Comm error: {0}")]
    Comm(#[from] CommError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

/// Convert any error type that implements std::error::Error to an anyhow::Error.
pub fn to_anyhow<E: std::error::Error + Send + Sync + 'static>(err: E) -> anyhow::Error {
    anyhow::Error::new(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_identity_errors() {
        assert!(TreeError::DuplicateId("a".to_string()).is_identity_error());
        assert!(TreeError::ParentNotFound("p".to_string()).is_identity_error());
        assert!(!TreeError::ParseError("bad".to_string()).is_identity_error());
    }

    #[test]
    fn test_spawn_error_skip() {
        assert!(SpawnError::DieMarkerPresent("a".to_string()).is_skip());
        assert!(SpawnError::AlreadyAlive("a".to_string()).is_skip());
        assert!(!SpawnError::UnknownAgentType("x".to_string()).is_skip());
    }

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("invalid json");
        let json_err = result.unwrap_err();
        let config_err: ConfigError = json_err.into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_bus_error_from_tree() {
        let err: BusError = TreeError::DuplicateId("watchdog-1".to_string()).into();
        assert!(matches!(err, BusError::Tree(TreeError::DuplicateId(_))));
        assert!(err.to_string().contains("watchdog-1"));
    }

    #[test]
    fn test_error_display() {
        let err = BusError::UnregisteredHandler {
            channel: "command",
            name: "explode".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("command"));
        assert!(display.contains("explode"));
    }
}
