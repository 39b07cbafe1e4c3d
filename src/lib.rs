// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Swarmer - filesystem-mediated supervision of agent processes.
//!
//! A declarative tree of logical agents is kept alive as OS processes. Every
//! process that supervises children compares the tree against heartbeat
//! evidence on disk and respawns what is missing. All coordination goes
//! through a shared directory hierarchy: no sockets, no shared memory.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`comm`] - Directory layout of channels and pods, atomic file primitives
//! - [`tree`] - Supervision tree, snapshot I/O and termination locks
//! - [`heartbeat`] - Beacon emitter, liveness classification, phantom query
//! - [`spawn`] - Runtime instance creation, boot bundles and receipts
//! - [`controller`] - Reconciliation loop run by every supervising agent
//! - [`bus`] - Command and reflex inboxes, handler registry, poller
//! - [`reaper`] - Termination protocol with SIGTERM/SIGKILL escalation
//! - [`agent`] - Per-process runtime around a domain worker
//! - [`orchestrator`] - Tree mutations served by the root agent
//! - [`config`] - Layered configuration
//! - [`telemetry`] - Tracing initialisation and metrics
//! - [`error`] - Error types and result aliases
//!
//! # Example
//!
//! ```rust,ignore
//! use swarmer::config::{load_config, CliOptions};
//! use swarmer::tree::{AgentNode, SupervisionTree};
//!
//! let settings = load_config(".".as_ref(), CliOptions::default())?;
//! let tree = SupervisionTree::from_node(
//!     AgentNode::new("matrix", "orchestrator")
//!         .with_child(AgentNode::new("watchdog-1", "redis_watchdog")),
//! )?;
//! tree.save(&settings.layout().snapshot_path())?;
//! ```

pub mod agent;
pub mod bus;
pub mod comm;
pub mod config;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod orchestrator;
pub mod reaper;
pub mod spawn;
pub mod telemetry;
pub mod tree;

// Re-export commonly used types at crate root
pub use agent::{AgentContext, AgentRuntime, ExitReason, Worker, WorkerRegistry};
pub use bus::{Channel, Envelope, PacketDelivery};
pub use comm::CommLayout;
pub use config::{ResolvedConfig, WorkspaceConfig};
pub use controller::SpawnController;
pub use error::{
    AgentError, BusError, CommError, ConfigError, ReaperError, Result, SpawnError, TreeError,
};
pub use heartbeat::{HeartbeatMonitor, Liveness};
pub use reaper::{Reaper, ReaperMission, ReaperReport};
pub use spawn::{BootBundle, RuntimeSpawner};
pub use tree::{AgentNode, SupervisionTree};

/// Swarmer version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        let tree = SupervisionTree::from_node(AgentNode::new("matrix", "orchestrator")).unwrap();
        assert_eq!(tree.root_id(), "matrix");
        let _envelope = Envelope::new("list_tree", serde_json::Value::Null);
        assert_eq!(Channel::Command.name(), "command");
    }
}
