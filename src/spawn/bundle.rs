// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Boot bundle handed to spawned processes through the environment.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ResolvedConfig;
use crate::error::AgentError;

/// Environment variable carrying the JSON boot bundle.
pub const BOOT_ENV: &str = "SWARMER_BOOT";

/// Everything a spawned agent needs to start, fully resolved by its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootBundle {
    pub id: String,
    pub instance_id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub universe: String,
    /// Node configuration from the tree.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Swarm-wide settings inherited from the parent.
    pub settings: ResolvedConfig,
}

impl BootBundle {
    pub fn to_env_value(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_env_value(value: &str) -> Result<Self, AgentError> {
        serde_json::from_str(value).map_err(|e| AgentError::InvalidBoot(e.to_string()))
    }

    /// Read the bundle of the current process.
    pub fn from_env() -> Result<Self, AgentError> {
        let value = std::env::var(BOOT_ENV)
            .map_err(|_| AgentError::MissingBoot(format!("{} is not set", BOOT_ENV)))?;
        Self::from_env_value(&value)
    }
}
