// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent node types.
//!
//! [`AgentNode`] is the nested form used on disk and in inject commands.
//! [`AgentRecord`] is the same entry without its children, as stored in the
//! tree's flat index.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn is_false(value: &bool) -> bool {
    !*value
}

/// Extra directories and seed files to create inside an agent's comm channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesystemSpec {
    /// Directories relative to the channel root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folders: Vec<String>,
    /// Files relative to the channel root, with their initial content.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
}

impl FilesystemSpec {
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    /// Relative paths must stay inside the channel.
    pub fn is_contained(path: &str) -> bool {
        !path.is_empty()
            && !path.starts_with('/')
            && !path.split(['/', '\\']).any(|part| part == "..")
    }

    /// Check that every entry is a contained relative path.
    pub fn validate(&self) -> Result<(), String> {
        for path in self.folders.iter().chain(self.files.keys()) {
            if !Self::is_contained(path) {
                return Err(format!("filesystem path escapes the channel: {}", path));
            }
        }
        Ok(())
    }
}

/// One entry of the supervision tree, with its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    /// Logical agent id, unique within the tree.
    pub id: String,
    /// Role the agent is materialised as.
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Opaque configuration passed through to the spawned process.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    /// Extra comm channel entries.
    #[serde(default, skip_serializing_if = "FilesystemSpec::is_empty")]
    pub filesystem: FilesystemSpec,
    #[serde(default)]
    pub children: Vec<AgentNode>,
    /// First time a live beacon was observed for this id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub operation_in_progress: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub killed: bool,
}

impl AgentNode {
    /// Create a childless node.
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            config: Map::new(),
            filesystem: FilesystemSpec::default(),
            children: Vec::new(),
            confirmed_at: None,
            operation_in_progress: false,
            killed: false,
        }
    }

    /// Add a child.
    pub fn with_child(mut self, child: AgentNode) -> Self {
        self.children.push(child);
        self
    }

    /// Set one configuration key.
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Ids of this node and all descendants, pre-order.
    pub fn ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_ids(&mut out);
        out
    }

    fn collect_ids(&self, out: &mut Vec<String>) {
        out.push(self.id.clone());
        for child in &self.children {
            child.collect_ids(out);
        }
    }

    /// Total number of nodes in this subtree.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(AgentNode::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Split into the flat record and the children.
    pub fn into_parts(self) -> (AgentRecord, Vec<AgentNode>) {
        let record = AgentRecord {
            id: self.id,
            agent_type: self.agent_type,
            config: self.config,
            filesystem: self.filesystem,
            confirmed_at: self.confirmed_at,
            operation_in_progress: self.operation_in_progress,
            killed: self.killed,
        };
        (record, self.children)
    }
}

/// Flat form of an [`AgentNode`], stored in the tree index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub filesystem: FilesystemSpec,
    #[serde(default)]
    pub confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub operation_in_progress: bool,
    #[serde(default)]
    pub killed: bool,
}

impl AgentRecord {
    /// Reassemble a nested node from this record and its children.
    pub fn to_node(&self, children: Vec<AgentNode>) -> AgentNode {
        AgentNode {
            id: self.id.clone(),
            agent_type: self.agent_type.clone(),
            config: self.config.clone(),
            filesystem: self.filesystem.clone(),
            children,
            confirmed_at: self.confirmed_at,
            operation_in_progress: self.operation_in_progress,
            killed: self.killed,
        }
    }

    /// Whether the reconciliation loop may materialise this agent.
    pub fn is_spawnable(&self) -> bool {
        !self.killed && !self.operation_in_progress
    }
}
