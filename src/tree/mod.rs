// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervision tree.
//!
//! The tree is held as a flat index (id -> record) plus parent and child
//! links expressed as ids, never as references. Nested [`AgentNode`]s are
//! only built for serialization and for subtree extraction.
//!
//! # Invariants
//!
//! - Ids are unique across the whole tree. Every mutation that would break
//!   this is rejected as a whole; the tree is left untouched.
//! - The root is never removed or detached.
//! - Nodes under an in-progress termination (`operation_in_progress`) are
//!   skipped by reconciliation.

mod node;
mod parse;
mod persist;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::TreeError;

pub use node::{AgentNode, AgentRecord, FilesystemSpec};
pub use parse::{parse_document, parse_node, prescan_duplicates, LoadPolicy, LoadReport};
pub use persist::{SnapshotCache, SnapshotFormat, SnapshotWriter};

#[derive(Debug, Clone)]
struct Slot {
    record: AgentRecord,
    parent: Option<String>,
    children: Vec<String>,
}

/// In-memory supervision tree.
#[derive(Debug, Clone)]
pub struct SupervisionTree {
    root: String,
    slots: HashMap<String, Slot>,
}

/// Cascade locked for termination.
///
/// Produced by [`SupervisionTree::lock_for_termination`] and consumed by
/// either [`SupervisionTree::confirm_termination`] or
/// [`SupervisionTree::abort_termination`].
#[derive(Debug, Clone)]
#[must_use = "a termination lock must be confirmed or aborted"]
pub struct TerminationLock {
    root_id: String,
    ids: Vec<String>,
    parent_id: Option<String>,
    position: usize,
    detached: Option<AgentNode>,
}

impl TerminationLock {
    /// Id the lock was taken on.
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Every id in the locked cascade, pre-order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Whether the cascade was removed from its parent while locked.
    pub fn is_detached(&self) -> bool {
        self.detached.is_some()
    }
}

impl SupervisionTree {
    /// Build a tree from a nested node, rejecting duplicate ids.
    pub fn from_node(root: AgentNode) -> Result<Self, TreeError> {
        let mut seen = HashSet::new();
        for id in root.ids() {
            if !seen.insert(id.clone()) {
                return Err(TreeError::DuplicateId(id));
            }
        }
        let root_id = root.id.clone();
        let mut tree = Self {
            root: root_id,
            slots: HashMap::new(),
        };
        tree.index_subtree(root, None);
        Ok(tree)
    }

    /// Parse a raw document with duplicate pre-scan and structural pruning.
    pub fn load(value: Value, policy: LoadPolicy) -> Result<(Self, LoadReport), TreeError> {
        let (root, report) = parse_document(value, policy)?;
        Ok((Self::from_node(root)?, report))
    }

    fn index_subtree(&mut self, node: AgentNode, parent: Option<String>) {
        let (record, children) = node.into_parts();
        let id = record.id.clone();
        let child_ids = children.iter().map(|c| c.id.clone()).collect();
        self.slots.insert(
            id.clone(),
            Slot {
                record,
                parent,
                children: child_ids,
            },
        );
        for child in children {
            self.index_subtree(child, Some(id.clone()));
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&AgentRecord> {
        self.slots.get(id).map(|s| &s.record)
    }

    /// Parent id of `id`, `None` for the root or unknown ids.
    pub fn find_parent_of(&self, id: &str) -> Option<&str> {
        self.slots.get(id).and_then(|s| s.parent.as_deref())
    }

    /// Direct children of `id`, in order.
    pub fn children_of(&self, id: &str) -> &[String] {
        self.slots
            .get(id)
            .map(|s| s.children.as_slice())
            .unwrap_or(&[])
    }

    /// Records of the direct children of `id`.
    pub fn child_records(&self, id: &str) -> Vec<&AgentRecord> {
        self.children_of(id)
            .iter()
            .filter_map(|c| self.get(c))
            .collect()
    }

    /// Every id in the tree, pre-order from the root.
    pub fn all_ids(&self) -> Vec<String> {
        self.cascade(&self.root)
    }

    /// Every record in the tree, pre-order from the root.
    pub fn flatten(&self) -> Vec<&AgentRecord> {
        self.all_ids()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// `id` and every descendant, pre-order. Empty for unknown ids.
    pub fn cascade(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        if self.contains(id) {
            self.collect_cascade(id, &mut out);
        }
        out
    }

    fn collect_cascade(&self, id: &str, out: &mut Vec<String>) {
        out.push(id.to_string());
        for child in self.children_of(id) {
            self.collect_cascade(child, out);
        }
    }

    /// Union of the cascades of several roots, without repeats.
    pub fn cascade_all<I, S>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in ids {
            for member in self.cascade(id.as_ref()) {
                if seen.insert(member.clone()) {
                    out.push(member);
                }
            }
        }
        out
    }

    /// Deep copy of the subtree rooted at `id`.
    pub fn extract_subtree(&self, id: &str) -> Option<AgentNode> {
        let slot = self.slots.get(id)?;
        let children = slot
            .children
            .iter()
            .filter_map(|c| self.extract_subtree(c))
            .collect();
        Some(slot.record.to_node(children))
    }

    /// Whole tree as a nested node.
    pub fn to_node(&self) -> AgentNode {
        self.extract_subtree(&self.root)
            .unwrap_or_else(|| AgentNode::new(self.root.clone(), "unknown"))
    }

    /// Insert `node` (with its subtree) as the last child of `parent_id`.
    ///
    /// Fails without touching the tree if the parent is missing or if any id
    /// inside `node` already exists in the tree or repeats within `node`.
    /// Returns the inserted ids.
    pub fn insert(&mut self, node: AgentNode, parent_id: &str) -> Result<Vec<String>, TreeError> {
        let position = self.children_of(parent_id).len();
        self.insert_at(node, parent_id, position)
    }

    fn insert_at(
        &mut self,
        node: AgentNode,
        parent_id: &str,
        position: usize,
    ) -> Result<Vec<String>, TreeError> {
        if !self.contains(parent_id) {
            return Err(TreeError::ParentNotFound(parent_id.to_string()));
        }
        let ids = node.ids();
        let mut incoming = HashSet::new();
        for id in &ids {
            if self.contains(id) || !incoming.insert(id.as_str()) {
                return Err(TreeError::DuplicateId(id.clone()));
            }
        }

        let node_id = node.id.clone();
        self.index_subtree(node, Some(parent_id.to_string()));
        if let Some(parent) = self.slots.get_mut(parent_id) {
            let at = position.min(parent.children.len());
            parent.children.insert(at, node_id);
        }
        Ok(ids)
    }

    /// Remove the subtree rooted at `id` and return it.
    pub fn remove_subtree(&mut self, id: &str) -> Result<AgentNode, TreeError> {
        if id == self.root {
            return Err(TreeError::RootImmutable("removed"));
        }
        let node = self
            .extract_subtree(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_string()))?;
        self.unlink(id);
        Ok(node)
    }

    fn unlink(&mut self, id: &str) -> usize {
        let mut position = 0;
        if let Some(parent_id) = self.find_parent_of(id).map(String::from) {
            if let Some(parent) = self.slots.get_mut(&parent_id) {
                if let Some(idx) = parent.children.iter().position(|c| c == id) {
                    parent.children.remove(idx);
                    position = idx;
                }
            }
        }
        for member in self.cascade(id) {
            self.slots.remove(&member);
        }
        position
    }

    /// Record the first observed liveness of `id`. Returns true if newly set.
    pub fn mark_confirmed(&mut self, id: &str, at: DateTime<Utc>) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) if slot.record.confirmed_at.is_none() => {
                slot.record.confirmed_at = Some(at);
                true
            }
            _ => false,
        }
    }

    /// Replace the configuration of `id`.
    pub fn update_config(&mut self, id: &str, config: Map<String, Value>) -> Result<(), TreeError> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_string()))?;
        slot.record.config = config;
        Ok(())
    }

    /// Clear `killed` on the cascade of `id`. Returns the affected ids.
    pub fn revive_subtree(&mut self, id: &str) -> Result<Vec<String>, TreeError> {
        let ids = self.cascade(id);
        if ids.is_empty() {
            return Err(TreeError::NodeNotFound(id.to_string()));
        }
        if let Some(locked) = ids
            .iter()
            .find(|i| self.get(i).map(|r| r.operation_in_progress).unwrap_or(false))
        {
            return Err(TreeError::Locked(locked.clone()));
        }
        for member in &ids {
            if let Some(slot) = self.slots.get_mut(member) {
                slot.record.killed = false;
            }
        }
        Ok(ids)
    }

    /// Clear `operation_in_progress` on the cascade of `id` without touching
    /// `killed`. Releases locks left behind by a supervisor that died between
    /// lock and confirm. Returns the ids that were locked.
    pub fn release_locks(&mut self, id: &str) -> Result<Vec<String>, TreeError> {
        let ids = self.cascade(id);
        if ids.is_empty() {
            return Err(TreeError::NodeNotFound(id.to_string()));
        }
        let mut released = Vec::new();
        for member in ids {
            if let Some(slot) = self.slots.get_mut(&member) {
                if slot.record.operation_in_progress {
                    slot.record.operation_in_progress = false;
                    released.push(member);
                }
            }
        }
        Ok(released)
    }

    /// Lock the cascade of `id` for termination.
    ///
    /// With `detach`, the cascade is also removed from its parent so that
    /// concurrent reconciliation cannot see it. Fails if any member is
    /// already locked.
    pub fn lock_for_termination(
        &mut self,
        id: &str,
        detach: bool,
    ) -> Result<TerminationLock, TreeError> {
        let ids = self.cascade(id);
        if ids.is_empty() {
            return Err(TreeError::NodeNotFound(id.to_string()));
        }
        if detach && id == self.root {
            return Err(TreeError::RootImmutable("detached"));
        }
        if let Some(locked) = ids
            .iter()
            .find(|i| self.get(i).map(|r| r.operation_in_progress).unwrap_or(false))
        {
            return Err(TreeError::Locked(locked.clone()));
        }

        for member in &ids {
            if let Some(slot) = self.slots.get_mut(member) {
                slot.record.operation_in_progress = true;
            }
        }

        let parent_id = self.find_parent_of(id).map(String::from);
        let mut position = 0;
        let detached = if detach {
            let node = self.extract_subtree(id);
            position = self.unlink(id);
            node
        } else {
            None
        };

        Ok(TerminationLock {
            root_id: id.to_string(),
            ids,
            parent_id,
            position,
            detached,
        })
    }

    /// Finish a termination: in-place cascades are marked `killed`,
    /// detached cascades are dropped and returned.
    pub fn confirm_termination(&mut self, lock: TerminationLock) -> Option<AgentNode> {
        if lock.detached.is_some() {
            return lock.detached;
        }
        for member in &lock.ids {
            if let Some(slot) = self.slots.get_mut(member) {
                slot.record.operation_in_progress = false;
                slot.record.killed = true;
            }
        }
        None
    }

    /// Release a lock without marking death; detached cascades are re-attached
    /// at their previous position.
    pub fn abort_termination(&mut self, lock: TerminationLock) -> Result<(), TreeError> {
        match lock.detached {
            Some(mut node) => {
                clear_locks(&mut node);
                let parent = lock
                    .parent_id
                    .ok_or(TreeError::RootImmutable("detached"))?;
                self.insert_at(node, &parent, lock.position)?;
            }
            None => {
                for member in &lock.ids {
                    if let Some(slot) = self.slots.get_mut(member) {
                        slot.record.operation_in_progress = false;
                    }
                }
            }
        }
        Ok(())
    }
}

fn clear_locks(node: &mut AgentNode) {
    node.operation_in_progress = false;
    for child in &mut node.children {
        clear_locks(child);
    }
}
