// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Snapshot parsing.
//!
//! Loading happens in two passes over the raw document:
//!
//! 1. A pre-scan walks the nested structure depth-first, pre-order, and
//!    removes every subtree whose id was already seen. The first occurrence
//!    wins and the rejected ids are recorded.
//! 2. Structural parsing turns the cleaned document into [`AgentNode`]s,
//!    pruning (or, under [`LoadPolicy::Strict`], refusing) nodes without a
//!    usable `id` and `type`.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::warn;

use crate::comm::CommLayout;
use crate::error::TreeError;

use super::node::{AgentNode, FilesystemSpec};

/// What to do with malformed nodes while loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadPolicy {
    /// Drop the malformed node and its subtree, keep loading.
    #[default]
    Lenient,
    /// Fail the whole load.
    Strict,
}

impl LoadPolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            Self::Strict
        } else {
            Self::Lenient
        }
    }
}

/// What the loader discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Ids of duplicate clones removed by the pre-scan.
    pub rejected_duplicates: Vec<String>,
    /// Descriptions of malformed nodes pruned during structural parsing.
    pub pruned: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.rejected_duplicates.is_empty() && self.pruned.is_empty()
    }
}

const ID_KEYS: &[&str] = &["id", "universal_id"];
const TYPE_KEYS: &[&str] = &["type", "name"];
const FILESYSTEM_KEYS: &[&str] = &["filesystem", "filesystem_spec"];

fn string_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Remove duplicate-id clones in place. Returns the rejected ids.
pub fn prescan_duplicates(root: &mut Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut rejected = Vec::new();
    if let Some(obj) = root.as_object() {
        if let Some(id) = string_field(obj, ID_KEYS) {
            seen.insert(id.to_string());
        }
    }
    prescan_children(root, &mut seen, &mut rejected);
    rejected
}

fn prescan_children(node: &mut Value, seen: &mut HashSet<String>, rejected: &mut Vec<String>) {
    let Some(children) = node.get_mut("children").and_then(Value::as_array_mut) else {
        return;
    };

    let mut kept = Vec::with_capacity(children.len());
    for mut child in children.drain(..) {
        let id = child
            .as_object()
            .and_then(|obj| string_field(obj, ID_KEYS))
            .map(String::from);
        if let Some(id) = id {
            if !seen.insert(id.clone()) {
                warn!(agent_id = %id, "Rejected duplicate agent id in snapshot");
                rejected.push(id);
                continue;
            }
        }
        prescan_children(&mut child, seen, rejected);
        kept.push(child);
    }
    *children = kept;
}

/// Parse one node (and its children) from a cleaned document.
///
/// Returns `Ok(None)` when the node is pruned under the lenient policy.
pub fn parse_node(
    value: &Value,
    policy: LoadPolicy,
    report: &mut LoadReport,
) -> Result<Option<AgentNode>, TreeError> {
    match validate_fields(value) {
        Ok(mut node) => {
            if let Some(children) = value.get("children").and_then(Value::as_array) {
                for child in children {
                    if let Some(parsed) = parse_node(child, policy, report)? {
                        node.children.push(parsed);
                    }
                }
            }
            Ok(Some(node))
        }
        Err(reason) => match policy {
            LoadPolicy::Strict => Err(TreeError::MalformedNode(reason)),
            LoadPolicy::Lenient => {
                warn!(reason = %reason, "Pruned malformed node from tree");
                report.pruned.push(reason);
                Ok(None)
            }
        },
    }
}

fn validate_fields(value: &Value) -> Result<AgentNode, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("node is not an object: {}", short(value)))?;

    let id = string_field(obj, ID_KEYS).ok_or_else(|| format!("node without id: {}", short(value)))?;
    CommLayout::validate_id(id).map_err(|_| format!("node id is not a valid path component: {}", id))?;
    let agent_type =
        string_field(obj, TYPE_KEYS).ok_or_else(|| format!("node {} without type", id))?;

    let mut node = AgentNode::new(id, agent_type);

    match obj.get("config") {
        None | Some(Value::Null) => {}
        Some(Value::Object(config)) => node.config = config.clone(),
        Some(_) => return Err(format!("node {} has a non-object config", id)),
    }

    if let Some(fs) = FILESYSTEM_KEYS.iter().find_map(|k| obj.get(*k)) {
        if !fs.is_null() {
            let spec: FilesystemSpec = serde_json::from_value(fs.clone())
                .map_err(|e| format!("node {} has an invalid filesystem spec: {}", id, e))?;
            spec.validate().map_err(|e| format!("node {}: {}", id, e))?;
            node.filesystem = spec;
        }
    }

    if let Some(ts) = obj.get("confirmed_at").filter(|v| !v.is_null()) {
        node.confirmed_at = serde_json::from_value(ts.clone()).ok();
    }
    node.operation_in_progress = obj
        .get("operation_in_progress")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    node.killed = obj.get("killed").and_then(Value::as_bool).unwrap_or(false);

    Ok(node)
}

fn short(value: &Value) -> String {
    let text = value.to_string();
    if text.len() > 80 {
        let mut end = 80;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text
    }
}

/// Run both passes over a raw document.
pub fn parse_document(
    mut value: Value,
    policy: LoadPolicy,
) -> Result<(AgentNode, LoadReport), TreeError> {
    let mut report = LoadReport {
        rejected_duplicates: prescan_duplicates(&mut value),
        pruned: Vec::new(),
    };
    match parse_node(&value, policy, &mut report)? {
        Some(root) => Ok((root, report)),
        None => Err(TreeError::MalformedNode(
            report.pruned.last().cloned().unwrap_or_else(|| "root node".to_string()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prescan_keeps_first_occurrence() {
        let mut doc = json!({
            "id": "root", "type": "orchestrator",
            "children": [
                {"id": "a", "type": "t", "children": [{"id": "dup", "type": "first"}]},
                {"id": "dup", "type": "second", "children": [{"id": "lost", "type": "t"}]}
            ]
        });
        let rejected = prescan_duplicates(&mut doc);
        assert_eq!(rejected, vec!["dup".to_string()]);

        let (root, _) = parse_document(doc, LoadPolicy::Lenient).unwrap();
        assert_eq!(root.ids(), vec!["root", "a", "dup"]);
        assert_eq!(root.children[0].children[0].agent_type, "first");
    }

    #[test]
    fn test_prescan_rejects_clone_of_root() {
        let mut doc = json!({
            "id": "root", "type": "orchestrator",
            "children": [{"id": "root", "type": "clone"}]
        });
        assert_eq!(prescan_duplicates(&mut doc), vec!["root".to_string()]);
    }

    #[test]
    fn test_lenient_prunes_malformed_subtree() {
        let doc = json!({
            "id": "root", "type": "orchestrator",
            "children": [
                {"type": "no-id", "children": [{"id": "orphan", "type": "t"}]},
                {"id": "no-type"},
                {"id": "ok", "type": "t"}
            ]
        });
        let (root, report) = parse_document(doc, LoadPolicy::Lenient).unwrap();
        assert_eq!(root.ids(), vec!["root", "ok"]);
        assert_eq!(report.pruned.len(), 2);
    }

    #[test]
    fn test_strict_fails_whole_load() {
        let doc = json!({
            "id": "root", "type": "orchestrator",
            "children": [{"id": "no-type"}]
        });
        let err = parse_document(doc, LoadPolicy::Strict).unwrap_err();
        assert!(matches!(err, TreeError::MalformedNode(_)));
    }

    #[test]
    fn test_malformed_root_is_an_error() {
        let err = parse_document(json!({"type": "x"}), LoadPolicy::Lenient).unwrap_err();
        assert!(matches!(err, TreeError::MalformedNode(_)));
    }

    #[test]
    fn test_legacy_field_names() {
        let doc = json!({
            "universal_id": "root", "name": "orchestrator",
            "filesystem_spec": {"folders": ["queue"]},
            "children": []
        });
        let (root, report) = parse_document(doc, LoadPolicy::Strict).unwrap();
        assert!(report.is_clean());
        assert_eq!(root.id, "root");
        assert_eq!(root.agent_type, "orchestrator");
        assert_eq!(root.filesystem.folders, vec!["queue".to_string()]);
    }

    #[test]
    fn test_path_unsafe_id_is_malformed() {
        let doc = json!({"id": "root", "type": "o", "children": [{"id": "../etc", "type": "t"}]});
        let (root, report) = parse_document(doc, LoadPolicy::Lenient).unwrap();
        assert_eq!(root.ids(), vec!["root"]);
        assert_eq!(report.pruned.len(), 1);
    }
}
