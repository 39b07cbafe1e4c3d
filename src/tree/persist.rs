// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Snapshot persistence.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::comm::atomic_write;
use crate::error::TreeError;

use super::{LoadPolicy, LoadReport, SupervisionTree};

/// On-disk encoding of the tree snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    #[default]
    Json,
    #[serde(alias = "yml")]
    Yaml,
}

impl SnapshotFormat {
    /// Pick the format from a file extension; anything but yaml/yml is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::Yaml,
            _ => Self::Json,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

impl SupervisionTree {
    /// Encode the whole tree in `format`.
    pub fn to_bytes(&self, format: SnapshotFormat) -> Result<Vec<u8>, TreeError> {
        let node = self.to_node();
        Ok(match format {
            SnapshotFormat::Json => serde_json::to_vec_pretty(&node)?,
            SnapshotFormat::Yaml => serde_yaml::to_string(&node)?.into_bytes(),
        })
    }

    /// Decode a raw snapshot document.
    pub fn parse_bytes(
        bytes: &[u8],
        format: SnapshotFormat,
        policy: LoadPolicy,
    ) -> Result<(Self, LoadReport), TreeError> {
        let value: Value = match format {
            SnapshotFormat::Json => serde_json::from_slice(bytes)?,
            SnapshotFormat::Yaml => serde_yaml::from_slice(bytes)?,
        };
        Self::load(value, policy)
    }

    /// Load a snapshot file; the format follows the extension.
    pub fn load_file(path: &Path, policy: LoadPolicy) -> Result<(Self, LoadReport), TreeError> {
        let bytes = fs::read(path)?;
        Self::parse_bytes(&bytes, SnapshotFormat::from_path(path), policy)
    }

    /// Persist atomically; the format follows the extension.
    pub fn save(&self, path: &Path) -> Result<(), TreeError> {
        let bytes = self.to_bytes(SnapshotFormat::from_path(path))?;
        atomic_write(path, &bytes).map_err(|e| TreeError::IoError(e.to_string()))?;
        debug!(path = %path.display(), agents = self.len(), "Saved tree snapshot");
        Ok(())
    }
}

/// Serialises read-modify-write cycles on the snapshot within one process.
///
/// Writers in different processes still race (last writer wins); this only
/// keeps the tasks of one agent from undoing each other's saves.
#[derive(Debug, Clone, Default)]
pub struct SnapshotWriter(Arc<Mutex<()>>);

impl SnapshotWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Snapshot reader that only reparses when the file's mtime changes.
#[derive(Debug)]
pub struct SnapshotCache {
    path: PathBuf,
    policy: LoadPolicy,
    mtime: Option<SystemTime>,
    tree: Option<SupervisionTree>,
}

impl SnapshotCache {
    pub fn new(path: impl Into<PathBuf>, policy: LoadPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            mtime: None,
            tree: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current tree, reloading if the file changed since the last read.
    ///
    /// A failed reload keeps the previously loaded tree.
    pub fn current(&mut self) -> Result<Option<&SupervisionTree>, TreeError> {
        let mtime = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(self.tree.as_ref()),
            Err(e) => return Err(e.into()),
        };

        if self.tree.is_none() || self.mtime != Some(mtime) {
            match SupervisionTree::load_file(&self.path, self.policy) {
                Ok((tree, report)) => {
                    if !report.is_clean() {
                        warn!(
                            duplicates = report.rejected_duplicates.len(),
                            pruned = report.pruned.len(),
                            "Snapshot loaded with rejected entries"
                        );
                    }
                    self.tree = Some(tree);
                    self.mtime = Some(mtime);
                }
                Err(e) if self.tree.is_some() => {
                    warn!(error = %e, "Snapshot reload failed, keeping previous tree");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self.tree.as_ref())
    }

    /// Forget the cached tree so the next read always reparses.
    pub fn invalidate(&mut self) {
        self.mtime = None;
        self.tree = None;
    }

    /// Save `tree` and prime the cache with it.
    pub fn store(&mut self, tree: SupervisionTree) -> Result<(), TreeError> {
        tree.save(&self.path)?;
        self.mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        self.tree = Some(tree);
        Ok(())
    }
}
