// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Comm channel layout.
//!
//! Every logical agent id owns a persistent directory under the comm root,
//! and every runtime instance (pod) owns a disposable directory under the
//! pod root:
//!
//! ```text
//! <comm_root>/<id>/hello.moto/        heartbeat beacons, one file per thread
//! <comm_root>/<id>/incoming/          command inbox
//! <comm_root>/<id>/incoming/die       graceful shutdown requested
//! <comm_root>/<id>/incoming/tombstone do not resurrect
//! <comm_root>/<id>/payload/           reflex inbox
//! <comm_root>/<id>/spawn/             spawn receipts
//! <comm_root>/<id>/logs/              agent log sink
//! <pod_root>/<instance_id>/boot.json  boot record
//! <pod_root>/<instance_id>/tombstone  pod-side do-not-resurrect marker
//! <comm_root>/<orchestrator>/agent_tree_master.<ext>
//! ```

pub mod atomic;

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CommError;

pub use atomic::{
    atomic_write, atomic_write_json, is_temp_name, read_json, remove_if_exists, temp_path_for,
    touch_marker,
};

/// Heartbeat beacon directory name.
pub const HELLO_DIR: &str = "hello.moto";
/// Command inbox directory name.
pub const INCOMING_DIR: &str = "incoming";
/// Reflex inbox directory name.
pub const PAYLOAD_DIR: &str = "payload";
/// Spawn receipt directory name.
pub const SPAWN_DIR: &str = "spawn";
/// Log sink directory name.
pub const LOGS_DIR: &str = "logs";
/// Die marker file name.
pub const DIE_MARKER: &str = "die";
/// Tombstone marker file name.
pub const TOMBSTONE_MARKER: &str = "tombstone";
/// Boot record file name inside a pod.
pub const BOOT_RECORD: &str = "boot.json";
/// Stem of the canonical tree snapshot.
pub const SNAPSHOT_STEM: &str = "agent_tree_master";

/// Fixed directory layout shared by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommLayout {
    comm_root: PathBuf,
    pod_root: PathBuf,
    orchestrator_id: String,
    snapshot_ext: String,
}

impl CommLayout {
    /// Create a layout rooted at the given directories.
    pub fn new(
        comm_root: impl Into<PathBuf>,
        pod_root: impl Into<PathBuf>,
        orchestrator_id: impl Into<String>,
    ) -> Self {
        Self {
            comm_root: comm_root.into(),
            pod_root: pod_root.into(),
            orchestrator_id: orchestrator_id.into(),
            snapshot_ext: "json".to_string(),
        }
    }

    /// Use a different snapshot extension (`json` or `yaml`).
    pub fn with_snapshot_ext(mut self, ext: impl Into<String>) -> Self {
        self.snapshot_ext = ext.into();
        self
    }

    pub fn comm_root(&self) -> &Path {
        &self.comm_root
    }

    pub fn pod_root(&self) -> &Path {
        &self.pod_root
    }

    pub fn orchestrator_id(&self) -> &str {
        &self.orchestrator_id
    }

    /// Reject ids that cannot safely be used as a single path component.
    pub fn validate_id(id: &str) -> Result<(), CommError> {
        let bad = id.is_empty()
            || id == "."
            || id == ".."
            || id.starts_with('.')
            || id.contains('/')
            || id.contains('\\')
            || id.contains('\0');
        if bad {
            return Err(CommError::InvalidId(id.to_string()));
        }
        Ok(())
    }

    /// Root of the comm channel for `id`.
    pub fn channel(&self, id: &str) -> PathBuf {
        self.comm_root.join(id)
    }

    pub fn hello_dir(&self, id: &str) -> PathBuf {
        self.channel(id).join(HELLO_DIR)
    }

    pub fn incoming_dir(&self, id: &str) -> PathBuf {
        self.channel(id).join(INCOMING_DIR)
    }

    pub fn payload_dir(&self, id: &str) -> PathBuf {
        self.channel(id).join(PAYLOAD_DIR)
    }

    pub fn spawn_dir(&self, id: &str) -> PathBuf {
        self.channel(id).join(SPAWN_DIR)
    }

    pub fn logs_dir(&self, id: &str) -> PathBuf {
        self.channel(id).join(LOGS_DIR)
    }

    pub fn die_marker(&self, id: &str) -> PathBuf {
        self.incoming_dir(id).join(DIE_MARKER)
    }

    pub fn tombstone(&self, id: &str) -> PathBuf {
        self.incoming_dir(id).join(TOMBSTONE_MARKER)
    }

    pub fn pod_dir(&self, instance_id: &str) -> PathBuf {
        self.pod_root.join(instance_id)
    }

    pub fn boot_record(&self, instance_id: &str) -> PathBuf {
        self.pod_dir(instance_id).join(BOOT_RECORD)
    }

    pub fn pod_tombstone(&self, instance_id: &str) -> PathBuf {
        self.pod_dir(instance_id).join(TOMBSTONE_MARKER)
    }

    /// Path of the canonical tree snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.channel(&self.orchestrator_id)
            .join(format!("{}.{}", SNAPSHOT_STEM, self.snapshot_ext))
    }

    /// Create the standard directories of a comm channel.
    ///
    /// Idempotent: an existing channel is left as is.
    pub fn ensure_channel(&self, id: &str) -> Result<PathBuf, CommError> {
        Self::validate_id(id)?;
        for dir in [
            self.hello_dir(id),
            self.incoming_dir(id),
            self.payload_dir(id),
            self.spawn_dir(id),
            self.logs_dir(id),
        ] {
            fs::create_dir_all(&dir).map_err(|e| CommError::io(&dir, e))?;
        }
        Ok(self.channel(id))
    }

    /// Create the working directory of a runtime instance.
    pub fn ensure_pod(&self, instance_id: &str) -> Result<PathBuf, CommError> {
        Self::validate_id(instance_id)?;
        let dir = self.pod_dir(instance_id);
        fs::create_dir_all(&dir).map_err(|e| CommError::io(&dir, e))?;
        Ok(dir)
    }

    pub fn has_die_marker(&self, id: &str) -> bool {
        self.die_marker(id).exists()
    }

    pub fn has_tombstone(&self, id: &str) -> bool {
        self.tombstone(id).exists()
    }

    /// Drop a die marker into the agent's command inbox.
    pub fn write_die_marker(&self, id: &str, reason: &str) -> Result<(), CommError> {
        Self::validate_id(id)?;
        touch_marker(&self.die_marker(id), reason)
    }

    /// Drop a do-not-resurrect marker into the agent's command inbox.
    pub fn write_tombstone(&self, id: &str, reason: &str) -> Result<(), CommError> {
        Self::validate_id(id)?;
        touch_marker(&self.tombstone(id), reason)
    }

    /// Drop a do-not-resurrect marker into a pod directory.
    pub fn write_pod_tombstone(&self, instance_id: &str, reason: &str) -> Result<(), CommError> {
        Self::validate_id(instance_id)?;
        touch_marker(&self.pod_tombstone(instance_id), reason)
    }

    /// Remove the die marker. Returns whether one existed.
    pub fn clear_die_marker(&self, id: &str) -> Result<bool, CommError> {
        remove_if_exists(&self.die_marker(id))
    }

    /// Remove both the die marker and the tombstone.
    pub fn clear_markers(&self, id: &str) -> Result<(), CommError> {
        remove_if_exists(&self.die_marker(id))?;
        remove_if_exists(&self.tombstone(id))?;
        Ok(())
    }

    /// Ids that currently own a comm channel.
    pub fn list_channel_ids(&self) -> Vec<String> {
        list_dir_names(&self.comm_root)
    }

    /// Instance ids that currently own a pod directory.
    pub fn list_pod_ids(&self) -> Vec<String> {
        list_dir_names(&self.pod_root)
    }

    /// Delete a comm channel. Only used when the agent leaves the tree.
    pub fn remove_channel(&self, id: &str) -> Result<(), CommError> {
        Self::validate_id(id)?;
        remove_dir_if_exists(&self.channel(id))
    }

    /// Delete a pod directory.
    pub fn remove_pod(&self, instance_id: &str) -> Result<(), CommError> {
        Self::validate_id(instance_id)?;
        remove_dir_if_exists(&self.pod_dir(instance_id))
    }
}

fn list_dir_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), CommError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CommError::io(dir, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(temp: &TempDir) -> CommLayout {
        CommLayout::new(temp.path().join("comm"), temp.path().join("pod"), "matrix")
    }

    #[test]
    fn test_paths() {
        let layout = CommLayout::new("/c", "/p", "matrix");
        assert_eq!(layout.die_marker("a"), PathBuf::from("/c/a/incoming/die"));
        assert_eq!(layout.hello_dir("a"), PathBuf::from("/c/a/hello.moto"));
        assert_eq!(layout.boot_record("i1"), PathBuf::from("/p/i1/boot.json"));
        assert_eq!(
            layout.snapshot_path(),
            PathBuf::from("/c/matrix/agent_tree_master.json")
        );
    }

    #[test]
    fn test_validate_id() {
        assert!(CommLayout::validate_id("watchdog-1").is_ok());
        assert!(CommLayout::validate_id("").is_err());
        assert!(CommLayout::validate_id("..").is_err());
        assert!(CommLayout::validate_id("a/b").is_err());
        assert!(CommLayout::validate_id(".hidden").is_err());
    }

    #[test]
    fn test_ensure_channel_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        layout.ensure_channel("a").unwrap();
        layout.ensure_channel("a").unwrap();
        assert!(layout.incoming_dir("a").is_dir());
        assert!(layout.payload_dir("a").is_dir());
        assert!(layout.spawn_dir("a").is_dir());
        assert_eq!(layout.list_channel_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn test_markers() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        layout.ensure_channel("a").unwrap();
        assert!(!layout.has_die_marker("a"));

        layout.write_die_marker("a", "test").unwrap();
        layout.write_tombstone("a", "test").unwrap();
        assert!(layout.has_die_marker("a"));
        assert!(layout.has_tombstone("a"));

        layout.clear_markers("a").unwrap();
        assert!(!layout.has_die_marker("a"));
        assert!(!layout.has_tombstone("a"));
    }

    #[test]
    fn test_remove_channel_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp);
        assert!(layout.remove_channel("ghost").is_ok());
        assert!(layout.remove_pod("ghost").is_ok());
    }
}
