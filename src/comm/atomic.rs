// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Atomic file primitives.
//!
//! Every file another process may read is written to a temporary sibling,
//! flushed to disk and renamed over the target. Readers therefore observe
//! either the previous complete file or the new complete file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::CommError;

/// Suffix used for in-flight temporary files.
pub const TEMP_SUFFIX: &str = ".tmp";

const NONCE_LEN: usize = 12;

/// Build the temporary sibling path used while writing `path`.
///
/// Shape: `.<name>.<pid>.<micros>.<nonce>.tmp`. The nonce keeps concurrent
/// writers of one target in one process apart.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let nonce = Uuid::new_v4().simple().to_string();
    path.with_file_name(format!(
        ".{}.{}.{}.{}{}",
        name,
        pid,
        ts,
        &nonce[..NONCE_LEN],
        TEMP_SUFFIX
    ))
}

/// Check whether a file name belongs to an in-flight temporary file.
///
/// Only names built by [`temp_path_for`] match; other dot-files are
/// ordinary files.
pub fn is_temp_name(name: &str) -> bool {
    let Some(inner) = name
        .strip_prefix('.')
        .and_then(|n| n.strip_suffix(TEMP_SUFFIX))
    else {
        return false;
    };
    let mut parts = inner.rsplitn(4, '.');
    let (Some(nonce), Some(ts), Some(pid), Some(target)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    !target.is_empty()
        && nonce.len() == NONCE_LEN
        && nonce.bytes().all(|b| b.is_ascii_hexdigit())
        && is_number(ts)
        && is_number(pid)
}

fn is_number(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Write bytes to `path` atomically (temp file, fsync, rename, fsync dir).
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CommError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CommError::io(parent, e))?;
    }

    let tmp = temp_path_for(path);
    let result = write_and_rename(&tmp, path, bytes);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn write_and_rename(tmp: &Path, path: &Path, bytes: &[u8]) -> Result<(), CommError> {
    let mut file = fs::File::create(tmp).map_err(|e| CommError::io(tmp, e))?;
    file.write_all(bytes).map_err(|e| CommError::io(tmp, e))?;
    file.sync_all().map_err(|e| CommError::io(tmp, e))?;
    fs::rename(tmp, path).map_err(|e| CommError::io(path, e))
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CommError> {
    let content = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &content)
}

/// Read and parse a JSON file, returning `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CommError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CommError::io(path, e)),
    }
}

/// Create (or refresh) a marker file whose presence is the signal.
pub fn touch_marker(path: &Path, reason: &str) -> Result<(), CommError> {
    atomic_write(path, reason.as_bytes())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool, CommError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CommError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_parents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a").join("b").join("file.json");
        atomic_write(&path, b"{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();

        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["snapshot.json".to_string()]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn test_temp_names_are_hidden() {
        let tmp = temp_path_for(Path::new("/x/incoming/cmd.json"));
        let name = tmp.file_name().unwrap().to_str().unwrap();
        assert!(is_temp_name(name));
        assert!(!is_temp_name("cmd.json"));
    }

    #[test]
    fn test_plain_dot_files_are_not_temp() {
        assert!(!is_temp_name(".seed.json"));
        assert!(!is_temp_name(".hidden"));
        assert!(!is_temp_name(".notes.tmp"));
        assert!(!is_temp_name(".a.b.c.tmp"));
        assert!(!is_temp_name("cmd.json.123.456.abcdefabcdef.tmp"));
        assert!(is_temp_name(".cmd.json.123.456.abcdefabcdef.tmp"));
    }

    #[test]
    fn test_temp_paths_are_unique_per_call() {
        let target = Path::new("/x/incoming/die");
        let names: std::collections::HashSet<PathBuf> =
            (0..64).map(|_| temp_path_for(target)).collect();
        assert_eq!(names.len(), 64);
    }

    #[test]
    fn test_concurrent_writers_of_one_target() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("die");
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let body = format!("writer-{}", i).repeat(512);
                    atomic_write(&path, body.as_bytes()).map(|_| body)
                })
            })
            .collect();
        let bodies: Vec<String> = writers
            .into_iter()
            .map(|w| w.join().unwrap().unwrap())
            .collect();

        let content = fs::read_to_string(&path).unwrap();
        assert!(bodies.contains(&content));
        let leftovers = fs::read_dir(temp.path())
            .unwrap()
            .filter(|e| is_temp_name(&e.as_ref().unwrap().file_name().to_string_lossy()))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_read_json_missing() {
        let temp = TempDir::new().unwrap();
        let value: Option<serde_json::Value> = read_json(&temp.path().join("nope.json")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_remove_if_exists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("die");
        touch_marker(&path, "stop").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
