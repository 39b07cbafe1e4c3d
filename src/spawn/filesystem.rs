// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Materialisation of a node's `filesystem` entries inside its comm channel.

use std::fs;
use std::path::Path;

use crate::comm::atomic_write;
use crate::error::CommError;
use crate::tree::FilesystemSpec;

/// Create the extra folders and seed files of `spec` under `channel`.
///
/// Existing files are never overwritten; seeds only apply on first spawn.
/// Paths escaping the channel are rejected.
pub fn materialize_filesystem(channel: &Path, spec: &FilesystemSpec) -> Result<(), CommError> {
    spec.validate()
        .map_err(|message| CommError::io(channel, std::io::Error::other(message)))?;

    for folder in &spec.folders {
        let dir = channel.join(folder);
        fs::create_dir_all(&dir).map_err(|e| CommError::io(&dir, e))?;
    }
    for (file, content) in &spec.files {
        let path = channel.join(file);
        if !path.exists() {
            atomic_write(&path, content.as_bytes())?;
        }
    }
    Ok(())
}
