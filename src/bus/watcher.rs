// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! OS file-change notifications for inboxes.
//!
//! A watcher wakes its poller as soon as a finished message file lands in
//! the inbox, whichever process wrote it. Temp files and removals are
//! ignored. The poller keeps its interval as the fallback, so a lost event
//! or an unsupported filesystem only costs latency.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::BusError;

use super::delivery::is_message_file;

/// Keeps an inbox watch alive until dropped.
pub struct InboxWatcher {
    dir: PathBuf,
    _watcher: RecommendedWatcher,
}

impl fmt::Debug for InboxWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboxWatcher").field("dir", &self.dir).finish()
    }
}

impl InboxWatcher {
    /// Watch `dir` (created if missing) and notify `wake` on every new message.
    pub fn watch(dir: &Path, wake: Arc<Notify>) -> Result<Self, BusError> {
        fs::create_dir_all(dir)
            .map_err(|e| BusError::WatchFailed(format!("{}: {}", dir.display(), e)))?;

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| match event {
            Ok(event) if announces_message(&event) => {
                trace!(paths = ?event.paths, "Inbox changed");
                wake.notify_one();
            }
            Ok(_) => {}
            Err(e) => {
                // Overflow or a backend error: wake once so the poller rescans.
                debug!(error = %e, "Inbox watch error");
                wake.notify_one();
            }
        })
        .map_err(|e| BusError::WatchFailed(e.to_string()))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| BusError::WatchFailed(format!("{}: {}", dir.display(), e)))?;

        debug!(dir = %dir.display(), "Watching inbox");
        Ok(Self {
            dir: dir.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// A finished message appeared: created, written or renamed into place.
fn announces_message(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any | EventKind::Other
    ) && event.paths.iter().any(|p| is_message_file(p))
}
