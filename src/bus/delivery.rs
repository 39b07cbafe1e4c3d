// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Packet delivery boundary.
//!
//! The bus only ever asks for "deliver this envelope to agent X" and
//! "give me the next envelope addressed to me". Encoding, encryption and
//! signing live behind [`PacketDelivery`]; [`FsDelivery`] is the plain JSON
//! implementation over the comm layout.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::comm::{atomic_write, is_temp_name, CommLayout};
use crate::error::BusError;

use super::envelope::{Channel, Envelope};

/// Extension of message files. Anything else in an inbox is ignored.
pub const MESSAGE_EXT: &str = "json";

/// Upper bound on messages taken from one inbox per call.
pub const MAX_BATCH: usize = 256;

#[async_trait]
pub trait PacketDelivery: Send + Sync {
    /// Drop `envelope` into `target_id`'s inbox for `zone`.
    async fn deliver(&self, target_id: &str, envelope: &Envelope, zone: Channel) -> Result<(), BusError>;

    /// Take the next envelope addressed to `self_id`.
    ///
    /// The message is removed before it is returned. A malformed message is
    /// removed too and reported as [`BusError::Malformed`].
    async fn receive(&self, self_id: &str, zone: Channel) -> Result<Option<Envelope>, BusError>;

    /// Take everything currently waiting, up to [`MAX_BATCH`].
    async fn receive_all(&self, self_id: &str, zone: Channel) -> Vec<Result<Envelope, BusError>> {
        let mut out = Vec::new();
        while out.len() < MAX_BATCH {
            match self.receive(self_id, zone).await {
                Ok(Some(envelope)) => out.push(Ok(envelope)),
                Ok(None) => break,
                Err(e @ BusError::Malformed { .. }) => out.push(Err(e)),
                Err(e) => {
                    out.push(Err(e));
                    break;
                }
            }
        }
        out
    }
}

/// Plain JSON files, written atomically into the target's inbox.
#[derive(Debug)]
pub struct FsDelivery {
    layout: CommLayout,
    wakers: RwLock<HashMap<(String, Channel), Arc<Notify>>>,
}

impl FsDelivery {
    pub fn new(layout: CommLayout) -> Self {
        Self {
            layout,
            wakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &CommLayout {
        &self.layout
    }

    /// Wake `notify` whenever this process delivers to `id`'s `zone` inbox.
    pub fn register_waker(&self, id: &str, zone: Channel, notify: Arc<Notify>) {
        let mut wakers = self.wakers.write().unwrap_or_else(|p| p.into_inner());
        wakers.insert((id.to_string(), zone), notify);
    }

    fn wake(&self, id: &str, zone: Channel) {
        let wakers = self.wakers.read().unwrap_or_else(|p| p.into_inner());
        if let Some(notify) = wakers.get(&(id.to_string(), zone)) {
            notify.notify_one();
        }
    }

    /// Finished message files in `dir`, oldest name first.
    fn pending(dir: &Path) -> Result<Vec<PathBuf>, BusError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BusError::DeliveryFailed(format!("{}: {}", dir.display(), e))),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| is_message_file(p))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Read, delete, then parse one file. `Ok(None)` if someone else took it.
    fn take(path: &Path) -> Result<Option<Envelope>, BusError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BusError::DeliveryFailed(format!("{}: {}", path.display(), e))),
        };
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BusError::DeliveryFailed(format!("{}: {}", path.display(), e))),
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| BusError::Malformed {
                file: path.display().to_string(),
                message: e.to_string(),
            })
    }
}

/// `*.json`, not an in-flight temp file.
pub fn is_message_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !is_temp_name(name) && path.extension().and_then(|e| e.to_str()) == Some(MESSAGE_EXT)
}

/// `<timestamp>_<random>.json`, sortable by creation time.
pub fn message_file_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}.{}",
        Utc::now().format("%Y%m%d%H%M%S%6f"),
        &suffix[..8],
        MESSAGE_EXT
    )
}

#[async_trait]
impl PacketDelivery for FsDelivery {
    async fn deliver(&self, target_id: &str, envelope: &Envelope, zone: Channel) -> Result<(), BusError> {
        CommLayout::validate_id(target_id)?;
        let path = zone.dir(&self.layout, target_id).join(message_file_name());
        let bytes = serde_json::to_vec_pretty(envelope)?;
        atomic_write(&path, &bytes)?;
        debug!(target = %target_id, channel = %zone, kind = %envelope.kind, "Delivered message");
        self.wake(target_id, zone);
        Ok(())
    }

    async fn receive(&self, self_id: &str, zone: Channel) -> Result<Option<Envelope>, BusError> {
        for path in Self::pending(&zone.dir(&self.layout, self_id))? {
            match Self::take(&path)? {
                Some(envelope) => return Ok(Some(envelope)),
                None => continue,
            }
        }
        Ok(None)
    }

    async fn receive_all(&self, self_id: &str, zone: Channel) -> Vec<Result<Envelope, BusError>> {
        let files = match Self::pending(&zone.dir(&self.layout, self_id)) {
            Ok(files) => files,
            Err(e) => return vec![Err(e)],
        };
        files
            .iter()
            .take(MAX_BATCH)
            .filter_map(|path| Self::take(path).transpose())
            .collect()
    }
}
