// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Boot records and spawn receipts.
//!
//! A boot record lives in the pod directory and describes the one process
//! that owns it. A spawn receipt is appended to the comm channel on every
//! launch and is kept for forensic matching after the pod is gone.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::comm::{atomic_write_json, is_temp_name, read_json, CommLayout};
use crate::error::CommError;

/// `<pod_root>/<instance_id>/boot.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootRecord {
    /// Logical agent id.
    pub id: String,
    pub instance_id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub pid: u32,
    /// Exact argv the process was launched with.
    pub launch_command: Vec<String>,
    pub boot_time: DateTime<Utc>,
}

/// `<comm_root>/<id>/spawn/<timestamp>_<instance_id>.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnReceipt {
    pub id: String,
    pub instance_id: String,
    pub pid: u32,
    pub launch_command: Vec<String>,
    pub spawned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl From<&SpawnReceipt> for BootRecord {
    fn from(receipt: &SpawnReceipt) -> Self {
        Self {
            id: receipt.id.clone(),
            instance_id: receipt.instance_id.clone(),
            agent_type: String::new(),
            pid: receipt.pid,
            launch_command: receipt.launch_command.clone(),
            boot_time: receipt.spawned_at,
        }
    }
}

pub fn write_boot_record(layout: &CommLayout, record: &BootRecord) -> Result<(), CommError> {
    atomic_write_json(&layout.boot_record(&record.instance_id), record)
}

pub fn read_boot_record(layout: &CommLayout, instance_id: &str) -> Option<BootRecord> {
    match read_json(&layout.boot_record(instance_id)) {
        Ok(record) => record,
        Err(e) => {
            debug!(instance_id = %instance_id, error = %e, "Unreadable boot record");
            None
        }
    }
}

/// Every readable boot record under the pod root, ordered by boot time.
pub fn read_boot_records(layout: &CommLayout) -> Vec<BootRecord> {
    let mut records: Vec<BootRecord> = layout
        .list_pod_ids()
        .iter()
        .filter_map(|instance| read_boot_record(layout, instance))
        .collect();
    records.sort_by_key(|r| r.boot_time);
    records
}

/// Boot records of the runtime instances of one logical id.
pub fn boot_records_for(layout: &CommLayout, id: &str) -> Vec<BootRecord> {
    read_boot_records(layout)
        .into_iter()
        .filter(|r| r.id == id)
        .collect()
}

/// Append a receipt to the agent's spawn history.
pub fn write_receipt(layout: &CommLayout, receipt: &SpawnReceipt) -> Result<PathBuf, CommError> {
    let name = format!(
        "{}_{}.json",
        receipt.spawned_at.format("%Y%m%d%H%M%S%6f"),
        receipt.instance_id
    );
    let path = layout.spawn_dir(&receipt.id).join(name);
    atomic_write_json(&path, receipt)?;
    Ok(path)
}

/// Spawn history of `id`, oldest first.
pub fn list_receipts(layout: &CommLayout, id: &str) -> Vec<SpawnReceipt> {
    let Ok(entries) = fs::read_dir(layout.spawn_dir(id)) else {
        return Vec::new();
    };
    let mut receipts: Vec<SpawnReceipt> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !is_temp_name(n) && n.ends_with(".json"))
                .unwrap_or(false)
        })
        .filter_map(|p| read_json::<SpawnReceipt>(&p).ok().flatten())
        .collect();
    receipts.sort_by_key(|r| r.spawned_at);
    receipts
}

pub fn latest_receipt(layout: &CommLayout, id: &str) -> Option<SpawnReceipt> {
    list_receipts(layout, id).pop()
}
