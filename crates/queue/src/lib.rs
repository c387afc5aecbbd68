// SPDX-License-Identifier: PolyForm-Shield-1.0

//! The durable queue of pending deliveries addressed to currently-absent
//! integrations.
//!
//! The source this broker was rewritten from pickled the queue to disk,
//! which is neither portable nor safe. This version uses a length-prefixed
//! binary log instead: each record is a four-byte big-endian length
//! followed by a bincode-encoded [`QueueRecord`] carrying an explicit
//! version byte, so the format can be changed later without breaking
//! readers of old files outright.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use protocol::PendingDelivery;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CURRENT_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue file {0} is truncated mid-record")]
    Truncated(String),
    #[error("unsupported queue record version {0}")]
    UnsupportedVersion(u8),
}

/// One persisted record: a target integration name and its JSON payload,
/// stored as raw bytes so a future format change can swap the payload
/// encoding without touching the framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRecord {
    version: u8,
    target: String,
    payload: Vec<u8>,
}

impl QueueRecord {
    fn from_delivery(delivery: &PendingDelivery) -> Result<Self> {
        let payload = serde_json::to_vec(&delivery.payload)
            .context("failed to serialize pending delivery payload to JSON")?;
        Ok(Self {
            version: CURRENT_VERSION,
            target: delivery.target_integration_name.clone(),
            payload,
        })
    }

    fn into_delivery(self) -> Result<PendingDelivery> {
        if self.version != CURRENT_VERSION {
            return Err(QueueError::UnsupportedVersion(self.version).into());
        }
        let payload = serde_json::from_slice(&self.payload)
            .context("failed to parse pending delivery payload as JSON")?;
        Ok(PendingDelivery {
            target_integration_name: self.target,
            payload,
        })
    }
}

/// A file-backed FIFO of [`PendingDelivery`] entries.
pub struct DurableQueue {
    path: PathBuf,
}

impl DurableQueue {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Restore all records from disk, in enqueue order. Returns an empty
    /// list if the file does not exist yet.
    pub fn load(&self) -> Result<Vec<PendingDelivery>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut file = fs::File::open(&self.path)
            .with_context(|| format!("failed to open queue file {}", self.path.display()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .with_context(|| format!("failed to read queue file {}", self.path.display()))?;

        decode_records(&bytes)?
            .into_iter()
            .map(QueueRecord::into_delivery)
            .collect()
    }

    /// Rewrite the entire file to match `items`, atomically. Called on
    /// every enqueue and on successful drain, per the broker's
    /// write-on-every-mutation policy.
    pub fn save(&self, items: &[PendingDelivery]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create parent dir {} for queue", parent.display())
                })?;
            }
        }

        let mut bytes = Vec::new();
        for item in items {
            let record = QueueRecord::from_delivery(item)?;
            let encoded =
                bincode::serialize(&record).context("failed to bincode-encode queue record")?;
            bytes.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            bytes.extend_from_slice(&encoded);
        }

        let tmp_path = self.path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp_path).with_context(|| {
                format!("failed to create temporary queue file {}", tmp_path.display())
            })?;
            file.write_all(&bytes).with_context(|| {
                format!("failed to write temporary queue file {}", tmp_path.display())
            })?;
            file.sync_all().with_context(|| {
                format!("failed to sync temporary queue file {}", tmp_path.display())
            })?;
        }

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename temporary queue file {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }
}

fn decode_records(bytes: &[u8]) -> Result<Vec<QueueRecord>> {
    let mut records = Vec::new();
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        if cursor + 4 > bytes.len() {
            return Err(QueueError::Truncated(format!("offset {cursor}")).into());
        }
        let len = u32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;

        if cursor + len > bytes.len() {
            return Err(QueueError::Truncated(format!("offset {cursor}")).into());
        }
        let record: QueueRecord = bincode::deserialize(&bytes[cursor..cursor + len])
            .context("failed to bincode-decode queue record")?;
        cursor += len;

        records.push(record);
    }

    Ok(records)
}
