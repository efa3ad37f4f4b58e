//! CURRENT version file and WAL of the kv store

use super::batch::BatchOp;
use super::sstable::parse_table_name;
use crate::storage::atomic_file;
use crate::storage::frame::{FrameReader, ReadOutcome};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

pub(crate) const CURRENT_FILE: &str = "CURRENT";
pub(crate) const WAL_FILE: &str = "WAL";

/// Durable layout of a store: the SSTables of every column family, and
/// the sequence up to which they hold all committed batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoreVersion {
    pub flushed_seq: u64,
    pub next_table_id: u64,
    pub column_families: Vec<String>,
    /// Table ids per column family, newest first
    pub tables: Vec<Vec<u64>>,
}

impl StoreVersion {
    pub fn new(column_families: Vec<String>) -> Self {
        Self {
            flushed_seq: 0,
            next_table_id: 1,
            tables: vec![Vec::new(); column_families.len()],
            column_families,
        }
    }

    pub fn allocate_table_id(&mut self) -> u64 {
        let id = self.next_table_id;
        self.next_table_id += 1;
        id
    }

    fn referenced(&self) -> HashSet<u64> {
        self.tables.iter().flatten().copied().collect()
    }
}

/// Atomically replace CURRENT
pub(crate) fn store_version(dir: &Path, version: &StoreVersion, sync: bool) -> Result<()> {
    atomic_file::write_atomic(&dir.join(CURRENT_FILE), &serde_json::to_vec_pretty(version)?, sync)
}

pub(crate) fn load_version(dir: &Path) -> Result<StoreVersion> {
    let path = dir.join(CURRENT_FILE);
    let raw = std::fs::read(&path)?;
    let version: StoreVersion = serde_json::from_slice(&raw)
        .map_err(|e| StorageError::Corruption(format!("{}: {}", path.display(), e)))?;
    if version.tables.len() != version.column_families.len()
        || version.referenced().iter().any(|&id| id >= version.next_table_id)
    {
        return Err(StorageError::Corruption(format!(
            "{}: inconsistent table list",
            path.display()
        )));
    }
    Ok(version)
}

/// Delete SSTables CURRENT does not reference: outputs of an interrupted
/// flush or merge, and inputs of a finished merge
pub(crate) fn remove_unreferenced_tables(dir: &Path, version: &StoreVersion) -> Result<usize> {
    let live = version.referenced();
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(id) = entry.file_name().to_str().and_then(parse_table_name) else {
            continue;
        };
        if !live.contains(&id) {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Serialized form of one committed batch
#[derive(Serialize)]
pub(crate) struct WalRecordRef<'a> {
    pub seq: u64,
    pub ops: &'a [BatchOp],
}

#[derive(Deserialize)]
struct WalRecord {
    seq: u64,
    ops: Vec<BatchOp>,
}

/// Hand WAL batches newer than `after_seq` to `apply`, in order.
/// Returns (last sequence, batches applied).
pub(crate) fn replay_wal<F>(dir: &Path, after_seq: u64, mut apply: F) -> Result<(u64, u64)>
where
    F: FnMut(u64, &[BatchOp]) -> Result<()>,
{
    let path = dir.join(WAL_FILE);
    if !path.exists() {
        return Ok((after_seq, 0));
    }

    let mut reader = FrameReader::open(&path)?;
    let mut last = after_seq;
    let mut applied = 0;
    loop {
        match reader.read_next::<WalRecord>()? {
            ReadOutcome::Record(record) => {
                if record.seq <= last {
                    continue;
                }
                apply(record.seq, &record.ops)?;
                last = record.seq;
                applied += 1;
            }
            ReadOutcome::End => break,
            other => {
                warn!(
                    wal = %path.display(),
                    last_seq = last,
                    "stopping wal replay at damaged tail: {}",
                    describe(&other)
                );
                break;
            }
        }
    }
    Ok((last, applied))
}

fn describe<T>(outcome: &ReadOutcome<T>) -> String {
    match outcome {
        ReadOutcome::Record(_) => "unexpected record".to_string(),
        ReadOutcome::End => "end of file".to_string(),
        ReadOutcome::Truncated { offset } => format!("truncated frame at byte {}", offset),
        ReadOutcome::Corrupt { offset, reason } => format!("corrupt frame at byte {}: {}", offset, reason),
    }
}
