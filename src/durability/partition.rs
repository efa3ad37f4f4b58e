//! One table partition: table + binlog + snapshot
//!
//! Every mutation is validated, appended to the binlog, then applied to the
//! table, all under the partition's write lock so binlog order and apply
//! order agree.
//!
//! Index status and TTL changes are not binlog entries. They are kept in
//! `{partition}/table_meta.json`, rewritten atomically on every change and
//! preferred over the caller's metadata on `open`.

use super::binlog::Binlog;
use super::recovery::{self, RecoveryReport};
use super::snapshot::Snapshot;
use super::writer::BinlogWriter;
use super::{apply_entry, manifest};
use crate::catalog::{IndexStatus, TableMeta, TtlValue};
use crate::config::EngineConfig;
use crate::storage::atomic_file;
use crate::table::{DiskTable, MemTable, Table};
use crate::task_pool::TaskPool;
use crate::types::{Dimension, LogEntry, TsDimension};
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const TABLE_META_FILE: &str = "table_meta.json";

/// Read the metadata a previous run stored for this partition.
///
/// Falls back to `declared` when none is stored. A stored layout that
/// disagrees with `declared` (identity, index names or time columns) is
/// `InvalidState`.
fn load_table_meta(dir: &Path, declared: TableMeta) -> Result<TableMeta> {
    let path = dir.join(TABLE_META_FILE);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(declared),
        Err(e) => return Err(e.into()),
    };
    let stored: TableMeta = serde_json::from_slice(&raw)
        .map_err(|e| StorageError::Corruption(format!("{}: {}", path.display(), e)))?;

    let same_layout = stored.tid == declared.tid
        && stored.pid == declared.pid
        && stored.indexes.len() == declared.indexes.len()
        && stored
            .indexes
            .iter()
            .zip(&declared.indexes)
            .all(|(a, b)| a.name == b.name && a.ts_columns == b.ts_columns);
    if !same_layout {
        return Err(StorageError::InvalidState(format!(
            "{} describes a different layout of table {}_{}",
            path.display(),
            declared.tid,
            declared.pid
        )));
    }
    Ok(stored)
}

/// Storage backend of a partition's table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableBackend {
    #[default]
    Disk,
    Memory,
}

pub struct Partition {
    path: PathBuf,
    table: Arc<dyn Table>,
    snapshot: Snapshot,
    binlog: Binlog,
    writer: BinlogWriter,
    write_lock: Mutex<()>,
    sync_meta: bool,
}

impl Partition {
    fn build_table(meta: TableMeta, config: &EngineConfig, backend: TableBackend) -> Result<Arc<dyn Table>> {
        Ok(match backend {
            TableBackend::Disk => Arc::new(DiskTable::new(meta, config)?),
            TableBackend::Memory => Arc::new(MemTable::new(meta, config.max_traverse_cnt)?),
        })
    }

    fn assemble(
        path: PathBuf,
        table: Arc<dyn Table>,
        snapshot: Snapshot,
        binlog: Binlog,
        config: &EngineConfig,
        last_offset: u64,
    ) -> Self {
        let writer = BinlogWriter::new(
            binlog.dir(),
            binlog.log_parts().clone(),
            last_offset,
            &config.binlog,
            config.durability_level,
        );
        writer.set_term(snapshot.term());
        Self {
            path,
            table,
            snapshot,
            binlog,
            writer,
            write_lock: Mutex::new(()),
            sync_meta: !config.durability_level.is_no_sync(),
        }
    }

    /// Create a brand new partition. Fails with `AlreadyExists` when the
    /// partition directory already holds a snapshot, binlog or table data.
    pub fn create(meta: TableMeta, config: &EngineConfig, backend: TableBackend) -> Result<Self> {
        let path = config.partition_path(meta.tid, meta.pid);
        let binlog_dir = path.join("binlog");
        let has_binlog = binlog_dir.exists() && !super::binlog::list_segments(&binlog_dir)?.is_empty();
        if path.join("snapshot").join(manifest::MANIFEST_FILE).exists() || has_binlog {
            return Err(StorageError::AlreadyExists(path.display().to_string()));
        }

        let snapshot = Snapshot::new(config, meta.tid, meta.pid);
        let table = Self::build_table(meta, config, backend)?;
        table.init()?;
        snapshot.init()?;
        let binlog = Binlog::open(binlog_dir)?;

        info!(tid = table.tid(), pid = table.pid(), ?backend, path = %path.display(), "partition created");
        let partition = Self::assemble(path, table, snapshot, binlog, config, 0);
        partition.store_table_meta()?;
        Ok(partition)
    }

    /// Reopen a partition, rebuilding its table from snapshot and binlog.
    ///
    /// Disk tables are rebuilt from scratch: the substrate directory left by
    /// the previous run is discarded.
    pub fn open(meta: TableMeta, config: &EngineConfig, backend: TableBackend) -> Result<(Self, RecoveryReport)> {
        let path = config.partition_path(meta.tid, meta.pid);
        if !path.exists() {
            return Err(StorageError::NotFound(path.display().to_string()));
        }

        let meta = load_table_meta(&path, meta)?;
        let deleted = meta.indexes.iter().filter(|i| i.status == IndexStatus::Deleted).count();
        if deleted > 0 {
            info!(tid = meta.tid, pid = meta.pid, deleted, "stored metadata marks indexes deleted");
        }

        let data = path.join("data");
        if data.exists() {
            warn!(path = %data.display(), "discarding table data, rebuilding from snapshot and binlog");
            std::fs::remove_dir_all(&data)?;
        }

        let snapshot = Snapshot::new(config, meta.tid, meta.pid);
        let table = Self::build_table(meta, config, backend)?;
        table.init()?;
        snapshot.init()?;
        let binlog = Binlog::open(path.join("binlog"))?;

        let report = recovery::recover(table.as_ref(), &snapshot, &binlog)?;
        let partition = Self::assemble(path, table, snapshot, binlog, config, report.latest_offset);
        Ok((partition, report))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &Arc<dyn Table> {
        &self.table
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn binlog(&self) -> &Binlog {
        &self.binlog
    }

    /// Last offset written to the binlog
    pub fn offset(&self) -> u64 {
        self.writer.last_offset()
    }

    pub fn set_term(&self, term: u64) {
        self.writer.set_term(term);
        self.snapshot.set_term(term);
    }

    pub fn put(&self, pk: &[u8], ts: u64, value: &[u8]) -> Result<u64> {
        self.table.catalog().get(0)?;
        self.log_and_apply(LogEntry::put(pk, ts, value))
    }

    pub fn put_dimensions(&self, ts: u64, value: &[u8], dimensions: Vec<Dimension>) -> Result<u64> {
        if dimensions.is_empty() {
            return Err(StorageError::InvalidArgument("put without dimensions".into()));
        }
        self.table.catalog().check_dimensions(&dimensions)?;
        self.log_and_apply(LogEntry::put_dimensions(ts, value, dimensions))
    }

    pub fn put_ts_dimensions(
        &self,
        dimensions: Vec<Dimension>,
        ts_dimensions: Vec<TsDimension>,
        value: &[u8],
    ) -> Result<u64> {
        if dimensions.is_empty() || ts_dimensions.is_empty() {
            return Err(StorageError::InvalidArgument(
                "put needs at least one dimension and one ts dimension".into(),
            ));
        }
        self.table.catalog().check_dimensions(&dimensions)?;
        self.log_and_apply(LogEntry::put_ts_dimensions(dimensions, ts_dimensions, value))
    }

    pub fn delete(&self, pk: &[u8], idx: u32) -> Result<u64> {
        self.table.catalog().get(idx)?;
        self.log_and_apply(LogEntry::delete(pk, idx))
    }

    /// Metadata as the table currently sees it
    pub fn table_meta(&self) -> TableMeta {
        TableMeta {
            indexes: self.table.catalog().to_specs(),
            ..self.table.meta().clone()
        }
    }

    fn store_table_meta(&self) -> Result<()> {
        let meta = self.table_meta();
        atomic_file::write_atomic(
            &self.path.join(TABLE_META_FILE),
            &serde_json::to_vec_pretty(&meta)?,
            self.sync_meta,
        )
    }

    /// Delete an index. The deletion is persisted before it takes effect;
    /// later writes and binlog replay skip the index.
    pub fn delete_index(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let id = self.table.catalog().deletable(name)?;

        let mut meta = self.table_meta();
        meta.indexes[id as usize].status = IndexStatus::Deleted;
        atomic_file::write_atomic(
            &self.path.join(TABLE_META_FILE),
            &serde_json::to_vec_pretty(&meta)?,
            self.sync_meta,
        )?;
        self.table.delete_index(name)
    }

    /// Stage a TTL change for the next GC pass and persist it
    pub fn set_ttl(&self, idx: u32, ts_idx: Option<u32>, ttl: TtlValue) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.table.set_ttl(idx, ts_idx, ttl)?;
        self.store_table_meta()
    }

    fn log_and_apply(&self, entry: LogEntry) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let log_index = self.writer.append(entry.clone())?;
        if let Err(e) = apply_entry(self.table.as_ref(), &entry) {
            warn!(
                tid = self.table.tid(),
                pid = self.table.pid(),
                log_index,
                error = %e,
                "logged entry rejected by table"
            );
            return Err(e);
        }
        self.table.set_offset(log_index);
        Ok(log_index)
    }

    /// Snapshot the table at `end_offset`, or at its current offset when 0
    pub fn make_snapshot(&self, end_offset: u64) -> Result<u64> {
        self.snapshot.make_snapshot(self.table.as_ref(), end_offset)
    }

    /// Drop binlog segments the current snapshot fully covers
    pub fn purge_binlog(&self) -> Result<usize> {
        match self.snapshot.manifest()? {
            Some(manifest) => self.binlog.purge_before(manifest.offset),
            None => Ok(0),
        }
    }

    pub fn roll_binlog(&self) -> Result<u32> {
        self.writer.roll()
    }

    /// Queue a GC pass of the table on `pool`
    pub fn schedule_gc(&self, pool: &TaskPool) -> Result<()> {
        let table = Arc::clone(&self.table);
        pool.add_task(move || {
            if let Err(e) = table.sched_gc() {
                warn!(tid = table.tid(), pid = table.pid(), error = %e, "scheduled gc failed");
            }
        })
    }

    /// Seal the current binlog segment
    pub fn close(&self) -> Result<()> {
        self.writer.close()
    }
}
