//! Persistent table backend
//!
//! One substrate store per partition at `{root}/{tid}_{pid}/data`. The
//! table metadata is kept as JSON in the `default` column family so `load`
//! can refuse a store that belongs to another table.

use super::base::TableCore;
use super::{GcStats, Table, TableEntry, TableIterator, TraverseIterator};
use crate::catalog::{IndexCatalog, TableMeta};
use crate::config::EngineConfig;
use crate::storage::kv::{KvOptions, KvStore};
use crate::types::{Dimension, TsDimension};
use crate::{Result, StorageError};
use std::path::{Path, PathBuf};
use tracing::info;

const META_KEY: &[u8] = b"table_meta";

pub struct DiskTable {
    core: TableCore,
    path: PathBuf,
    options: KvOptions,
}

impl DiskTable {
    pub fn new(meta: TableMeta, config: &EngineConfig) -> Result<Self> {
        let path = config.partition_path(meta.tid, meta.pid).join("data");
        Ok(Self {
            core: TableCore::new(meta, config.max_traverse_cnt)?,
            path,
            options: KvOptions::from_config(config),
        })
    }

    /// Directory of the substrate store
    pub fn data_path(&self) -> &Path {
        &self.path
    }

    fn check_stored_meta(&self, store: &KvStore) -> Result<()> {
        let raw = store
            .get(0, META_KEY, None)?
            .ok_or_else(|| StorageError::Corruption(format!("{}: table metadata missing", self.path.display())))?;
        let stored: TableMeta = serde_json::from_slice(&raw)?;

        let meta = self.core.meta();
        let same_indexes = stored.indexes.len() == meta.indexes.len()
            && stored
                .indexes
                .iter()
                .zip(&meta.indexes)
                .all(|(a, b)| a.name == b.name && a.ts_columns == b.ts_columns);
        if stored.tid != meta.tid || stored.pid != meta.pid || !same_indexes {
            return Err(StorageError::InvalidState(format!(
                "{} holds table {}_{} '{}', expected {}_{} '{}'",
                self.path.display(),
                stored.tid,
                stored.pid,
                stored.name,
                meta.tid,
                meta.pid,
                meta.name
            )));
        }
        Ok(())
    }
}

impl Table for DiskTable {
    fn meta(&self) -> &TableMeta {
        self.core.meta()
    }

    fn catalog(&self) -> &IndexCatalog {
        self.core.catalog()
    }

    fn init(&self) -> Result<()> {
        if self.core.is_attached() {
            return Err(StorageError::InvalidState(format!("{} is already open", self.path.display())));
        }
        let store = KvStore::open(&self.path, self.core.descriptors(true), self.options.clone().create_new())?;
        store.put(0, META_KEY, &serde_json::to_vec(self.core.meta())?)?;
        self.core.attach(store)?;
        info!(
            tid = self.core.meta().tid,
            pid = self.core.meta().pid,
            path = %self.path.display(),
            indexes = self.core.catalog().len(),
            "disk table created"
        );
        Ok(())
    }

    fn load(&self) -> Result<()> {
        if self.core.is_attached() {
            return Err(StorageError::InvalidState(format!("{} is already open", self.path.display())));
        }
        let store = KvStore::open(&self.path, self.core.descriptors(true), self.options.clone().open_existing())?;
        self.check_stored_meta(&store)?;
        self.core.attach(store)?;
        info!(
            tid = self.core.meta().tid,
            pid = self.core.meta().pid,
            path = %self.path.display(),
            "disk table loaded"
        );
        Ok(())
    }

    fn put(&self, pk: &[u8], ts: u64, value: &[u8]) -> Result<()> {
        self.core.put(pk, ts, value)
    }

    fn put_dimensions(&self, ts: u64, value: &[u8], dimensions: &[Dimension]) -> Result<()> {
        self.core.put_dimensions(ts, value, dimensions)
    }

    fn put_ts_dimensions(
        &self,
        dimensions: &[Dimension],
        ts_dimensions: &[TsDimension],
        value: &[u8],
    ) -> Result<()> {
        self.core.put_ts_dimensions(dimensions, ts_dimensions, value)
    }

    fn delete(&self, pk: &[u8], idx: u32) -> Result<()> {
        self.core.delete(pk, idx)
    }

    fn get_with_ts_idx(&self, idx: u32, pk: &[u8], ts: u64, ts_idx: Option<u32>) -> Result<Option<Vec<u8>>> {
        self.core.get(idx, pk, ts, ts_idx)
    }

    fn new_iterator_with_ts_idx(
        &self,
        idx: u32,
        ts_idx: Option<u32>,
        pk: &[u8],
    ) -> Result<Box<dyn TableIterator>> {
        self.core.new_iterator(idx, ts_idx, pk)
    }

    fn new_traverse_iterator_with_ts_idx(
        &self,
        idx: u32,
        ts_idx: Option<u32>,
    ) -> Result<Box<dyn TraverseIterator>> {
        self.core.new_traverse_iterator(idx, ts_idx)
    }

    fn for_each_live_entry(&self, f: &mut dyn FnMut(TableEntry) -> Result<()>) -> Result<u64> {
        self.core.for_each_live_entry(f)
    }

    fn sched_gc(&self) -> Result<GcStats> {
        self.core.sched_gc()
    }

    fn create_checkpoint(&self, dir: &Path) -> Result<()> {
        self.core.create_checkpoint(dir)
    }

    fn offset(&self) -> u64 {
        self.core.offset()
    }

    fn set_offset(&self, offset: u64) {
        self.core.set_offset(offset)
    }

    fn record_count(&self) -> Result<u64> {
        self.core.record_count()
    }
}
