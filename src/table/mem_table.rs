//! Memory-only table backend
//!
//! Same semantics as [`DiskTable`](super::DiskTable), backed by a substrate
//! store without files. Durability comes from the partition's snapshot and
//! binlog; checkpoints still export a loadable on-disk store.

use super::base::TableCore;
use super::{GcStats, Table, TableEntry, TableIterator, TraverseIterator};
use crate::catalog::{IndexCatalog, TableMeta};
use crate::storage::kv::KvStore;
use crate::types::{Dimension, TsDimension};
use crate::{Result, StorageError};
use std::path::Path;
use tracing::debug;

pub struct MemTable {
    core: TableCore,
}

impl MemTable {
    pub fn new(meta: TableMeta, max_traverse_cnt: u64) -> Result<Self> {
        Ok(Self {
            core: TableCore::new(meta, max_traverse_cnt)?,
        })
    }
}

impl Table for MemTable {
    fn meta(&self) -> &TableMeta {
        self.core.meta()
    }

    fn catalog(&self) -> &IndexCatalog {
        self.core.catalog()
    }

    fn init(&self) -> Result<()> {
        // retention runs through GC only, compaction filters are not needed
        let store = KvStore::open_in_memory(self.core.descriptors(false))?;
        self.core.attach(store)?;
        debug!(tid = self.core.meta().tid, pid = self.core.meta().pid, "memory table created");
        Ok(())
    }

    fn load(&self) -> Result<()> {
        Err(StorageError::InvalidState(
            "memory tables have no storage to load, recover them from snapshot and binlog".into(),
        ))
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
