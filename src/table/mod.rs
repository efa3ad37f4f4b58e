//! Tables: multi-index time-series storage over the ordered substrate
//!
//! A table owns one substrate column family per index. Every write is
//! fanned out into one physical entry per (dimension, time column) and
//! committed as a single atomic batch.
//!
//! Two backends share the [`Table`] contract:
//! - [`DiskTable`]: persistent, one store under `{root}/{tid}_{pid}/data`
//! - [`MemTable`]: memory-only, same semantics

mod base;
pub mod disk_table;
pub mod gc;
pub mod iterator;
pub mod mem_table;

pub use disk_table::DiskTable;
pub use gc::GcStats;
pub use iterator::{PointIterator, TraverseState, TraversingIterator};
pub use mem_table::MemTable;

use crate::catalog::{IndexCatalog, TableMeta, TtlValue};
use crate::types::{Dimension, TsDimension};
use crate::Result;
use std::path::Path;

/// Iterator over the entries of one pk, newest first
pub trait TableIterator: Send {
    /// Position at the newest entry with `ts' <= ts`
    fn seek(&mut self, ts: u64);
    fn seek_to_first(&mut self);
    fn valid(&self) -> bool;
    fn next(&mut self);
    fn value(&self) -> &[u8];
    fn pk(&self) -> &[u8];
    fn ts(&self) -> u64;
}

/// Bounded full scan of one index, skipping expired records
pub trait TraverseIterator: Send {
    /// Resume after `(pk, ts)`: position at the first live entry of `pk`
    /// strictly older than `ts`, or at a later pk
    fn seek(&mut self, pk: &[u8], ts: u64);
    fn seek_to_first(&mut self);
    fn valid(&self) -> bool;
    fn next(&mut self);
    fn value(&self) -> &[u8];
    fn pk(&self) -> &[u8];
    fn ts(&self) -> u64;
    /// Entries visited so far, counted against the traversal budget
    fn count(&self) -> u64;
}

/// One live entry, as drained by snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub idx: u32,
    /// Time column id when the index keys carry one
    pub ts_idx: Option<u8>,
    pub pk: Vec<u8>,
    pub ts: u64,
    pub value: Vec<u8>,
}

pub trait Table: Send + Sync {
    fn meta(&self) -> &TableMeta;

    fn catalog(&self) -> &IndexCatalog;

    /// Create the table's storage. Fails with `AlreadyExists` over existing data.
    fn init(&self) -> Result<()>;

    /// Reopen existing storage
    fn load(&self) -> Result<()>;

    /// Single-pk write into index 0
    fn put(&self, pk: &[u8], ts: u64, value: &[u8]) -> Result<()>;

    /// Write `value` under every dimension, all time columns sharing `ts`
    fn put_dimensions(&self, ts: u64, value: &[u8], dimensions: &[Dimension]) -> Result<()>;

    /// Write `value` under every dimension, one timestamp per time column
    fn put_ts_dimensions(
        &self,
        dimensions: &[Dimension],
        ts_dimensions: &[TsDimension],
        value: &[u8],
    ) -> Result<()>;

    /// Remove every entry of `pk` from index `idx`
    fn delete(&self, pk: &[u8], idx: u32) -> Result<()>;

    /// Exact-timestamp lookup
    fn get(&self, idx: u32, pk: &[u8], ts: u64) -> Result<Option<Vec<u8>>> {
        self.get_with_ts_idx(idx, pk, ts, None)
    }

    fn get_with_ts_idx(&self, idx: u32, pk: &[u8], ts: u64, ts_idx: Option<u32>) -> Result<Option<Vec<u8>>>;

    fn new_iterator(&self, idx: u32, pk: &[u8]) -> Result<Box<dyn TableIterator>> {
        self.new_iterator_with_ts_idx(idx, None, pk)
    }

    fn new_iterator_with_ts_idx(
        &self,
        idx: u32,
        ts_idx: Option<u32>,
        pk: &[u8],
    ) -> Result<Box<dyn TableIterator>>;

    fn new_traverse_iterator(&self, idx: u32) -> Result<Box<dyn TraverseIterator>> {
        self.new_traverse_iterator_with_ts_idx(idx, None)
    }

    fn new_traverse_iterator_with_ts_idx(
        &self,
        idx: u32,
        ts_idx: Option<u32>,
    ) -> Result<Box<dyn TraverseIterator>>;

    /// Visit every live entry of every ready index, without a traversal budget
    fn for_each_live_entry(&self, f: &mut dyn FnMut(TableEntry) -> Result<()>) -> Result<u64>;

    /// Apply staged TTL updates and run the retention policy of every index
    fn sched_gc(&self) -> Result<GcStats>;

    /// Export a point-in-time image of all indexes into `dir`
    fn create_checkpoint(&self, dir: &Path) -> Result<()>;

    /// Applied-write counter
    fn offset(&self) -> u64;

    fn set_offset(&self, offset: u64);

    /// Live entries in index 0
    fn record_count(&self) -> Result<u64>;

    fn tid(&self) -> u32 {
        self.meta().tid
    }

    fn pid(&self) -> u32 {
        self.meta().pid
    }

    fn set_ttl(&self, idx: u32, ts_idx: Option<u32>, ttl: TtlValue) -> Result<()> {
        self.catalog().set_ttl(idx, ts_idx, ttl)
    }

    fn delete_index(&self, name: &str) -> Result<()> {
        self.catalog().delete_index(name)
    }
}

/// Substrate column family name of an index
pub(crate) fn index_cf_name(idx: u32, name: &str) -> String {
    format!("idx{}_{}", idx, name)
}
