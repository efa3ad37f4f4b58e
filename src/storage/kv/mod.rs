//! Ordered key-value substrate
//!
//! A compact multi-version store with the capabilities the table layer
//! builds on:
//!
//! - named column families, each an ordered map of byte keys
//! - sequence-numbered versions with RAII read snapshots ([`KvSnapshot`])
//! - atomic [`WriteBatch`] commits (puts and range deletes)
//! - a per-column-family [`CompactionFilter`] consulted whenever SSTables merge
//! - a log-structured layout on disk: a WAL of committed batches, memtables
//!   flushed to immutable SSTables once they outgrow `memtable_size`, and
//!   SSTables merged once a family holds more than `max_tables`
//! - offline checkpoints ([`KvStore::create_checkpoint`])
//!
//! ## On-disk layout
//!
//! ```text
//! {path}/CURRENT              JSON: flushed sequence, SSTable ids per family
//! {path}/{id:08}.sst          frames: block*, index, then a fixed footer
//! {path}/WAL                  frames: one batch per record, newer than CURRENT
//! ```

mod batch;
mod iter;
mod merge;
mod persist;
mod sstable;
mod store;

pub use batch::{BatchOp, WriteBatch};
pub use iter::KvIterator;
pub use store::{CompactionStats, KvSnapshot, KvStore};

use crate::config::{DurabilityLevel, EngineConfig};
use std::fmt;
use std::sync::Arc;

/// Index of a column family inside one store
pub type CfHandle = usize;

/// Name of the column family every store carries for metadata
pub const DEFAULT_CF: &str = "default";

/// Verdict of a compaction filter for one live entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    Remove,
}

/// Hook consulted for every surviving entry during compaction
pub trait CompactionFilter: Send + Sync {
    fn name(&self) -> &str;

    fn filter(&self, key: &[u8], value: &[u8]) -> FilterDecision;
}

/// Column family declaration passed to [`KvStore::open`]
#[derive(Clone)]
pub struct ColumnFamilyDescriptor {
    pub name: String,
    pub compaction_filter: Option<Arc<dyn CompactionFilter>>,
}

impl ColumnFamilyDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compaction_filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn CompactionFilter>) -> Self {
        self.compaction_filter = Some(filter);
        self
    }
}

impl fmt::Debug for ColumnFamilyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnFamilyDescriptor")
            .field("name", &self.name)
            .field(
                "compaction_filter",
                &self.compaction_filter.as_ref().map(|filter| filter.name()),
            )
            .finish()
    }
}

/// Open options
#[derive(Debug, Clone)]
pub struct KvOptions {
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    pub disable_wal: bool,
    pub durability: DurabilityLevel,
    /// Memtable bytes that trigger a flush. 0 flushes only on compaction
    /// and close.
    pub memtable_size: usize,
    pub max_tables: usize,
    /// Decoded blocks kept in memory, 0 disables the cache
    pub block_cache_blocks: usize,
    pub compress_tables: bool,
}

impl Default for KvOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            disable_wal: false,
            durability: DurabilityLevel::default(),
            memtable_size: 4 * 1024 * 1024,
            max_tables: 4,
            block_cache_blocks: 1024,
            compress_tables: true,
        }
    }
}

impl KvOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            disable_wal: config.kv.disable_wal,
            durability: config.durability_level,
            memtable_size: config.kv.memtable_size,
            max_tables: config.kv.max_tables,
            block_cache_blocks: config.kv.block_cache_blocks,
            compress_tables: config.kv.compress_tables,
        }
    }

    /// Create a brand new store, failing if one already exists
    pub fn create_new(mut self) -> Self {
        self.create_if_missing = true;
        self.error_if_exists = true;
        self
    }

    /// Open an existing store, failing if none exists
    pub fn open_existing(mut self) -> Self {
        self.create_if_missing = false;
        self.error_if_exists = false;
        self
    }
}
