//! tskv storage core
//!
//! Partitioned time-series key-value tables:
//!
//! - multi-index key encoding over an ordered substrate ([`storage`])
//! - per-index TTL retention and bounded iteration ([`table`], [`catalog`])
//! - snapshot + binlog durability and recovery ([`durability`])
//!
//! ## Layout
//! - `storage::key_codec`: composite `(pk, ts_idx, ts)` keys
//! - `storage::kv`: MVCC column-family LSM store: WAL, memtables, SSTables, checkpoints
//! - `table`: disk and memory backends, GC engine, iterators
//! - `durability`: manifest, snapshot, segmented binlog, recovery, partitions
//! - `task_pool`: bounded background workers for GC

pub mod catalog;
pub mod config;
pub mod durability;
pub mod storage;
pub mod table;
pub mod task_pool;
pub mod types;

mod error;

pub use catalog::{IndexSpec, TableMeta, TtlType, TtlValue};
pub use config::{DurabilityLevel, EngineConfig};
pub use durability::{Partition, RecoveryReport, TableBackend};
pub use error::{Result, StorageError};
pub use table::{DiskTable, MemTable, Table, TableIterator, TraverseIterator};
pub use task_pool::TaskPool;
pub use types::{Dimension, LogEntry, MethodType, TsDimension};
