//! Engine configuration and durability levels
//!
//! One `EngineConfig` is built at process start and handed to every table,
//! snapshot and binlog instance. Presets are plain constructors.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Durability level for the substrate write-ahead log and the binlog
///
/// - Synchronous: fsync after every committed batch / appended entry
/// - NoSync: leave data in the OS buffer (tests and benchmarks only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DurabilityLevel {
    /// fsync on every write. Crash loses nothing that was acknowledged.
    Synchronous,

    /// Flush to the OS on every write, fsync only on roll/close/checkpoint.
    ///
    /// A machine crash may lose the tail, a process crash loses nothing.
    #[default]
    Buffered,

    /// Never fsync. Only for tests.
    NoSync,
}

impl DurabilityLevel {
    /// Whether every write must be fsynced before returning
    pub fn requires_immediate_sync(&self) -> bool {
        matches!(self, Self::Synchronous)
    }

    /// Whether fsync is skipped entirely
    pub fn is_no_sync(&self) -> bool {
        matches!(self, Self::NoSync)
    }
}

/// Storage medium a disk table lives on.
///
/// Selects the substrate tuning preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StorageMode {
    #[default]
    Ssd,
    Hdd,
}

/// Compression applied to snapshot frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SnapshotCompression {
    #[default]
    None,
    Snappy,
}

/// Ordered key-value substrate tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Memtable bytes after which the store flushes them to SSTables and
    /// truncates its WAL. 0 flushes only on compaction and close.
    pub memtable_size: usize,

    /// A column family with more SSTables than this gets them merged
    pub max_tables: usize,

    /// Decoded data blocks kept in the block cache. 0 disables it.
    pub block_cache_blocks: usize,

    /// Snappy-compress SSTable blocks
    pub compress_tables: bool,

    /// Skip the substrate WAL (unflushed writes survive only a clean close)
    pub disable_wal: bool,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            memtable_size: 4 * 1024 * 1024,
            max_tables: 4,
            block_cache_blocks: 1024,
            compress_tables: true,
            disable_wal: false,
        }
    }
}

/// Binlog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogConfig {
    /// Size in bytes after which the writer rolls to a new segment
    pub max_segment_size: u64,
}

impl Default for BinlogConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 128 * 1024 * 1024, // 128MB
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub compression: SnapshotCompression,
}

/// Background task pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPoolConfig {
    /// Fixed number of worker threads
    pub threads: usize,

    /// Bounded queue length; submitters block (or fail) beyond it
    pub queue_size: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            queue_size: 64,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory holding `{tid}_{pid}/{data|snapshot|binlog}`
    pub db_root_path: PathBuf,

    /// Storage medium preset
    pub storage_mode: StorageMode,

    /// Durability level for the binlog and the substrate WAL
    pub durability_level: DurabilityLevel,

    /// Maximum number of entries a traverse iterator may visit
    pub max_traverse_cnt: u64,

    pub kv: KvConfig,

    pub binlog: BinlogConfig,

    pub snapshot: SnapshotConfig,

    pub gc_pool: TaskPoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_root_path: PathBuf::from("./tskv_data"),
            storage_mode: StorageMode::default(),
            durability_level: DurabilityLevel::default(),
            max_traverse_cnt: 50_000,
            kv: KvConfig::default(),
            binlog: BinlogConfig::default(),
            snapshot: SnapshotConfig::default(),
            gc_pool: TaskPoolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// SSD preset: frequent merges, more GC workers
    pub fn for_ssd(root: impl Into<PathBuf>) -> Self {
        Self {
            db_root_path: root.into(),
            storage_mode: StorageMode::Ssd,
            kv: KvConfig {
                memtable_size: 4 * 1024 * 1024,
                max_tables: 4,
                ..Default::default()
            },
            gc_pool: TaskPoolConfig {
                threads: 4,
                queue_size: 64,
            },
            ..Default::default()
        }
    }

    /// HDD preset: fewer background writers, larger flushes, fewer tables to seek
    pub fn for_hdd(root: impl Into<PathBuf>) -> Self {
        Self {
            db_root_path: root.into(),
            storage_mode: StorageMode::Hdd,
            kv: KvConfig {
                memtable_size: 16 * 1024 * 1024,
                max_tables: 2,
                block_cache_blocks: 4096,
                ..Default::default()
            },
            gc_pool: TaskPoolConfig {
                threads: 1,
                queue_size: 16,
            },
            ..Default::default()
        }
    }

    /// Test preset: no fsync, small segments, tiny memtables so writes
    /// reach SSTables quickly
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        Self {
            db_root_path: root.into(),
            durability_level: DurabilityLevel::NoSync,
            kv: KvConfig {
                memtable_size: 4 * 1024,
                max_tables: 2,
                block_cache_blocks: 64,
                ..Default::default()
            },
            binlog: BinlogConfig {
                max_segment_size: 1024 * 1024,
            },
            ..Default::default()
        }
    }

    /// Directory of one table partition: `{root}/{tid}_{pid}`
    pub fn partition_path(&self, tid: u32, pid: u32) -> PathBuf {
        self.db_root_path.join(format!("{}_{}", tid, pid))
    }

    /// Load a configuration from a JSON file
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save the configuration as pretty JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_durability_levels() {
        assert!(DurabilityLevel::Synchronous.requires_immediate_sync());
        assert!(!DurabilityLevel::Buffered.requires_immediate_sync());
        assert!(DurabilityLevel::NoSync.is_no_sync());
    }

    #[test]
    fn test_config_presets() {
        let hdd = EngineConfig::for_hdd("/tmp/x");
        assert_eq!(hdd.storage_mode, StorageMode::Hdd);
        assert_eq!(hdd.gc_pool.threads, 1);
        assert!(hdd.kv.memtable_size > EngineConfig::default().kv.memtable_size);

        let testing = EngineConfig::for_testing("/tmp/x");
        assert!(testing.durability_level.is_no_sync());
        assert_eq!(
            testing.partition_path(4, 3),
            PathBuf::from("/tmp/x").join("4_3")
        );
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        let mut config = EngineConfig::for_ssd(dir.path());
        config.max_traverse_cnt = 7;
        config.snapshot.compression = SnapshotCompression::Snappy;
        config.save_json(&path).unwrap();

        let loaded = EngineConfig::load_json(&path).unwrap();
        assert_eq!(loaded.max_traverse_cnt, 7);
        assert_eq!(loaded.snapshot.compression, SnapshotCompression::Snappy);
        assert_eq!(loaded.storage_mode, StorageMode::Ssd);
    }
}
