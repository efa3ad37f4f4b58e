use super::batch::{BatchOp, WriteBatch};
use super::iter::KvIterator;
use super::merge::{compact_versions, MergedVersions};
use super::persist::{self, StoreVersion};
use super::sstable::{BlockCache, RunEntry, SSTable, SSTableBuilder, VERSION_OVERHEAD};
use super::{CfHandle, ColumnFamilyDescriptor, CompactionFilter, KvOptions};
use crate::storage::atomic_file;
use crate::storage::frame::FrameWriter;
use crate::{Result, StorageError};
use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Versioned key: user key ascending, then sequence descending
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct InternalKey {
    pub user_key: Vec<u8>,
    pub seq: Reverse<u64>,
}

impl InternalKey {
    /// Sorts before every version of `key`
    pub fn first_of(key: &[u8]) -> Self {
        Self {
            user_key: key.to_vec(),
            seq: Reverse(u64::MAX),
        }
    }

    /// Sorts after every version of `key` (sequence 0 is never assigned)
    pub fn last_of(key: Vec<u8>) -> Self {
        Self {
            user_key: key,
            seq: Reverse(0),
        }
    }
}

/// `None` is a tombstone
pub(crate) type VersionMap = BTreeMap<InternalKey, Option<Vec<u8>>>;

#[derive(Default)]
struct CfState {
    mem: VersionMap,
    /// Newest first
    tables: Vec<Arc<SSTable>>,
}

pub(crate) struct ColumnFamily {
    pub name: String,
    pub filter: Option<Arc<dyn CompactionFilter>>,
    state: RwLock<CfState>,
}

impl ColumnFamily {
    fn new(descriptor: ColumnFamilyDescriptor) -> Self {
        Self {
            name: descriptor.name,
            filter: descriptor.compaction_filter,
            state: RwLock::new(CfState::default()),
        }
    }
}

struct CommitState {
    wal: Option<FrameWriter>,
    /// Last CURRENT written; unused by memory stores
    version: StoreVersion,
    /// Memtable bytes since the last flush, all families
    mem_bytes: usize,
    /// Set when a batch failed after its WAL append; the memtables and the
    /// log tail can no longer be trusted
    poisoned: Option<String>,
}

pub(crate) struct StoreInner {
    /// `None` for a memory-only store
    pub path: Option<PathBuf>,
    pub options: KvOptions,
    pub cfs: Vec<ColumnFamily>,
    cache: BlockCache,
    last_seq: AtomicU64,
    commit: Mutex<CommitState>,
    /// Live snapshot sequence → reference count
    snapshots: Mutex<BTreeMap<u64, usize>>,
}

impl StoreInner {
    fn new(path: Option<PathBuf>, descriptors: Vec<ColumnFamilyDescriptor>, options: KvOptions) -> Self {
        let names = descriptors.iter().map(|d| d.name.clone()).collect();
        Self {
            path,
            cfs: descriptors.into_iter().map(ColumnFamily::new).collect(),
            cache: BlockCache::new(options.block_cache_blocks),
            options,
            last_seq: AtomicU64::new(0),
            commit: Mutex::new(CommitState {
                wal: None,
                version: StoreVersion::new(names),
                mem_bytes: 0,
                poisoned: None,
            }),
            snapshots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_seq.load(Ordering::Acquire)
    }

    /// Oldest sequence any reader may still observe
    fn horizon(&self) -> u64 {
        let snapshots = self.snapshots.lock();
        let last = self.last_sequence();
        snapshots.keys().next().copied().map_or(last, |oldest| oldest.min(last))
    }

    fn release_snapshot(&self, seq: u64) {
        let mut snapshots = self.snapshots.lock();
        if let Some(count) = snapshots.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&seq);
            }
        }
    }

    fn cf(&self, cf: CfHandle) -> Result<&ColumnFamily> {
        self.cfs.get(cf).ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "column family handle {} out of range ({} families)",
                cf,
                self.cfs.len()
            ))
        })
    }

    fn location(&self) -> String {
        self.path
            .as_ref()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string())
    }

    fn sync_files(&self) -> bool {
        !self.options.durability.is_no_sync()
    }

    /// First live entry at or after `from`, as seen at sequence `seq`
    pub(crate) fn first_visible(
        &self,
        cf: CfHandle,
        from: Bound<InternalKey>,
        seq: u64,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let state = self.cfs[cf].state.read();
        let mut versions = MergedVersions::new(Some(&state.mem), &state.tables, from, &self.cache)?;
        while let Some(entry) = versions.next_resolved(seq)? {
            if let Some(value) = entry.value {
                return Ok(Some((entry.key, value)));
            }
        }
        Ok(None)
    }

    /// Newest version of `key` at `seq`, or at the latest sequence when `None`
    fn get(&self, cf: CfHandle, key: &[u8], seq: Option<u64>) -> Result<Option<Vec<u8>>> {
        let state = self.cfs[cf].state.read();
        // read under the lock: a merge cannot drop versions this sequence needs
        let seq = seq.unwrap_or_else(|| self.last_sequence());
        let from = Bound::Included(InternalKey::first_of(key));
        let mut versions = MergedVersions::new(Some(&state.mem), &state.tables, from, &self.cache)?;
        while let Some(entry) = versions.next_version()? {
            if entry.key.as_slice() != key {
                break;
            }
            if entry.seq <= seq {
                return Ok(entry.value);
            }
        }
        Ok(None)
    }

    /// Visit every live entry at sequence `seq` in key order
    fn for_each_visible<F>(&self, cf: CfHandle, seq: u64, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let state = self.cfs[cf].state.read();
        let mut versions = MergedVersions::new(Some(&state.mem), &state.tables, Bound::Unbounded, &self.cache)?;
        while let Some(entry) = versions.next_resolved(seq)? {
            if let Some(value) = &entry.value {
                f(&entry.key, value)?;
            }
        }
        Ok(())
    }

    /// Apply one operation at `seq`. Returns the memtable bytes it added.
    fn apply(&self, op: &BatchOp, seq: u64) -> Result<usize> {
        let family = &self.cfs[op.cf()];
        match op {
            BatchOp::Put { key, value, .. } => {
                family.state.write().mem.insert(
                    InternalKey {
                        user_key: key.clone(),
                        seq: Reverse(seq),
                    },
                    Some(value.clone()),
                );
                Ok(key.len() + value.len() + VERSION_OVERHEAD)
            }
            BatchOp::DeleteRange { begin, end, .. } => {
                if begin >= end {
                    return Ok(0);
                }
                let mut state = family.state.write();
                // Only keys whose newest version is live need a tombstone
                let mut doomed = Vec::new();
                {
                    let from = Bound::Included(InternalKey::first_of(begin));
                    let mut versions = MergedVersions::new(Some(&state.mem), &state.tables, from, &self.cache)?;
                    while let Some(entry) = versions.next_resolved(u64::MAX)? {
                        if entry.key.as_slice() >= end.as_slice() {
                            break;
                        }
                        if entry.value.is_some() {
                            doomed.push(entry.key);
                        }
                    }
                }
                let bytes = doomed.iter().map(|key| key.len() + VERSION_OVERHEAD).sum();
                for user_key in doomed {
                    state.mem.insert(
                        InternalKey {
                            user_key,
                            seq: Reverse(seq),
                        },
                        None,
                    );
                }
                Ok(bytes)
            }
        }
    }

    /// Write every non-empty memtable to a new SSTable, publish the new
    /// CURRENT, then reset the WAL. Caller holds the commit lock.
    fn flush_locked(&self, commit: &mut CommitState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(reason) = &commit.poisoned {
            return Err(StorageError::InvalidState(format!(
                "kv store at {} cannot flush after a failed write: {}",
                path.display(),
                reason
            )));
        }
        let sync = self.sync_files();
        let seq = self.last_sequence();
        if seq == commit.version.flushed_seq {
            return Ok(());
        }

        let mut version = commit.version.clone();
        let mut flushed = Vec::new();
        for (cf, family) in self.cfs.iter().enumerate() {
            let state = family.state.read();
            if state.mem.is_empty() {
                continue;
            }
            let id = version.allocate_table_id();
            let mut builder = SSTableBuilder::create(path, id, self.options.compress_tables)?;
            for (ik, value) in &state.mem {
                builder.add(RunEntry {
                    key: ik.user_key.clone(),
                    seq: ik.seq.0,
                    value: value.clone(),
                })?;
            }
            drop(state);
            if let Some(table) = builder.finish(sync)? {
                version.tables[cf].insert(0, id);
                flushed.push((cf, Arc::new(table)));
            }
        }
        version.flushed_seq = seq;
        persist::store_version(path, &version, sync)?;

        for (cf, table) in &flushed {
            let mut state = self.cfs[*cf].state.write();
            state.mem.clear();
            state.tables.insert(0, Arc::clone(table));
        }
        commit.version = version;
        commit.mem_bytes = 0;

        if commit.wal.is_some() {
            let mut wal = FrameWriter::create(path.join(persist::WAL_FILE))?;
            if sync {
                wal.sync()?;
            }
            commit.wal = Some(wal);
        }
        debug!(path = %path.display(), seq, tables = flushed.len(), "memtables flushed");
        Ok(())
    }

    /// Merge every SSTable of `cf` into one, dropping what no reader at or
    /// after `horizon` can see. Caller holds the commit lock, and the
    /// family's memtable holds nothing at or below `horizon`.
    fn merge_tables_locked(
        &self,
        commit: &mut CommitState,
        cf: CfHandle,
        horizon: u64,
        stats: &mut CompactionStats,
    ) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let family = &self.cfs[cf];
        let inputs = family.state.read().tables.clone();
        if inputs.is_empty() {
            return Ok(());
        }
        let sync = self.sync_files();

        let mut version = commit.version.clone();
        let id = version.allocate_table_id();
        let mut builder = SSTableBuilder::create(path, id, self.options.compress_tables)?;
        let mut versions = MergedVersions::new(None, &inputs, Bound::Unbounded, &self.cache)?;
        compact_versions(&mut versions, horizon, family.filter.as_deref(), stats, |entry| {
            builder.add(entry)
        })?;
        let merged = builder.finish(sync)?.map(Arc::new);

        version.tables[cf] = merged.iter().map(|table| table.id()).collect();
        persist::store_version(path, &version, sync)?;
        family.state.write().tables = merged.into_iter().collect();
        commit.version = version;

        for table in &inputs {
            self.cache.evict_table(table.id());
            if let Err(e) = std::fs::remove_file(table.path()) {
                warn!(table = %table.path().display(), error = %e, "failed to remove merged table");
            }
        }
        debug!(
            path = %path.display(),
            cf = %family.name,
            inputs = inputs.len(),
            horizon,
            "sstables merged"
        );
        Ok(())
    }

    /// Merge the families that outgrew `max_tables`
    fn merge_overflowing_locked(&self, commit: &mut CommitState) -> Result<CompactionStats> {
        let mut stats = CompactionStats::default();
        let horizon = self.horizon();
        for cf in 0..self.cfs.len() {
            if self.cfs[cf].state.read().tables.len() > self.options.max_tables {
                self.merge_tables_locked(commit, cf, horizon, &mut stats)?;
            }
        }
        Ok(stats)
    }

    /// Compact a memory store's memtables in place
    fn compact_memory(&self, horizon: u64, stats: &mut CompactionStats) -> Result<()> {
        for family in &self.cfs {
            let mut compacted = VersionMap::new();
            {
                let state = family.state.read();
                let mut versions = MergedVersions::new(Some(&state.mem), &[], Bound::Unbounded, &self.cache)?;
                compact_versions(&mut versions, horizon, family.filter.as_deref(), stats, |entry| {
                    compacted.insert(
                        InternalKey {
                            user_key: entry.key,
                            seq: Reverse(entry.seq),
                        },
                        entry.value,
                    );
                    Ok(())
                })?;
            }
            family.state.write().mem = compacted;
        }
        Ok(())
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        // Without a WAL, unflushed batches survive only a clean close
        if self.path.is_none() || !self.options.disable_wal {
            return;
        }
        let mut commit = self.commit.lock();
        if let Err(e) = self.flush_locked(&mut commit) {
            warn!(path = %self.location(), error = %e, "flush on close failed");
        }
    }
}

/// Counters reported by [`KvStore::compact`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub dropped_versions: u64,
    pub dropped_tombstones: u64,
    pub filtered: u64,
}

/// Handle to an open store. Cloning shares the same store.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<StoreInner>,
}

impl KvStore {
    /// Open or create a store at `path` with the given column families.
    ///
    /// Existing stores must have been created with the same column family
    /// names in the same order.
    pub fn open(
        path: impl AsRef<Path>,
        descriptors: Vec<ColumnFamilyDescriptor>,
        options: KvOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        validate_descriptors(&descriptors)?;

        let exists = path.join(persist::CURRENT_FILE).exists();
        if exists && options.error_if_exists {
            return Err(StorageError::AlreadyExists(path.display().to_string()));
        }
        if !exists && !options.create_if_missing {
            return Err(StorageError::NotFound(path.display().to_string()));
        }

        let sync = !options.durability.is_no_sync();
        let names: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        let inner = StoreInner::new(Some(path.clone()), descriptors, options);

        let version = if exists {
            let version = persist::load_version(&path)?;
            if version.column_families != names {
                return Err(StorageError::InvalidArgument(format!(
                    "column families {:?} do not match stored {:?}",
                    names, version.column_families
                )));
            }
            for (family, ids) in inner.cfs.iter().zip(&version.tables) {
                let mut tables = Vec::with_capacity(ids.len());
                for &id in ids {
                    let table = SSTable::open(id, super::sstable::table_path(&path, id))?;
                    tables.push(Arc::new(table));
                }
                family.state.write().tables = tables;
            }
            let removed = persist::remove_unreferenced_tables(&path, &version)?
                + atomic_file::remove_temp_files(&path)?;
            if removed > 0 {
                info!(path = %path.display(), removed, "removed leftover kv files");
            }
            version
        } else {
            std::fs::create_dir_all(&path)?;
            let version = StoreVersion::new(names);
            persist::store_version(&path, &version, sync)?;
            version
        };

        // replay failures drop `inner`; its close flush must see the loaded tables
        inner.commit.lock().version = version.clone();
        let mut mem_bytes = 0;
        let (last, replayed) = persist::replay_wal(&path, version.flushed_seq, |seq, ops| {
            if ops.iter().any(|op| op.cf() >= inner.cfs.len()) {
                return Err(StorageError::Corruption(format!(
                    "wal batch {} targets an unknown column family",
                    seq
                )));
            }
            for op in ops {
                mem_bytes += inner.apply(op, seq)?;
            }
            Ok(())
        })?;
        inner.last_seq.store(last, Ordering::Release);

        {
            let mut commit = inner.commit.lock();
            commit.version = version;
            commit.mem_bytes = mem_bytes;
            // Fold replayed batches into SSTables before the WAL is reset,
            // so new batches never land behind a possibly torn tail.
            if replayed > 0 {
                inner.flush_locked(&mut commit)?;
            }
            let wal_path = path.join(persist::WAL_FILE);
            if inner.options.disable_wal {
                if wal_path.exists() {
                    std::fs::remove_file(&wal_path)?;
                }
            } else {
                let mut wal = FrameWriter::create(&wal_path)?;
                if sync {
                    wal.sync()?;
                }
                commit.wal = Some(wal);
            }
        }

        let store = Self {
            inner: Arc::new(inner),
        };
        info!(
            path = %path.display(),
            column_families = store.inner.cfs.len(),
            last_seq = store.last_sequence(),
            replayed_batches = replayed,
            "kv store opened"
        );
        Ok(store)
    }

    /// Store without any files. Everything stays in memtables; checkpoints
    /// still write SSTables.
    pub fn open_in_memory(descriptors: Vec<ColumnFamilyDescriptor>) -> Result<Self> {
        validate_descriptors(&descriptors)?;
        let options = KvOptions {
            disable_wal: true,
            memtable_size: 0,
            ..KvOptions::default()
        };
        Ok(Self {
            inner: Arc::new(StoreInner::new(None, descriptors, options)),
        })
    }

    /// Directory of the store, `None` when memory-only
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn cf_handle(&self, name: &str) -> Option<CfHandle> {
        self.inner.cfs.iter().position(|cf| cf.name == name)
    }

    pub fn cf_names(&self) -> Vec<String> {
        self.inner.cfs.iter().map(|cf| cf.name.clone()).collect()
    }

    pub fn last_sequence(&self) -> u64 {
        self.inner.last_sequence()
    }

    /// Commit a batch atomically. Returns its sequence number.
    ///
    /// Readers never observe part of a batch: its versions carry a
    /// sequence above every reader's until it is published.
    pub fn write(&self, batch: &WriteBatch) -> Result<u64> {
        for op in batch.ops() {
            self.inner.cf(op.cf())?;
        }
        if batch.is_empty() {
            return Ok(self.last_sequence());
        }

        let mut commit = self.inner.commit.lock();
        if let Some(reason) = &commit.poisoned {
            return Err(StorageError::InvalidState(format!(
                "kv store at {} rejected write after earlier failure: {}",
                self.inner.location(),
                reason
            )));
        }

        let seq = self.inner.last_sequence() + 1;
        let sync = self.inner.options.durability.requires_immediate_sync();
        if let Some(wal) = commit.wal.as_mut() {
            if let Err(e) = append_batch(wal, seq, batch.ops(), sync) {
                commit.poisoned = Some(e.to_string());
                return Err(StorageError::Write(format!("kv wal append failed: {}", e)));
            }
        }

        for op in batch.ops() {
            match self.inner.apply(op, seq) {
                Ok(bytes) => commit.mem_bytes += bytes,
                Err(e) => {
                    commit.poisoned = Some(e.to_string());
                    return Err(StorageError::Write(format!("kv batch {} failed to apply: {}", seq, e)));
                }
            }
        }
        self.inner.last_seq.store(seq, Ordering::Release);

        let limit = self.inner.options.memtable_size;
        if self.inner.path.is_some() && limit > 0 && commit.mem_bytes >= limit {
            let flushed = self
                .inner
                .flush_locked(&mut commit)
                .and_then(|_| self.inner.merge_overflowing_locked(&mut commit));
            if let Err(e) = flushed {
                // The batch is durable in the WAL; the next flush retries
                warn!(path = %self.inner.location(), error = %e, "kv memtable flush failed");
            }
        }
        Ok(seq)
    }

    pub fn put(&self, cf: CfHandle, key: &[u8], value: &[u8]) -> Result<u64> {
        let mut batch = WriteBatch::new();
        batch.put(cf, key, value);
        self.write(&batch)
    }

    pub fn delete_range(&self, cf: CfHandle, begin: &[u8], end: &[u8]) -> Result<u64> {
        let mut batch = WriteBatch::new();
        batch.delete_range(cf, begin, end);
        self.write(&batch)
    }

    /// Point lookup at `snapshot`, or at the latest state when `None`
    pub fn get(&self, cf: CfHandle, key: &[u8], snapshot: Option<&KvSnapshot>) -> Result<Option<Vec<u8>>> {
        self.inner.cf(cf)?;
        self.inner.get(cf, key, snapshot.map(|s| s.seq))
    }

    /// Acquire a read snapshot of the latest committed state
    pub fn snapshot(&self) -> KvSnapshot {
        let mut snapshots = self.inner.snapshots.lock();
        let seq = self.inner.last_sequence();
        *snapshots.entry(seq).or_insert(0) += 1;
        KvSnapshot {
            seq,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Iterator over one column family. Takes a fresh snapshot when `None`.
    pub fn iter(&self, cf: CfHandle, snapshot: Option<KvSnapshot>) -> Result<KvIterator> {
        self.inner.cf(cf)?;
        let snapshot = snapshot.unwrap_or_else(|| self.snapshot());
        Ok(KvIterator::new(Arc::clone(&self.inner), cf, snapshot))
    }

    /// Number of live keys in a column family
    pub fn count(&self, cf: CfHandle) -> Result<u64> {
        self.inner.cf(cf)?;
        let snapshot = self.snapshot();
        let mut count = 0u64;
        self.inner.for_each_visible(cf, snapshot.seq, |_, _| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Number of SSTables backing a column family
    pub fn table_count(&self, cf: CfHandle) -> Result<usize> {
        Ok(self.inner.cf(cf)?.state.read().tables.len())
    }

    /// Write the memtables out to SSTables and truncate the WAL
    pub fn flush(&self) -> Result<()> {
        let mut commit = self.inner.commit.lock();
        self.inner.flush_locked(&mut commit)
    }

    /// Flush, then merge every family down to at most one SSTable,
    /// reclaiming versions no snapshot can see, dropping tombstones and
    /// running compaction filters.
    pub fn compact(&self) -> Result<CompactionStats> {
        let mut commit = self.inner.commit.lock();
        let horizon = self.inner.horizon();
        let mut stats = CompactionStats::default();
        if self.inner.path.is_some() {
            self.inner.flush_locked(&mut commit)?;
            for cf in 0..self.inner.cfs.len() {
                self.inner.merge_tables_locked(&mut commit, cf, horizon, &mut stats)?;
            }
        } else {
            self.inner.compact_memory(horizon, &mut stats)?;
        }
        debug!(
            path = %self.inner.location(),
            horizon,
            dropped_versions = stats.dropped_versions,
            dropped_tombstones = stats.dropped_tombstones,
            filtered = stats.filtered,
            "kv compaction done"
        );
        Ok(stats)
    }

    /// Export a consistent copy of the current state into `dir`: one
    /// SSTable per non-empty family plus CURRENT, no WAL.
    ///
    /// `dir` must not exist. The copy is built in a sibling `.tmp`
    /// directory and renamed into place; nothing is left behind on failure.
    pub fn create_checkpoint(&self, dir: &Path) -> Result<()> {
        if dir.exists() {
            return Err(StorageError::AlreadyExists(dir.display().to_string()));
        }
        let tmp = atomic_file::temp_path(dir);
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }

        let snapshot = self.snapshot();
        let result = (|| -> Result<()> {
            std::fs::create_dir_all(&tmp)?;
            let mut version = StoreVersion::new(self.cf_names());
            version.flushed_seq = snapshot.seq;
            for cf in 0..self.inner.cfs.len() {
                let id = version.allocate_table_id();
                let mut builder = SSTableBuilder::create(&tmp, id, self.inner.options.compress_tables)?;
                self.inner.for_each_visible(cf, snapshot.seq, |key, value| {
                    builder.add(RunEntry {
                        key: key.to_vec(),
                        seq: snapshot.seq,
                        value: Some(value.to_vec()),
                    })
                })?;
                if builder.finish(true)?.is_some() {
                    version.tables[cf].push(id);
                }
            }
            persist::store_version(&tmp, &version, true)?;
            std::fs::rename(&tmp, dir)?;
            if let Some(parent) = dir.parent() {
                atomic_file::sync_dir(parent)?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            if tmp.exists() {
                if let Err(cleanup) = std::fs::remove_dir_all(&tmp) {
                    warn!(dir = %tmp.display(), error = %cleanup, "failed to remove partial checkpoint");
                }
            }
            return Err(e);
        }
        info!(dir = %dir.display(), seq = snapshot.seq, "checkpoint created");
        Ok(())
    }

    /// Flush and fsync the WAL
    pub fn sync(&self) -> Result<()> {
        let mut commit = self.inner.commit.lock();
        if let Some(wal) = commit.wal.as_mut() {
            wal.sync()?;
        }
        Ok(())
    }
}

fn validate_descriptors(descriptors: &[ColumnFamilyDescriptor]) -> Result<()> {
    if descriptors.is_empty() {
        return Err(StorageError::InvalidArgument(
            "at least one column family is required".into(),
        ));
    }
    for (i, d) in descriptors.iter().enumerate() {
        if descriptors[..i].iter().any(|other| other.name == d.name) {
            return Err(StorageError::InvalidArgument(format!(
                "duplicate column family '{}'",
                d.name
            )));
        }
    }
    Ok(())
}

fn append_batch(wal: &mut FrameWriter, seq: u64, ops: &[BatchOp], sync: bool) -> Result<()> {
    wal.append(&persist::WalRecordRef { seq, ops })?;
    wal.flush()?;
    if sync {
        wal.sync()?;
    }
    Ok(())
}

/// Read snapshot; released when dropped
pub struct KvSnapshot {
    seq: u64,
    inner: Arc<StoreInner>,
}

impl KvSnapshot {
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

impl Clone for KvSnapshot {
    fn clone(&self) -> Self {
        *self.inner.snapshots.lock().entry(self.seq).or_insert(0) += 1;
        Self {
            seq: self.seq,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for KvSnapshot {
    fn drop(&mut self) {
        self.inner.release_snapshot(self.seq);
    }
}
