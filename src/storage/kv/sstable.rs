//! SSTable: immutable sorted run of versions
//!
//! ## File Format
//! ```text
//! [Data Block 1] [Data Block 2] ... [Data Block N]   frames of Vec<RunEntry>
//! [Index Block]                                      frame of Vec<BlockHandle>
//! [Footer]                                           40 bytes, fixed layout
//! ```
//!
//! Entries are ordered like the memtable: user key ascending, then sequence
//! descending. A table is built under a `.tmp` name and renamed into place,
//! so a file with the final name is always complete.

use super::store::InternalKey;
use crate::storage::atomic_file;
use crate::storage::frame::{FrameReader, FrameWriter, ReadOutcome};
use crate::{Result, StorageError};
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic number for SSTable files (ASCII "TSKV")
const SSTABLE_MAGIC: u32 = 0x54534B56;

const SSTABLE_VERSION: u32 = 1;

const FOOTER_SIZE: usize = 40;

/// Uncompressed bytes after which a data block is closed
const BLOCK_SIZE: usize = 16 * 1024;

/// Per-entry bookkeeping counted on top of key and value bytes
pub(crate) const VERSION_OVERHEAD: usize = 16;

const TABLE_SUFFIX: &str = ".sst";

pub(crate) fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:08}{}", id, TABLE_SUFFIX))
}

pub(crate) fn parse_table_name(name: &str) -> Option<u64> {
    name.strip_suffix(TABLE_SUFFIX).and_then(|stem| stem.parse().ok())
}

/// One version of one key; `None` is a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RunEntry {
    pub key: Vec<u8>,
    pub seq: u64,
    pub value: Option<Vec<u8>>,
}

impl RunEntry {
    /// Order against the version `(key, seq)`
    pub fn cmp_version(&self, key: &[u8], seq: u64) -> Ordering {
        self.key.as_slice().cmp(key).then_with(|| seq.cmp(&self.seq))
    }

    pub fn size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Vec::len) + VERSION_OVERHEAD
    }
}

/// Whether `entry` sorts before the start of a range beginning at `from`
pub(crate) fn before_start(entry: &RunEntry, from: &Bound<InternalKey>) -> bool {
    match from {
        Bound::Unbounded => false,
        Bound::Included(ik) => entry.cmp_version(&ik.user_key, ik.seq.0) == Ordering::Less,
        Bound::Excluded(ik) => entry.cmp_version(&ik.user_key, ik.seq.0) != Ordering::Greater,
    }
}

/// Location of one data block and its first version
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockHandle {
    first_key: Vec<u8>,
    first_seq: u64,
    offset: u64,
    size: u64,
}

/// SSTable footer (stored at end of file)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Footer {
    index_offset: u64,
    index_size: u64,
    num_entries: u64,
    max_seq: u64,
}

impl Footer {
    fn serialize(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..4].copy_from_slice(&SSTABLE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&SSTABLE_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.num_entries.to_le_bytes());
        buf[32..40].copy_from_slice(&self.max_seq.to_le_bytes());
        buf
    }

    fn deserialize(data: &[u8; FOOTER_SIZE]) -> std::result::Result<Self, String> {
        let u32_at = |at: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(raw)
        };
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        let magic = u32_at(0);
        if magic != SSTABLE_MAGIC {
            return Err(format!("bad magic {:#010x}", magic));
        }
        let version = u32_at(4);
        if version != SSTABLE_VERSION {
            return Err(format!("unsupported version {}", version));
        }
        Ok(Self {
            index_offset: u64_at(8),
            index_size: u64_at(16),
            num_entries: u64_at(24),
            max_seq: u64_at(32),
        })
    }
}

fn corruption(path: &Path, reason: impl std::fmt::Display) -> StorageError {
    StorageError::Corruption(format!("{}: {}", path.display(), reason))
}

/// Read the single frame stored at `[offset, offset + size)`
fn read_frame_at<T: DeserializeOwned>(file: &mut File, path: &Path, offset: u64, size: u64) -> Result<T> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; size as usize];
    file.read_exact(&mut buf)?;
    match FrameReader::new(buf.as_slice()).read_next::<T>()? {
        ReadOutcome::Record(record) => Ok(record),
        ReadOutcome::End | ReadOutcome::Truncated { .. } => {
            Err(corruption(path, format!("short frame at byte {}", offset)))
        }
        ReadOutcome::Corrupt { reason, .. } => Err(corruption(path, format!("byte {}: {}", offset, reason))),
    }
}

/// SSTable (read-only)
pub(crate) struct SSTable {
    id: u64,
    path: PathBuf,
    file: Mutex<File>,
    index: Vec<BlockHandle>,
    footer: Footer,
}

impl SSTable {
    /// Open an existing SSTable
    pub fn open(id: u64, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len < FOOTER_SIZE as u64 {
            return Err(corruption(&path, format!("{} bytes is too short for a table", len)));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut raw = [0u8; FOOTER_SIZE];
        file.read_exact(&mut raw)?;
        let footer = Footer::deserialize(&raw).map_err(|reason| corruption(&path, reason))?;
        if footer.index_offset + footer.index_size + FOOTER_SIZE as u64 != len {
            return Err(corruption(&path, "footer does not match file length"));
        }

        let index: Vec<BlockHandle> = read_frame_at(&mut file, &path, footer.index_offset, footer.index_size)?;
        Ok(Self {
            id,
            path,
            file: Mutex::new(file),
            index,
            footer,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_entries(&self) -> u64 {
        self.footer.num_entries
    }

    /// Highest sequence stored in the table
    pub fn max_seq(&self) -> u64 {
        self.footer.max_seq
    }

    pub fn num_blocks(&self) -> usize {
        self.index.len()
    }

    fn read_block(&self, block: usize, cache: &BlockCache) -> Result<Arc<Vec<RunEntry>>> {
        if let Some(hit) = cache.get(self.id, block) {
            return Ok(hit);
        }
        let handle = &self.index[block];
        let entries: Vec<RunEntry> = {
            let mut file = self.file.lock();
            read_frame_at(&mut file, &self.path, handle.offset, handle.size)?
        };
        let entries = Arc::new(entries);
        cache.insert(self.id, block, Arc::clone(&entries));
        Ok(entries)
    }

    /// Last block whose first version sorts at or before the start of `from`
    fn start_block(&self, from: &Bound<InternalKey>) -> usize {
        let target = match from {
            Bound::Unbounded => return 0,
            Bound::Included(ik) | Bound::Excluded(ik) => ik,
        };
        let after = self.index.partition_point(|handle| {
            handle
                .first_key
                .as_slice()
                .cmp(&target.user_key)
                .then_with(|| target.seq.0.cmp(&handle.first_seq))
                != Ordering::Greater
        });
        after.saturating_sub(1)
    }
}

/// Forward cursor over one table's versions
pub(crate) struct SSTableCursor {
    table: Arc<SSTable>,
    block: usize,
    entries: Arc<Vec<RunEntry>>,
    pos: usize,
}

impl SSTableCursor {
    /// Position at the first version at or after `from`
    pub fn seek(table: Arc<SSTable>, from: &Bound<InternalKey>, cache: &BlockCache) -> Result<Self> {
        let block = table.start_block(from);
        let mut cursor = Self {
            table,
            block,
            entries: Arc::new(Vec::new()),
            pos: 0,
        };
        cursor.load(cache)?;
        loop {
            cursor.pos = cursor.entries.partition_point(|entry| before_start(entry, from));
            if cursor.pos < cursor.entries.len() || cursor.block >= cursor.table.num_blocks() {
                return Ok(cursor);
            }
            cursor.block += 1;
            cursor.load(cache)?;
        }
    }

    fn load(&mut self, cache: &BlockCache) -> Result<()> {
        self.entries = if self.block < self.table.num_blocks() {
            self.table.read_block(self.block, cache)?
        } else {
            Arc::new(Vec::new())
        };
        self.pos = 0;
        Ok(())
    }

    pub fn current(&self) -> Option<&RunEntry> {
        self.entries.get(self.pos)
    }

    pub fn advance(&mut self, cache: &BlockCache) -> Result<()> {
        self.pos += 1;
        while self.pos >= self.entries.len() && self.block < self.table.num_blocks() {
            self.block += 1;
            self.load(cache)?;
        }
        Ok(())
    }
}

/// SSTable writer
pub(crate) struct SSTableBuilder {
    id: u64,
    path: PathBuf,
    tmp: PathBuf,
    writer: FrameWriter,
    block: Vec<RunEntry>,
    block_bytes: usize,
    index: Vec<BlockHandle>,
    num_entries: u64,
    max_seq: u64,
}

impl SSTableBuilder {
    pub fn create(dir: &Path, id: u64, compress: bool) -> Result<Self> {
        let path = table_path(dir, id);
        let tmp = atomic_file::temp_path(&path);
        let writer = FrameWriter::create(&tmp)?.with_compression(compress);
        Ok(Self {
            id,
            path,
            tmp,
            writer,
            block: Vec::new(),
            block_bytes: 0,
            index: Vec::new(),
            num_entries: 0,
            max_seq: 0,
        })
    }

    /// Add the next version. Versions must arrive in table order.
    pub fn add(&mut self, entry: RunEntry) -> Result<()> {
        debug_assert!(self
            .block
            .last()
            .map_or(true, |last| last.cmp_version(&entry.key, entry.seq) == Ordering::Less));
        self.block_bytes += entry.size();
        self.max_seq = self.max_seq.max(entry.seq);
        self.num_entries += 1;
        self.block.push(entry);
        if self.block_bytes >= BLOCK_SIZE {
            self.finish_block()?;
        }
        Ok(())
    }

    fn finish_block(&mut self) -> Result<()> {
        let Some(first) = self.block.first() else {
            return Ok(());
        };
        let first_key = first.key.clone();
        let first_seq = first.seq;
        let offset = self.writer.bytes_written();
        let size = self.writer.append(&self.block)?;
        self.index.push(BlockHandle {
            first_key,
            first_seq,
            offset,
            size,
        });
        self.block.clear();
        self.block_bytes = 0;
        Ok(())
    }

    /// Write index and footer and move the table into place.
    ///
    /// Returns `None`, leaving no file behind, when nothing was added.
    pub fn finish(mut self, sync: bool) -> Result<Option<SSTable>> {
        if self.num_entries == 0 {
            drop(self.writer);
            std::fs::remove_file(&self.tmp)?;
            return Ok(None);
        }

        self.finish_block()?;
        let index_offset = self.writer.bytes_written();
        let index_size = self.writer.append(&self.index)?;
        let footer = Footer {
            index_offset,
            index_size,
            num_entries: self.num_entries,
            max_seq: self.max_seq,
        };
        self.writer.write_raw(&footer.serialize())?;
        if sync {
            self.writer.sync()?;
        } else {
            self.writer.flush()?;
        }
        drop(self.writer);

        std::fs::rename(&self.tmp, &self.path)?;
        SSTable::open(self.id, self.path).map(Some)
    }
}

/// Decoded data blocks shared by every table of one store
pub(crate) struct BlockCache {
    blocks: Option<Mutex<LruCache<(u64, usize), Arc<Vec<RunEntry>>>>>,
}

impl BlockCache {
    /// `capacity` in blocks; 0 disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    fn get(&self, table: u64, block: usize) -> Option<Arc<Vec<RunEntry>>> {
        self.blocks.as_ref()?.lock().get(&(table, block)).cloned()
    }

    fn insert(&self, table: u64, block: usize, entries: Arc<Vec<RunEntry>>) {
        if let Some(blocks) = &self.blocks {
            blocks.lock().put((table, block), entries);
        }
    }

    /// Drop every cached block of a table that was merged away
    pub fn evict_table(&self, table: u64) {
        let Some(blocks) = &self.blocks else {
            return;
        };
        let mut blocks = blocks.lock();
        let stale: Vec<(u64, usize)> = blocks
            .iter()
            .map(|(key, _)| *key)
            .filter(|(id, _)| *id == table)
            .collect();
        for key in stale {
            blocks.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.as_ref().map_or(0, |blocks| blocks.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;
    use tempfile::TempDir;

    fn entry(key: &str, seq: u64, value: Option<&str>) -> RunEntry {
        RunEntry {
            key: key.as_bytes().to_vec(),
            seq,
            value: value.map(|v| v.as_bytes().to_vec()),
        }
    }

    fn build(dir: &Path, id: u64, entries: Vec<RunEntry>) -> Arc<SSTable> {
        let mut builder = SSTableBuilder::create(dir, id, true).unwrap();
        for e in entries {
            builder.add(e).unwrap();
        }
        Arc::new(builder.finish(false).unwrap().unwrap())
    }

    fn drain(mut cursor: SSTableCursor, cache: &BlockCache) -> Vec<RunEntry> {
        let mut out = Vec::new();
        while let Some(e) = cursor.current() {
            out.push(e.clone());
            cursor.advance(cache).unwrap();
        }
        out
    }

    #[test]
    fn test_sstable_blocks_and_seek() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::new(8);
        let value = "x".repeat(500);
        let mut entries = Vec::new();
        for i in 0..200u64 {
            let key = format!("key{:04}", i);
            entries.push(entry(&key, 10 + i, Some(&value)));
            entries.push(entry(&key, 5, None));
        }
        let table = build(dir.path(), 1, entries.clone());
        assert!(table.num_blocks() > 1);
        assert_eq!(table.num_entries(), 400);
        assert_eq!(table.max_seq(), 209);

        let all = drain(SSTableCursor::seek(Arc::clone(&table), &Bound::Unbounded, &cache).unwrap(), &cache);
        assert_eq!(all, entries);

        // every version of key0150, newest first
        let from = Bound::Included(InternalKey::first_of(b"key0150"));
        let tail = drain(SSTableCursor::seek(Arc::clone(&table), &from, &cache).unwrap(), &cache);
        assert_eq!(tail[0], entry("key0150", 160, Some(&value)));
        assert_eq!(tail.len(), 100);

        // past every version of key0150
        let from = Bound::Excluded(InternalKey::last_of(b"key0150".to_vec()));
        let cursor = SSTableCursor::seek(Arc::clone(&table), &from, &cache).unwrap();
        assert_eq!(cursor.current().unwrap().key, b"key0151".to_vec());

        // a version in the middle of one key
        let from = Bound::Included(InternalKey {
            user_key: b"key0007".to_vec(),
            seq: Reverse(6),
        });
        let cursor = SSTableCursor::seek(Arc::clone(&table), &from, &cache).unwrap();
        assert_eq!(cursor.current(), Some(&entry("key0007", 5, None)));

        let from = Bound::Included(InternalKey::first_of(b"zzz"));
        assert!(SSTableCursor::seek(table, &from, &cache).unwrap().current().is_none());
        assert!(cache.len() <= 8);
    }

    #[test]
    fn test_empty_builder_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let builder = SSTableBuilder::create(dir.path(), 3, false).unwrap();
        assert!(builder.finish(false).unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_damaged_table_is_rejected() {
        let dir = TempDir::new().unwrap();
        let table = build(dir.path(), 2, vec![entry("a", 1, Some("v"))]);
        let path = table.path().to_path_buf();
        drop(table);

        let mut raw = std::fs::read(&path).unwrap();
        let len = raw.len();
        raw[len - FOOTER_SIZE] ^= 0xff;
        std::fs::write(&path, &raw).unwrap();
        assert!(matches!(SSTable::open(2, &path), Err(StorageError::Corruption(_))));

        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(SSTable::open(2, &path), Err(StorageError::Corruption(_))));
        assert_eq!(parse_table_name("00000002.sst"), Some(2));
        assert_eq!(parse_table_name("00000002.sst.tmp"), None);
    }

    #[test]
    fn test_block_cache_eviction() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::new(4);
        let table = build(dir.path(), 7, vec![entry("a", 1, Some("v")), entry("b", 1, Some("w"))]);
        let cursor = SSTableCursor::seek(Arc::clone(&table), &Bound::Unbounded, &cache).unwrap();
        assert_eq!(drain(cursor, &cache).len(), 2);
        assert_eq!(cache.len(), 1);
        cache.evict_table(7);
        assert_eq!(cache.len(), 0);

        let disabled = BlockCache::new(0);
        let cursor = SSTableCursor::seek(table, &Bound::Unbounded, &disabled).unwrap();
        assert_eq!(drain(cursor, &disabled).len(), 2);
        assert_eq!(disabled.len(), 0);
    }
}
