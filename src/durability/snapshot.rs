//! Table snapshots
//!
//! A snapshot file `{offset:020}.sdb` holds one [`LogEntry`] frame per live
//! entry of every ready index, shaped so that replaying it through
//! [`apply_entry`] rebuilds exactly that entry. The MANIFEST names the
//! current file and the offset/term watermark it covers.

use super::apply_entry;
use super::manifest::Manifest;
use crate::config::{EngineConfig, SnapshotCompression};
use crate::storage::atomic_file;
use crate::storage::frame::{FrameReader, FrameWriter, ReadOutcome};
use crate::table::{Table, TableEntry};
use crate::types::{Dimension, LogEntry, TsDimension};
use crate::{Result, StorageError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

const SNAPSHOT_SUFFIX: &str = ".sdb";

/// Snapshot files kept on disk: the current one and its predecessor
const RETAINED_SNAPSHOTS: usize = 2;

pub fn snapshot_file_name(offset: u64) -> String {
    format!("{:020}{}", offset, SNAPSHOT_SUFFIX)
}

/// Clears the running flag when a snapshot attempt ends
struct MakingGuard<'a>(&'a AtomicBool);

impl Drop for MakingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Snapshot {
    dir: PathBuf,
    tid: u32,
    pid: u32,
    compress: bool,
    sync: bool,
    term: AtomicU64,
    making: AtomicBool,
}

impl Snapshot {
    pub fn new(config: &EngineConfig, tid: u32, pid: u32) -> Self {
        Self {
            dir: config.partition_path(tid, pid).join("snapshot"),
            tid,
            pid,
            compress: config.snapshot.compression == SnapshotCompression::Snappy,
            sync: !config.durability_level.is_no_sync(),
            term: AtomicU64::new(0),
            making: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the snapshot directory and drop leftovers of interrupted runs
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let removed = atomic_file::remove_temp_files(&self.dir)?;
        if removed > 0 {
            warn!(tid = self.tid, pid = self.pid, removed, "removed unfinished snapshot files");
        }
        Ok(())
    }

    pub fn term(&self) -> u64 {
        self.term.load(Ordering::Relaxed)
    }

    pub fn set_term(&self, term: u64) {
        self.term.store(term, Ordering::Relaxed);
    }

    pub fn manifest(&self) -> Result<Option<Manifest>> {
        Manifest::load(&self.dir)
    }

    /// Dump every live entry of `table` and move the manifest to it.
    ///
    /// The watermark is `end_offset` when non-zero, the table offset
    /// otherwise. A non-zero `end_offset` behind the current manifest is
    /// rejected and nothing changes. Returns the recorded offset.
    pub fn make_snapshot(&self, table: &dyn Table, end_offset: u64) -> Result<u64> {
        if self
            .making
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StorageError::InvalidState(format!(
                "snapshot of {}_{} is already running",
                self.tid, self.pid
            )));
        }
        let _guard = MakingGuard(&self.making);
        let start = Instant::now();

        let previous = Manifest::load(&self.dir)?;
        if end_offset > 0 {
            if let Some(previous) = &previous {
                if end_offset < previous.offset {
                    return Err(StorageError::InvalidState(format!(
                        "snapshot end offset {} is behind manifest offset {}",
                        end_offset, previous.offset
                    )));
                }
            }
        }
        let offset = if end_offset > 0 { end_offset } else { table.offset() };
        let term = self.term();

        let name = snapshot_file_name(offset);
        let path = self.dir.join(&name);
        let tmp = atomic_file::temp_path(&path);
        let count = match self.write_entries(table, &tmp, offset, term) {
            Ok(count) => count,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&tmp) {
                    debug!(path = %tmp.display(), error = %cleanup, "no partial snapshot to remove");
                }
                warn!(tid = self.tid, pid = self.pid, error = %e, "snapshot failed");
                return Err(e);
            }
        };
        std::fs::rename(&tmp, &path)?;
        if self.sync {
            atomic_file::sync_dir(&self.dir)?;
        }

        let manifest = Manifest {
            name,
            offset,
            count,
            term,
        };
        manifest.store(&self.dir, self.sync)?;
        self.prune(&manifest.name);

        info!(
            tid = self.tid,
            pid = self.pid,
            offset,
            count,
            term,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "snapshot made"
        );
        Ok(offset)
    }

    fn write_entries(&self, table: &dyn Table, tmp: &Path, offset: u64, term: u64) -> Result<u64> {
        let mut writer = FrameWriter::create(tmp)?.with_compression(self.compress);
        let count = table.for_each_live_entry(&mut |entry| {
            writer.append(&to_log_entry(entry, offset, term))?;
            Ok(())
        })?;
        if self.sync {
            writer.sync()?;
        } else {
            writer.flush()?;
        }
        Ok(count)
    }

    /// Keep the current snapshot and its newest predecessor
    fn prune(&self, current: &str) {
        let mut names = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| name.ends_with(SNAPSHOT_SUFFIX))
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot list snapshots");
                return;
            }
        };
        names.sort_unstable_by(|a, b| b.cmp(a));
        names.retain(|name| name != current);
        for name in names.into_iter().skip(RETAINED_SNAPSHOTS - 1) {
            let path = self.dir.join(&name);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "old snapshot removed"),
                Err(e) => warn!(path = %path.display(), error = %e, "cannot remove old snapshot"),
            }
        }
    }

    /// Replay the current snapshot into `table`.
    ///
    /// Returns the manifest offset, 0 when no snapshot exists yet.
    pub fn recover(&self, table: &dyn Table) -> Result<u64> {
        let Some(manifest) = Manifest::load(&self.dir)? else {
            debug!(tid = self.tid, pid = self.pid, "no snapshot to recover");
            return Ok(0);
        };
        let start = Instant::now();
        let path = self.dir.join(&manifest.name);
        if !path.exists() {
            return Err(StorageError::Corruption(format!(
                "manifest names {} which does not exist",
                path.display()
            )));
        }

        let mut reader = FrameReader::open(&path)?;
        let mut applied = 0u64;
        loop {
            match reader.read_next::<LogEntry>()? {
                ReadOutcome::Record(entry) => {
                    if let Err(e) = apply_entry(table, &entry) {
                        warn!(tid = self.tid, pid = self.pid, error = %e, "snapshot entry rejected");
                    }
                    applied += 1;
                }
                ReadOutcome::End => break,
                ReadOutcome::Truncated { offset } => {
                    warn!(path = %path.display(), offset, "snapshot ends mid-frame");
                    break;
                }
                ReadOutcome::Corrupt { offset, reason } => {
                    warn!(path = %path.display(), offset, reason = %reason, "corrupt snapshot frame");
                    break;
                }
            }
        }
        if applied != manifest.count {
            warn!(
                tid = self.tid,
                pid = self.pid,
                expected = manifest.count,
                applied,
                "snapshot entry count differs from manifest"
            );
        }

        table.set_offset(manifest.offset);
        self.set_term(manifest.term);
        info!(
            tid = self.tid,
            pid = self.pid,
            offset = manifest.offset,
            applied,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "snapshot recovered"
        );
        Ok(manifest.offset)
    }
}

fn to_log_entry(entry: TableEntry, offset: u64, term: u64) -> LogEntry {
    let dimensions = vec![Dimension::new(entry.pk, entry.idx)];
    let log_entry = match entry.ts_idx {
        Some(ts_idx) => LogEntry::put_ts_dimensions(
            dimensions,
            vec![TsDimension::new(entry.ts, ts_idx as u32)],
            entry.value,
        ),
        None => LogEntry::put_dimensions(entry.ts, entry.value, dimensions),
    };
    log_entry.with_log_index(offset).with_term(term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{IndexSpec, TableMeta};
    use crate::table::MemTable;
    use tempfile::TempDir;

    fn table() -> MemTable {
        let meta = TableMeta::new("t", 3, 1)
            .with_index(IndexSpec::new("card"))
            .with_index(IndexSpec::new("mcc").with_ts_columns(vec![1, 2]));
        let table = MemTable::new(meta, 1000).unwrap();
        table.init().unwrap();
        table
    }

    fn snapshot_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".sdb"))
            .count()
    }

    #[test]
    fn test_make_and_recover() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::for_testing(dir.path());
        config.snapshot.compression = SnapshotCompression::Snappy;
        let snapshot = Snapshot::new(&config, 3, 1);
        snapshot.init().unwrap();
        snapshot.set_term(5);

        let source = table();
        source.put(b"a", 1, b"v1").unwrap();
        source
            .put_ts_dimensions(
                &[Dimension::new("a", 0), Dimension::new("m", 1)],
                &[TsDimension::new(10, 1), TsDimension::new(20, 2)],
                b"v2",
            )
            .unwrap();
        assert_eq!(snapshot.make_snapshot(&source, 0).unwrap(), 2);

        let manifest = snapshot.manifest().unwrap().unwrap();
        assert_eq!((manifest.offset, manifest.count, manifest.term), (2, 4, 5));

        let target = table();
        assert_eq!(snapshot.recover(&target).unwrap(), 2);
        assert_eq!(target.offset(), 2);
        assert_eq!(target.get(0, b"a", 1).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(target.get_with_ts_idx(1, b"m", 20, Some(2)).unwrap(), Some(b"v2".to_vec()));
        assert_eq!(target.get_with_ts_idx(1, b"m", 10, Some(2)).unwrap(), None);
    }

    #[test]
    fn test_watermark_and_retention() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::for_testing(dir.path());
        let snapshot = Snapshot::new(&config, 3, 1);
        snapshot.init().unwrap();
        let source = table();

        for round in 1..=4u64 {
            source.put(b"k", round, b"v").unwrap();
            snapshot.make_snapshot(&source, round * 10).unwrap();
        }
        assert_eq!(snapshot_files(snapshot.dir()), 2);
        assert!(snapshot.dir().join(snapshot_file_name(40)).exists());
        assert!(snapshot.dir().join(snapshot_file_name(30)).exists());

        assert!(matches!(
            snapshot.make_snapshot(&source, 35),
            Err(StorageError::InvalidState(_))
        ));
        assert_eq!(snapshot.manifest().unwrap().unwrap().offset, 40);
    }

    #[test]
    fn test_recover_without_snapshot_and_corrupt_manifest() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::for_testing(dir.path());
        let snapshot = Snapshot::new(&config, 3, 1);
        snapshot.init().unwrap();
        assert_eq!(snapshot.recover(&table()).unwrap(), 0);

        std::fs::write(snapshot.dir().join("MANIFEST"), "name: missing.sdb\noffset: 4\n").unwrap();
        assert!(matches!(snapshot.recover(&table()), Err(StorageError::Corruption(_))));

        std::fs::write(snapshot.dir().join("MANIFEST"), "not a manifest").unwrap();
        assert!(matches!(snapshot.recover(&table()), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_truncated_snapshot_keeps_prefix() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::for_testing(dir.path());
        let snapshot = Snapshot::new(&config, 3, 1);
        snapshot.init().unwrap();

        let source = table();
        for ts in 1..=3u64 {
            source.put(b"k", ts, b"value").unwrap();
        }
        snapshot.make_snapshot(&source, 0).unwrap();

        let path = snapshot.dir().join(snapshot_file_name(3));
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let target = table();
        assert_eq!(snapshot.recover(&target).unwrap(), 3);
        let mut it = target.new_iterator(0, b"k").unwrap();
        it.seek_to_first();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push(it.ts());
            it.next();
        }
        // entries are drained newest first, the oldest was cut off
        assert_eq!(seen, vec![3, 2]);
    }
}
