//! Merged view over a memtable and SSTables
//!
//! Sources are merged by version order (user key ascending, sequence
//! descending). Each version lives in exactly one source, so ties never
//! occur.

use super::sstable::{BlockCache, RunEntry, SSTable, SSTableCursor};
use super::store::{CompactionStats, InternalKey, VersionMap};
use super::{CompactionFilter, FilterDecision};
use crate::Result;
use std::cmp::Ordering;
use std::collections::btree_map;
use std::iter::Peekable;
use std::ops::Bound;
use std::sync::Arc;

#[derive(Clone, Copy)]
enum Source {
    Mem,
    Table(usize),
}

pub(crate) struct MergedVersions<'a> {
    mem: Option<Peekable<btree_map::Range<'a, InternalKey, Option<Vec<u8>>>>>,
    tables: Vec<SSTableCursor>,
    cache: &'a BlockCache,
    /// Key whose newest visible version was already returned
    resolved: Option<Vec<u8>>,
}

impl<'a> MergedVersions<'a> {
    pub fn new(
        mem: Option<&'a VersionMap>,
        tables: &[Arc<SSTable>],
        from: Bound<InternalKey>,
        cache: &'a BlockCache,
    ) -> Result<Self> {
        let mut cursors = Vec::with_capacity(tables.len());
        for table in tables {
            cursors.push(SSTableCursor::seek(Arc::clone(table), &from, cache)?);
        }
        Ok(Self {
            mem: mem.map(|mem| mem.range((from, Bound::Unbounded)).peekable()),
            tables: cursors,
            cache,
            resolved: None,
        })
    }

    /// Next version of any key, in version order
    pub fn next_version(&mut self) -> Result<Option<RunEntry>> {
        let mut best: Option<(Source, &[u8], u64)> = None;
        if let Some(&(ik, _)) = self.mem.as_mut().and_then(|mem| mem.peek()) {
            best = Some((Source::Mem, ik.user_key.as_slice(), ik.seq.0));
        }
        for (i, cursor) in self.tables.iter().enumerate() {
            let Some(entry) = cursor.current() else {
                continue;
            };
            let newer = match best {
                None => true,
                Some((_, key, seq)) => entry.cmp_version(key, seq) == Ordering::Less,
            };
            if newer {
                best = Some((Source::Table(i), entry.key.as_slice(), entry.seq));
            }
        }

        match best.map(|(source, _, _)| source) {
            None => Ok(None),
            Some(Source::Mem) => Ok(self.mem.as_mut().and_then(|mem| mem.next()).map(|(ik, value)| RunEntry {
                key: ik.user_key.clone(),
                seq: ik.seq.0,
                value: value.clone(),
            })),
            Some(Source::Table(i)) => {
                let cursor = &mut self.tables[i];
                let entry = cursor.current().cloned();
                cursor.advance(self.cache)?;
                Ok(entry)
            }
        }
    }

    /// Newest version at or below `seq` of the next key that has one.
    /// Tombstones are returned too.
    pub fn next_resolved(&mut self, seq: u64) -> Result<Option<RunEntry>> {
        while let Some(entry) = self.next_version()? {
            if entry.seq > seq || self.resolved.as_deref() == Some(entry.key.as_slice()) {
                continue;
            }
            self.resolved = Some(entry.key.clone());
            return Ok(Some(entry));
        }
        Ok(None)
    }
}

/// Feed `sink` the versions of `source` a reader at or after `horizon` can
/// still observe.
///
/// Versions above `horizon` are kept as they are. At or below it only the
/// newest version of each key survives, and only if it is a live value the
/// filter keeps. `source` must cover every version of the keys it yields.
pub(crate) fn compact_versions(
    source: &mut MergedVersions<'_>,
    horizon: u64,
    filter: Option<&dyn CompactionFilter>,
    stats: &mut CompactionStats,
    mut sink: impl FnMut(RunEntry) -> Result<()>,
) -> Result<()> {
    let mut current: Option<Vec<u8>> = None;
    let mut base_seen = false;
    while let Some(entry) = source.next_version()? {
        if current.as_deref() != Some(entry.key.as_slice()) {
            current = Some(entry.key.clone());
            base_seen = false;
        }
        if entry.seq > horizon {
            sink(entry)?;
            continue;
        }
        if base_seen {
            stats.dropped_versions += 1;
            continue;
        }
        base_seen = true;
        match &entry.value {
            None => stats.dropped_tombstones += 1,
            Some(value) => {
                let remove = filter.map_or(false, |f| f.filter(&entry.key, value) == FilterDecision::Remove);
                if remove {
                    stats.filtered += 1;
                } else {
                    sink(entry)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::sstable::SSTableBuilder;
    use std::cmp::Reverse;
    use tempfile::TempDir;

    fn version(key: &str, seq: u64, value: Option<&str>) -> RunEntry {
        RunEntry {
            key: key.as_bytes().to_vec(),
            seq,
            value: value.map(|v| v.as_bytes().to_vec()),
        }
    }

    fn table(dir: &TempDir, id: u64, versions: &[RunEntry]) -> Arc<SSTable> {
        let mut builder = SSTableBuilder::create(dir.path(), id, false).unwrap();
        for v in versions {
            builder.add(v.clone()).unwrap();
        }
        Arc::new(builder.finish(false).unwrap().unwrap())
    }

    fn mem(versions: &[RunEntry]) -> VersionMap {
        versions
            .iter()
            .map(|v| {
                (
                    InternalKey {
                        user_key: v.key.clone(),
                        seq: Reverse(v.seq),
                    },
                    v.value.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_merge_order_across_sources() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::new(16);
        let older = table(&dir, 1, &[version("a", 1, Some("a1")), version("c", 2, Some("c2"))]);
        let newer = table(&dir, 2, &[version("a", 3, None), version("b", 4, Some("b4"))]);
        let memtable = mem(&[version("a", 5, Some("a5")), version("c", 6, Some("c6"))]);

        let mut merged = MergedVersions::new(Some(&memtable), &[newer, older], Bound::Unbounded, &cache).unwrap();
        let mut seen = Vec::new();
        while let Some(v) = merged.next_version().unwrap() {
            seen.push((v.key, v.seq));
        }
        let expected: Vec<(Vec<u8>, u64)> = [("a", 5), ("a", 3), ("a", 1), ("b", 4), ("c", 6), ("c", 2)]
            .iter()
            .map(|(k, s)| (k.as_bytes().to_vec(), *s))
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_resolution_at_a_sequence() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::new(16);
        let base = table(&dir, 1, &[version("a", 1, Some("a1")), version("b", 2, Some("b2"))]);
        let memtable = mem(&[version("a", 3, None), version("b", 4, Some("b4"))]);

        let resolve = |seq: u64| {
            let mut merged =
                MergedVersions::new(Some(&memtable), &[Arc::clone(&base)], Bound::Unbounded, &cache).unwrap();
            let mut out = Vec::new();
            while let Some(v) = merged.next_resolved(seq).unwrap() {
                out.push((String::from_utf8(v.key).unwrap(), v.seq, v.value.is_some()));
            }
            out
        };
        assert_eq!(resolve(2), vec![("a".into(), 1, true), ("b".into(), 2, true)]);
        assert_eq!(resolve(3), vec![("a".into(), 3, false), ("b".into(), 2, true)]);
        assert_eq!(resolve(9), vec![("a".into(), 3, false), ("b".into(), 4, true)]);
    }

    struct DropValue(&'static str);

    impl CompactionFilter for DropValue {
        fn name(&self) -> &str {
            "drop-value"
        }

        fn filter(&self, _key: &[u8], value: &[u8]) -> FilterDecision {
            if value == self.0.as_bytes() {
                FilterDecision::Remove
            } else {
                FilterDecision::Keep
            }
        }
    }

    #[test]
    fn test_compaction_keeps_what_readers_need() {
        let dir = TempDir::new().unwrap();
        let cache = BlockCache::new(16);
        let t = table(
            &dir,
            1,
            &[
                version("a", 7, Some("a7")),
                version("a", 4, Some("a4")),
                version("a", 2, Some("a2")),
                version("b", 3, None),
                version("b", 1, Some("b1")),
                version("c", 2, Some("expired")),
            ],
        );

        let mut source = MergedVersions::new(None, &[t], Bound::Unbounded, &cache).unwrap();
        let mut stats = CompactionStats::default();
        let mut kept = Vec::new();
        compact_versions(&mut source, 5, Some(&DropValue("expired")), &mut stats, |v| {
            kept.push((v.key, v.seq));
            Ok(())
        })
        .unwrap();

        assert_eq!(kept, vec![(b"a".to_vec(), 7), (b"a".to_vec(), 4)]);
        assert_eq!(stats.dropped_versions, 2);
        assert_eq!(stats.dropped_tombstones, 1);
        assert_eq!(stats.filtered, 1);
    }
}
