//! Operations shared by both table backends

use super::gc::{self, AbsoluteTtlFilter, GcStats};
use super::iterator::{PointIterator, TraversingIterator};
use super::{index_cf_name, TableEntry, TableIterator, TraverseIterator};
use crate::catalog::{IndexCatalog, IndexDef, TableMeta};
use crate::storage::key_codec;
use crate::storage::kv::{CfHandle, ColumnFamilyDescriptor, KvStore, WriteBatch, DEFAULT_CF};
use crate::types::{now_millis, Dimension, TsDimension};
use crate::{Result, StorageError};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info, warn};

pub(crate) struct TableCore {
    meta: TableMeta,
    catalog: IndexCatalog,
    store: OnceLock<KvStore>,
    offset: AtomicU64,
    max_traverse_cnt: u64,
}

fn cf_of(idx: u32) -> CfHandle {
    idx as CfHandle + 1
}

impl TableCore {
    pub fn new(meta: TableMeta, max_traverse_cnt: u64) -> Result<Self> {
        let catalog = IndexCatalog::from_meta(&meta)?;
        Ok(Self {
            meta,
            catalog,
            store: OnceLock::new(),
            offset: AtomicU64::new(0),
            max_traverse_cnt,
        })
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn catalog(&self) -> &IndexCatalog {
        &self.catalog
    }

    /// `default` plus one family per declared index, deleted ones included
    pub fn descriptors(&self, with_ttl_filters: bool) -> Vec<ColumnFamilyDescriptor> {
        let mut descriptors = vec![ColumnFamilyDescriptor::new(DEFAULT_CF)];
        for idx in 0..self.catalog.len() as u32 {
            let Some(def) = self.catalog.get_any(idx) else {
                continue;
            };
            let mut descriptor = ColumnFamilyDescriptor::new(index_cf_name(idx, def.name()));
            if with_ttl_filters && def.ttl_type().absolute_bound_decides() {
                descriptor = descriptor.with_filter(Arc::new(AbsoluteTtlFilter::new(Arc::clone(def))));
            }
            descriptors.push(descriptor);
        }
        descriptors
    }

    pub fn attach(&self, store: KvStore) -> Result<()> {
        self.store.set(store).map_err(|_| {
            StorageError::InvalidState(format!(
                "table {}_{} is already initialized",
                self.meta.tid, self.meta.pid
            ))
        })
    }

    pub fn is_attached(&self) -> bool {
        self.store.get().is_some()
    }

    pub fn store(&self) -> Result<&KvStore> {
        self.store.get().ok_or_else(|| {
            StorageError::InvalidState(format!(
                "table {}_{} is not initialized",
                self.meta.tid, self.meta.pid
            ))
        })
    }

    fn commit(&self, store: &KvStore, batch: &WriteBatch) -> Result<()> {
        if batch.is_empty() {
            debug!(tid = self.meta.tid, pid = self.meta.pid, "nothing to write, all target indexes deleted");
            return Ok(());
        }
        if let Err(e) = store.write(batch) {
            warn!(tid = self.meta.tid, pid = self.meta.pid, error = %e, "write rejected");
            return Err(e);
        }
        self.offset.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn put(&self, pk: &[u8], ts: u64, value: &[u8]) -> Result<()> {
        let store = self.store()?;
        let def = self.catalog.get(0)?;
        let mut batch = WriteBatch::new();
        stage(&mut batch, def, pk, ts, value);
        self.commit(store, &batch)
    }

    pub fn put_dimensions(&self, ts: u64, value: &[u8], dimensions: &[Dimension]) -> Result<()> {
        if dimensions.is_empty() {
            return Err(StorageError::InvalidArgument("put without dimensions".into()));
        }
        let store = self.store()?;
        self.catalog.check_dimensions(dimensions)?;

        let mut batch = WriteBatch::new();
        for dimension in dimensions {
            if let Some(def) = self.ready_index(dimension.idx) {
                stage(&mut batch, def, &dimension.key, ts, value);
            }
        }
        self.commit(store, &batch)
    }

    pub fn put_ts_dimensions(
        &self,
        dimensions: &[Dimension],
        ts_dimensions: &[TsDimension],
        value: &[u8],
    ) -> Result<()> {
        if dimensions.is_empty() || ts_dimensions.is_empty() {
            return Err(StorageError::InvalidArgument(
                "put needs at least one dimension and one ts dimension".into(),
            ));
        }
        let store = self.store()?;
        self.catalog.check_dimensions(dimensions)?;

        let mut batch = WriteBatch::new();
        for dimension in dimensions {
            let Some(def) = self.ready_index(dimension.idx) else {
                continue;
            };
            let cf = cf_of(def.id());
            let key = &dimension.key;
            match def.ts_columns() {
                [] => batch.put(cf, key_codec::encode(key, ts_dimensions[0].ts), value),
                [only] => {
                    if let Some(tsd) = ts_dimensions.iter().find(|t| t.idx == *only as u32) {
                        batch.put(cf, key_codec::encode(key, tsd.ts), value);
                    }
                }
                _ => {
                    for tsd in ts_dimensions {
                        if let Ok(column) = def.resolve_ts_idx(tsd.idx) {
                            batch.put(cf, key_codec::encode_with_ts_idx(key, tsd.ts, column), value);
                        }
                    }
                }
            }
        }
        self.commit(store, &batch)
    }

    fn ready_index(&self, idx: u32) -> Option<&Arc<IndexDef>> {
        let def = self.catalog.get_any(idx)?;
        if def.is_ready() {
            Some(def)
        } else {
            debug!(idx, "skipping dimension of deleted index");
            None
        }
    }

    pub fn delete(&self, pk: &[u8], idx: u32) -> Result<()> {
        let def = self.catalog.get(idx)?;
        let store = self.store()?;
        let cf = cf_of(idx);

        let prefixes = if def.has_ts_idx() {
            def.ts_columns()
                .iter()
                .map(|&c| key_codec::pk_ts_idx_prefix(pk, c))
                .collect()
        } else {
            vec![key_codec::pk_prefix(pk)]
        };
        let mut batch = WriteBatch::new();
        for prefix in prefixes {
            let end = key_codec::prefix_successor(&prefix).ok_or_else(|| {
                StorageError::InvalidArgument("pk prefix has no successor".into())
            })?;
            batch.delete_range(cf, prefix, end);
        }

        if let Err(e) = store.write(&batch) {
            warn!(tid = self.meta.tid, pid = self.meta.pid, idx, error = %e, "delete rejected");
            return Err(StorageError::Write(format!("delete in index {}: {}", idx, e)));
        }
        self.offset.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Key-level time column for a read: the requested column, or the
    /// index's first column when keys carry one and none was requested
    fn read_ts_idx(def: &IndexDef, ts_idx: Option<u32>) -> Result<Option<u8>> {
        match ts_idx {
            Some(ts_idx) => {
                let column = def.resolve_ts_idx(ts_idx)?;
                Ok(def.key_ts_idx(column))
            }
            None if def.has_ts_idx() => Ok(def.ts_columns().first().copied()),
            None => Ok(None),
        }
    }

    pub fn get(&self, idx: u32, pk: &[u8], ts: u64, ts_idx: Option<u32>) -> Result<Option<Vec<u8>>> {
        let def = self.catalog.get(idx)?;
        let key_ts_idx = Self::read_ts_idx(def, ts_idx)?;
        let store = self.store()?;

        let read_bound = def.expire_bound(key_ts_idx, now_millis()).read_bound();
        if read_bound > 0 && ts != 0 && ts < read_bound {
            return Ok(None);
        }
        store.get(cf_of(idx), &key_codec::encode_opt(pk, ts, key_ts_idx), None)
    }

    pub fn new_iterator(&self, idx: u32, ts_idx: Option<u32>, pk: &[u8]) -> Result<Box<dyn TableIterator>> {
        let def = self.catalog.get(idx)?;
        let key_ts_idx = Self::read_ts_idx(def, ts_idx)?;
        let store = self.store()?;

        let read_bound = def.expire_bound(key_ts_idx, now_millis()).read_bound();
        let it = store.iter(cf_of(idx), None)?;
        Ok(Box::new(PointIterator::new(it, pk, key_ts_idx, read_bound)))
    }

    pub fn new_traverse_iterator(&self, idx: u32, ts_idx: Option<u32>) -> Result<Box<dyn TraverseIterator>> {
        Ok(Box::new(self.traversing(idx, ts_idx, self.max_traverse_cnt)?))
    }

    fn traversing(&self, idx: u32, ts_idx: Option<u32>, budget: u64) -> Result<TraversingIterator> {
        let def = self.catalog.get(idx)?;
        let key_ts_idx = Self::read_ts_idx(def, ts_idx)?;
        let store = self.store()?;

        let bound = def.expire_bound(key_ts_idx, now_millis());
        let it = store.iter(cf_of(idx), None)?;
        Ok(TraversingIterator::new(it, def.has_ts_idx(), key_ts_idx, bound, budget))
    }

    pub fn for_each_live_entry(&self, f: &mut dyn FnMut(TableEntry) -> Result<()>) -> Result<u64> {
        let mut visited = 0u64;
        for def in self.catalog.ready() {
            let columns: Vec<Option<u32>> = if def.has_ts_idx() {
                def.ts_columns().iter().map(|&c| Some(c as u32)).collect()
            } else {
                vec![None]
            };
            for column in columns {
                let mut it = self.traversing(def.id(), column, u64::MAX)?;
                it.seek_to_first();
                while it.valid() {
                    f(TableEntry {
                        idx: def.id(),
                        ts_idx: it.ts_idx(),
                        pk: it.pk().to_vec(),
                        ts: it.ts(),
                        value: it.value().to_vec(),
                    })?;
                    visited += 1;
                    it.next();
                }
                if let Some(e) = it.take_error() {
                    return Err(e);
                }
            }
        }
        Ok(visited)
    }

    /// Run retention over every ready index
    pub fn sched_gc(&self) -> Result<GcStats> {
        let store = self.store()?;
        let start = Instant::now();
        let now_ms = now_millis();

        let mut stats = GcStats::default();
        let mut filtered = false;
        for def in self.catalog.ready() {
            if def.apply_pending_ttl() {
                let ttl = def.ttl(None);
                info!(
                    tid = self.meta.tid,
                    pid = self.meta.pid,
                    idx = def.id(),
                    abs_ttl = ttl.abs_ttl,
                    lat_ttl = ttl.lat_ttl,
                    "ttl updated"
                );
            }
            filtered |= def.ttl_type().absolute_bound_decides();
            match gc::gc_index(store, cf_of(def.id()), def, now_ms) {
                Ok(index_stats) => stats.merge(index_stats),
                Err(e) => warn!(
                    tid = self.meta.tid,
                    pid = self.meta.pid,
                    idx = def.id(),
                    error = %e,
                    "gc of index failed"
                ),
            }
        }

        // disk stores reclaim through SSTable merges; memory stores only here
        if store.path().is_none() && (stats.expired_ranges > 0 || filtered) {
            store.compact()?;
        }
        info!(
            tid = self.meta.tid,
            pid = self.meta.pid,
            scanned = stats.scanned,
            expired_ranges = stats.expired_ranges,
            failed_ranges = stats.failed_ranges,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "gc done"
        );
        Ok(stats)
    }

    pub fn create_checkpoint(&self, dir: &Path) -> Result<()> {
        self.store()?.create_checkpoint(dir)
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Relaxed);
    }

    pub fn record_count(&self) -> Result<u64> {
        self.store()?.count(cf_of(0))
    }
}

/// Stage one write per applicable time column of `def`, all sharing `ts`
fn stage(batch: &mut WriteBatch, def: &IndexDef, key: &[u8], ts: u64, value: &[u8]) {
    let cf = cf_of(def.id());
    if def.has_ts_idx() {
        for &column in def.ts_columns() {
            batch.put(cf, key_codec::encode_with_ts_idx(key, ts, column), value);
        }
    } else {
        batch.put(cf, key_codec::encode(key, ts), value);
    }
}
