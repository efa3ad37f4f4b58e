//! Retention (GC) engine
//!
//! One scan per index under a read snapshot. Entries of a pk arrive newest
//! first, numbered per time column. Every policy is monotone along that
//! order (ts only decreases, record index only grows), so the first expired
//! entry of a (pk, time column) series marks the start of its expired tail:
//!
//! ```text
//! delete [encode(pk, ts_first_expired), encode(pk, 0))
//! ```
//!
//! The range stops before `ts == 0`, so the sentinel entry is never reaped.
//! Expired tails are collected per pk and flushed as one range-delete batch
//! whenever the pk changes. A failed flush is logged and the pass goes on.

use crate::catalog::{ExpireBound, IndexDef};
use crate::storage::key_codec;
use crate::storage::kv::{CfHandle, CompactionFilter, FilterDecision, KvStore, WriteBatch};
use crate::types::now_millis;
use crate::Result;
use ahash::AHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Counters of one GC pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub indexes: u64,
    pub scanned: u64,
    pub expired_ranges: u64,
    pub failed_ranges: u64,
}

impl GcStats {
    pub fn merge(&mut self, other: GcStats) {
        self.indexes += other.indexes;
        self.scanned += other.scanned;
        self.expired_ranges += other.expired_ranges;
        self.failed_ranges += other.failed_ranges;
    }
}

/// Run the retention policy of one index over its column family
pub(crate) fn gc_index(store: &KvStore, cf: CfHandle, def: &IndexDef, now_ms: u64) -> Result<GcStats> {
    let mut stats = GcStats {
        indexes: 1,
        ..Default::default()
    };

    let has_ts_idx = def.has_ts_idx();
    let bounds: AHashMap<Option<u8>, ExpireBound> = if has_ts_idx {
        def.ts_columns()
            .iter()
            .map(|&c| (Some(c), def.expire_bound(Some(c), now_ms)))
            .collect()
    } else {
        std::iter::once((None, def.expire_bound(None, now_ms))).collect()
    };
    if !bounds.values().any(ExpireBound::has_expire) {
        return Ok(stats);
    }

    let mut it = store.iter(cf, None)?;
    it.seek_to_first();

    let mut current_pk: Option<Vec<u8>> = None;
    let mut counts: AHashMap<Option<u8>, u64> = AHashMap::new();
    let mut expired: Vec<(Option<u8>, u64)> = Vec::new();

    while it.valid() {
        stats.scanned += 1;
        let key = key_codec::decode(it.key(), has_ts_idx);

        if current_pk.as_deref() != Some(key.pk.as_slice()) {
            if let Some(pk) = current_pk.take() {
                flush(store, cf, def, &pk, &mut expired, &mut stats);
            }
            counts.clear();
            current_pk = Some(key.pk.clone());
        }

        let Some(bound) = bounds.get(&key.ts_idx) else {
            it.next();
            continue;
        };
        let record_idx = counts.entry(key.ts_idx).or_insert(0);
        *record_idx += 1;

        if bound.is_expired(key.ts, *record_idx) && !expired.iter().any(|(c, _)| *c == key.ts_idx) {
            expired.push((key.ts_idx, key.ts));
            // the rest of this series is expired as well; jump to its sentinel slot
            it.seek(&key_codec::encode_opt(&key.pk, 0, key.ts_idx));
            continue;
        }
        it.next();
    }
    if let Some(e) = it.take_error() {
        return Err(e);
    }
    if let Some(pk) = current_pk {
        flush(store, cf, def, &pk, &mut expired, &mut stats);
    }
    Ok(stats)
}

fn flush(
    store: &KvStore,
    cf: CfHandle,
    def: &IndexDef,
    pk: &[u8],
    expired: &mut Vec<(Option<u8>, u64)>,
    stats: &mut GcStats,
) {
    let mut batch = WriteBatch::new();
    for (ts_idx, ts) in expired.drain(..) {
        let begin = key_codec::encode_opt(pk, ts, ts_idx);
        let end = key_codec::encode_opt(pk, 0, ts_idx);
        if begin < end {
            batch.delete_range(cf, begin, end);
        }
    }
    if batch.is_empty() {
        return;
    }

    let ranges = batch.len() as u64;
    match store.write(&batch) {
        Ok(_) => {
            stats.expired_ranges += ranges;
            debug!(idx = def.id(), ranges, "expired ranges deleted");
        }
        Err(e) => {
            stats.failed_ranges += ranges;
            warn!(
                idx = def.id(),
                pk = %String::from_utf8_lossy(pk),
                error = %e,
                "gc range delete failed"
            );
        }
    }
}

/// Substrate compaction filter dropping entries past the absolute bound.
///
/// Installed for policies where the time bound alone decides expiry.
pub(crate) struct AbsoluteTtlFilter {
    index: Arc<IndexDef>,
}

impl AbsoluteTtlFilter {
    pub fn new(index: Arc<IndexDef>) -> Self {
        Self { index }
    }
}

impl CompactionFilter for AbsoluteTtlFilter {
    fn name(&self) -> &str {
        "absolute-ttl"
    }

    fn filter(&self, key: &[u8], _value: &[u8]) -> FilterDecision {
        let decoded = key_codec::decode(key, self.index.has_ts_idx());
        let bound = self.index.expire_bound(decoded.ts_idx, now_millis());
        if bound.ttl_type.absolute_bound_decides() && bound.abs_expired(decoded.ts) {
            FilterDecision::Remove
        } else {
            FilterDecision::Keep
        }
    }
}
