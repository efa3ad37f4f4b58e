//! Point and traverse iterators
//!
//! Both wrap a substrate cursor that owns its read snapshot, so dropping an
//! iterator always releases the snapshot.
//!
//! State machine: `SeekPending → Positioned ⇄ Exhausted`. Calling `next()`
//! before the first seek is a caller bug; it panics in debug builds and is
//! a no-op otherwise.

use super::{TableIterator, TraverseIterator};
use crate::catalog::ExpireBound;
use crate::storage::key_codec::{self, DecodedKey};
use crate::storage::kv::KvIterator;
use crate::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseState {
    SeekPending,
    Positioned,
    Exhausted,
}

/// Entries of one pk (and time column), newest first.
///
/// Entries older than the index's absolute read bound are hidden, except the
/// `ts == 0` sentinel.
pub struct PointIterator {
    it: KvIterator,
    pk: Vec<u8>,
    ts_idx: Option<u8>,
    prefix: Vec<u8>,
    read_bound: u64,
    ts: u64,
    state: TraverseState,
}

impl PointIterator {
    pub(crate) fn new(it: KvIterator, pk: &[u8], ts_idx: Option<u8>, read_bound: u64) -> Self {
        let prefix = match ts_idx {
            Some(ts_idx) => key_codec::pk_ts_idx_prefix(pk, ts_idx),
            None => key_codec::pk_prefix(pk),
        };
        Self {
            it,
            pk: pk.to_vec(),
            ts_idx,
            prefix,
            read_bound,
            ts: 0,
            state: TraverseState::SeekPending,
        }
    }

    fn current_ts(&self) -> Option<u64> {
        (self.it.valid() && self.it.key().starts_with(&self.prefix))
            .then(|| key_codec::decode_ts(self.it.key()))
    }

    fn settle(&mut self) {
        let mut ts = self.current_ts();
        if let Some(found) = ts {
            if self.read_bound > 0 && found != 0 && found < self.read_bound {
                // everything older is expired too, only the sentinel may remain
                self.it.seek(&key_codec::encode_opt(&self.pk, 0, self.ts_idx));
                ts = self.current_ts().filter(|&t| t == 0);
            }
        }
        match ts {
            Some(found) => {
                self.ts = found;
                self.state = TraverseState::Positioned;
            }
            None => self.state = TraverseState::Exhausted,
        }
    }

    pub fn state(&self) -> TraverseState {
        self.state
    }
}

impl TableIterator for PointIterator {
    fn seek(&mut self, ts: u64) {
        self.it.seek(&key_codec::encode_opt(&self.pk, ts, self.ts_idx));
        self.settle();
    }

    fn seek_to_first(&mut self) {
        self.it.seek(&self.prefix);
        self.settle();
    }

    fn valid(&self) -> bool {
        self.state == TraverseState::Positioned
    }

    fn next(&mut self) {
        debug_assert!(self.state != TraverseState::SeekPending, "next() called before seek");
        if self.state == TraverseState::Positioned {
            self.it.next();
            self.settle();
        }
    }

    fn value(&self) -> &[u8] {
        if self.valid() {
            self.it.value()
        } else {
            &[]
        }
    }

    fn pk(&self) -> &[u8] {
        &self.pk
    }

    fn ts(&self) -> u64 {
        if self.valid() {
            self.ts
        } else {
            0
        }
    }
}

/// Full scan of one index partition.
///
/// - counts every visited entry against `max_traverse_cnt`; crossing it
///   ends the scan even if live data remains
/// - numbers the entries of each pk from 1 and evaluates the index TTL per
///   entry; the first expired entry makes the cursor seek straight to the
///   next pk
pub struct TraversingIterator {
    it: KvIterator,
    has_ts_idx: bool,
    /// Time column to scan when keys carry one
    ts_idx: Option<u8>,
    bound: ExpireBound,
    max_traverse_cnt: u64,
    traverse_cnt: u64,
    record_idx: u64,
    pk: Option<Vec<u8>>,
    ts: u64,
    /// Entries of this pk at or newer than this ts are skipped after a seek
    resume: Option<(Vec<u8>, u64)>,
    state: TraverseState,
}

impl TraversingIterator {
    pub(crate) fn new(
        it: KvIterator,
        has_ts_idx: bool,
        ts_idx: Option<u8>,
        bound: ExpireBound,
        max_traverse_cnt: u64,
    ) -> Self {
        Self {
            it,
            has_ts_idx,
            ts_idx: if has_ts_idx { ts_idx } else { None },
            bound,
            max_traverse_cnt,
            traverse_cnt: 0,
            record_idx: 0,
            pk: None,
            ts: 0,
            resume: None,
            state: TraverseState::SeekPending,
        }
    }

    pub fn state(&self) -> TraverseState {
        self.state
    }

    pub fn ts_idx(&self) -> Option<u8> {
        self.ts_idx
    }

    /// Read error that ended the scan early, if any
    pub(crate) fn take_error(&mut self) -> Option<StorageError> {
        self.it.take_error()
    }

    /// Seek to the first key after every key of `pk`; false when none exists
    fn skip_pk(&mut self, pk: &[u8]) -> bool {
        match key_codec::prefix_successor(&key_codec::pk_prefix(pk)) {
            Some(next) => {
                self.it.seek(&next);
                true
            }
            None => false,
        }
    }

    fn settle(&mut self) {
        while self.it.valid() {
            self.traverse_cnt += 1;
            if self.traverse_cnt > self.max_traverse_cnt {
                self.state = TraverseState::Exhausted;
                return;
            }

            let DecodedKey { pk, ts, ts_idx } = key_codec::decode(self.it.key(), self.has_ts_idx);
            if let (Some(target), Some(found)) = (self.ts_idx, ts_idx) {
                if found < target {
                    self.it.seek(&key_codec::encode_with_ts_idx(&pk, u64::MAX, target));
                    continue;
                }
                if found > target {
                    if !self.skip_pk(&pk) {
                        break;
                    }
                    continue;
                }
            }

            if self.pk.as_deref() == Some(pk.as_slice()) {
                self.record_idx += 1;
            } else {
                self.record_idx = 1;
                self.pk = Some(pk.clone());
            }

            if self.bound.is_expired(ts, self.record_idx) {
                if !self.skip_pk(&pk) {
                    break;
                }
                continue;
            }

            if let Some((resume_pk, resume_ts)) = &self.resume {
                if *resume_pk == pk && ts >= *resume_ts {
                    self.it.next();
                    continue;
                }
            }

            self.ts = ts;
            self.state = TraverseState::Positioned;
            return;
        }
        self.state = TraverseState::Exhausted;
    }
}

impl TraverseIterator for TraversingIterator {
    fn seek(&mut self, pk: &[u8], ts: u64) {
        self.pk = None;
        self.record_idx = 0;
        self.resume = Some((pk.to_vec(), ts));
        // count-bounded policies number records from the head of the pk
        let start = if self.bound.lat_ttl > 0 { u64::MAX } else { ts };
        self.it.seek(&key_codec::encode_opt(pk, start, self.ts_idx));
        self.settle();
    }

    fn seek_to_first(&mut self) {
        self.pk = None;
        self.record_idx = 0;
        self.resume = None;
        self.it.seek_to_first();
        self.settle();
    }

    fn valid(&self) -> bool {
        self.state == TraverseState::Positioned
    }

    fn next(&mut self) {
        debug_assert!(self.state != TraverseState::SeekPending, "next() called before seek");
        if self.state == TraverseState::Positioned {
            self.it.next();
            self.settle();
        }
    }

    fn value(&self) -> &[u8] {
        if self.valid() {
            self.it.value()
        } else {
            &[]
        }
    }

    fn pk(&self) -> &[u8] {
        match (&self.pk, self.valid()) {
            (Some(pk), true) => pk,
            _ => &[],
        }
    }

    fn ts(&self) -> u64 {
        if self.valid() {
            self.ts
        } else {
            0
        }
    }

    fn count(&self) -> u64 {
        self.traverse_cnt
    }
}
