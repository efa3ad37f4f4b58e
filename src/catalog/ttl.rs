//! TTL policies and expiry evaluation
//!
//! Both the GC engine and the iterators decide expiry through
//! [`ExpireBound`], so a record the traverse iterator hides is exactly a
//! record the next GC pass removes.

use crate::types::timestamp::{expire_time, minutes_to_millis};
use serde::{Deserialize, Serialize};

/// Retention policy of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TtlType {
    /// Expire entries older than `now - abs_ttl`
    #[default]
    Absolute,
    /// Keep the `lat_ttl` newest entries per pk (and time column)
    LatestCount,
    /// Expire only when both bounds are violated
    AbsoluteAndLatest,
    /// Expire when either bound is violated
    AbsoluteOrLatest,
}

impl TtlType {
    pub fn uses_time(self) -> bool {
        !matches!(self, TtlType::LatestCount)
    }

    pub fn uses_count(self) -> bool {
        !matches!(self, TtlType::Absolute)
    }

    /// Whether the absolute bound alone is enough to call an entry expired.
    ///
    /// Such indexes get the substrate compaction filter and hide expired
    /// entries from point reads before GC removes them.
    pub fn absolute_bound_decides(self) -> bool {
        matches!(self, TtlType::Absolute | TtlType::AbsoluteOrLatest)
    }
}

/// Configured TTL bounds. 0 means "no bound".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TtlValue {
    /// Minutes
    pub abs_ttl: u64,
    /// Record count
    pub lat_ttl: u64,
}

impl TtlValue {
    pub fn new(abs_ttl: u64, lat_ttl: u64) -> Self {
        Self { abs_ttl, lat_ttl }
    }

    pub fn absolute(minutes: u64) -> Self {
        Self::new(minutes, 0)
    }

    pub fn latest(count: u64) -> Self {
        Self::new(0, count)
    }
}

/// TTL bounds resolved against one clock reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpireBound {
    pub ttl_type: TtlType,
    /// Entries with `0 < ts < expire_time` violate the time bound; 0 = none
    pub expire_time: u64,
    /// Entries whose per-pk record index exceeds this violate the count bound; 0 = none
    pub lat_ttl: u64,
}

impl ExpireBound {
    pub fn new(ttl_type: TtlType, ttl: TtlValue, now_ms: u64) -> Self {
        let expire_time = if ttl_type.uses_time() {
            expire_time(now_ms, minutes_to_millis(ttl.abs_ttl))
        } else {
            0
        };
        let lat_ttl = if ttl_type.uses_count() { ttl.lat_ttl } else { 0 };
        Self {
            ttl_type,
            expire_time,
            lat_ttl,
        }
    }

    /// A bound that never expires anything
    pub fn unbounded(ttl_type: TtlType) -> Self {
        Self {
            ttl_type,
            expire_time: 0,
            lat_ttl: 0,
        }
    }

    /// Whether this policy can expire anything at all
    pub fn has_expire(&self) -> bool {
        match self.ttl_type {
            TtlType::Absolute => self.expire_time > 0,
            TtlType::LatestCount => self.lat_ttl > 0,
            TtlType::AbsoluteAndLatest => self.expire_time > 0 && self.lat_ttl > 0,
            TtlType::AbsoluteOrLatest => self.expire_time > 0 || self.lat_ttl > 0,
        }
    }

    /// Time bound check. `ts == 0` is a sentinel and never expires here.
    pub fn abs_expired(&self, ts: u64) -> bool {
        self.expire_time > 0 && ts != 0 && ts < self.expire_time
    }

    /// Count bound check, `record_idx` is 1-based within the pk
    pub fn lat_expired(&self, record_idx: u64) -> bool {
        self.lat_ttl > 0 && record_idx > self.lat_ttl
    }

    pub fn is_expired(&self, ts: u64, record_idx: u64) -> bool {
        if !self.has_expire() {
            return false;
        }
        match self.ttl_type {
            TtlType::Absolute => self.abs_expired(ts),
            TtlType::LatestCount => self.lat_expired(record_idx),
            TtlType::AbsoluteAndLatest => self.abs_expired(ts) && self.lat_expired(record_idx),
            TtlType::AbsoluteOrLatest => self.abs_expired(ts) || self.lat_expired(record_idx),
        }
    }

    /// Time bound applied to point reads, 0 when reads are not filtered
    pub fn read_bound(&self) -> u64 {
        if self.ttl_type.absolute_bound_decides() {
            self.expire_time
        } else {
            0
        }
    }
}
