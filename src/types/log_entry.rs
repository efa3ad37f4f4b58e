//! Log entries shared by the binlog and snapshot files

use serde::{Deserialize, Serialize};

/// A secondary index key a record must be reachable through
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimension {
    pub key: Vec<u8>,
    pub idx: u32,
}

impl Dimension {
    pub fn new(key: impl Into<Vec<u8>>, idx: u32) -> Self {
        Self {
            key: key.into(),
            idx,
        }
    }
}

/// Timestamp of one time column of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TsDimension {
    pub ts: u64,
    pub idx: u32,
}

impl TsDimension {
    pub fn new(ts: u64, idx: u32) -> Self {
        Self { ts, idx }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodType {
    #[default]
    Put,
    Delete,
}

/// One applied mutation.
///
/// - single-pk put: `pk`, `ts`, `value`
/// - dimensioned put: `dimensions`, `value`, and `ts` or `ts_dimensions`
/// - delete: `dimensions` (falls back to `pk` on index 0)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_index: u64,
    pub method_type: MethodType,
    pub pk: Option<Vec<u8>>,
    pub ts: Option<u64>,
    pub value: Option<Vec<u8>>,
    pub dimensions: Vec<Dimension>,
    pub ts_dimensions: Vec<TsDimension>,
    pub term: u64,
}

impl LogEntry {
    pub fn put(pk: impl Into<Vec<u8>>, ts: u64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            method_type: MethodType::Put,
            pk: Some(pk.into()),
            ts: Some(ts),
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn put_dimensions(ts: u64, value: impl Into<Vec<u8>>, dimensions: Vec<Dimension>) -> Self {
        Self {
            method_type: MethodType::Put,
            ts: Some(ts),
            value: Some(value.into()),
            dimensions,
            ..Default::default()
        }
    }

    pub fn put_ts_dimensions(
        dimensions: Vec<Dimension>,
        ts_dimensions: Vec<TsDimension>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            method_type: MethodType::Put,
            value: Some(value.into()),
            dimensions,
            ts_dimensions,
            ..Default::default()
        }
    }

    pub fn delete(pk: impl Into<Vec<u8>>, idx: u32) -> Self {
        Self {
            method_type: MethodType::Delete,
            dimensions: vec![Dimension::new(pk, idx)],
            ..Default::default()
        }
    }

    pub fn with_log_index(mut self, log_index: u64) -> Self {
        self.log_index = log_index;
        self
    }

    pub fn with_term(mut self, term: u64) -> Self {
        self.term = term;
        self
    }
}
