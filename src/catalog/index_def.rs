//! Index definitions

use super::ttl::{ExpireBound, TtlType, TtlValue};
use crate::{Result, StorageError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Lifecycle state of an index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    #[default]
    Ready,
    Deleted,
}

/// Declarative description of one index, as stored in table metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    /// Time column ids; at most 256 distinct values (0..=255)
    #[serde(default)]
    pub ts_columns: Vec<u32>,
    #[serde(default)]
    pub ttl_type: TtlType,
    #[serde(default)]
    pub ttl: TtlValue,
    /// Per time column overrides of `ttl`
    #[serde(default)]
    pub column_ttl: BTreeMap<u32, TtlValue>,
    #[serde(default)]
    pub status: IndexStatus,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ts_columns: Vec::new(),
            ttl_type: TtlType::Absolute,
            ttl: TtlValue::default(),
            column_ttl: BTreeMap::new(),
            status: IndexStatus::Ready,
        }
    }

    pub fn with_ts_columns(mut self, ts_columns: Vec<u32>) -> Self {
        self.ts_columns = ts_columns;
        self
    }

    pub fn with_ttl(mut self, ttl_type: TtlType, ttl: TtlValue) -> Self {
        self.ttl_type = ttl_type;
        self.ttl = ttl;
        self
    }

    pub fn with_column_ttl(mut self, ts_column: u32, ttl: TtlValue) -> Self {
        self.column_ttl.insert(ts_column, ttl);
        self
    }
}

/// TTL bounds readable without locking; updates are staged and applied at GC time
#[derive(Debug)]
struct TtlCell {
    abs_ttl: AtomicU64,
    lat_ttl: AtomicU64,
    pending: Mutex<Option<TtlValue>>,
}

impl TtlCell {
    fn new(ttl: TtlValue) -> Self {
        Self {
            abs_ttl: AtomicU64::new(ttl.abs_ttl),
            lat_ttl: AtomicU64::new(ttl.lat_ttl),
            pending: Mutex::new(None),
        }
    }

    fn load(&self) -> TtlValue {
        TtlValue {
            abs_ttl: self.abs_ttl.load(Ordering::Relaxed),
            lat_ttl: self.lat_ttl.load(Ordering::Relaxed),
        }
    }

    /// Staged value if any, else the current one
    fn effective(&self) -> TtlValue {
        let pending = *self.pending.lock();
        pending.unwrap_or_else(|| self.load())
    }

    fn stage(&self, ttl: TtlValue) {
        *self.pending.lock() = Some(ttl);
    }

    fn apply_pending(&self) -> Option<TtlValue> {
        let ttl = self.pending.lock().take()?;
        self.abs_ttl.store(ttl.abs_ttl, Ordering::Relaxed);
        self.lat_ttl.store(ttl.lat_ttl, Ordering::Relaxed);
        Some(ttl)
    }
}

/// A live index of one table
#[derive(Debug)]
pub struct IndexDef {
    id: u32,
    name: String,
    ts_columns: Vec<u8>,
    ttl_type: TtlType,
    ttl: TtlCell,
    column_ttl: BTreeMap<u8, TtlCell>,
    deleted: AtomicBool,
}

impl IndexDef {
    pub fn from_spec(id: u32, spec: &IndexSpec) -> Result<Self> {
        if spec.name.is_empty() {
            return Err(StorageError::InvalidArgument(format!("index {} has an empty name", id)));
        }

        let mut ts_columns = Vec::with_capacity(spec.ts_columns.len());
        for &column in &spec.ts_columns {
            let column = u8::try_from(column).map_err(|_| {
                StorageError::InvalidArgument(format!(
                    "index '{}': time column id {} does not fit in one byte",
                    spec.name, column
                ))
            })?;
            if ts_columns.contains(&column) {
                return Err(StorageError::InvalidArgument(format!(
                    "index '{}': duplicate time column {}",
                    spec.name, column
                )));
            }
            ts_columns.push(column);
        }

        let mut column_ttl = BTreeMap::new();
        for &column in &ts_columns {
            let ttl = spec.column_ttl.get(&(column as u32)).copied().unwrap_or(spec.ttl);
            column_ttl.insert(column, TtlCell::new(ttl));
        }
        if let Some(stray) = spec
            .column_ttl
            .keys()
            .find(|c| u8::try_from(**c).map_or(true, |c| !ts_columns.contains(&c)))
        {
            return Err(StorageError::TsColumnNotFound { idx: id, ts_idx: *stray });
        }

        Ok(Self {
            id,
            name: spec.name.clone(),
            ts_columns,
            ttl_type: spec.ttl_type,
            ttl: TtlCell::new(spec.ttl),
            column_ttl,
            deleted: AtomicBool::new(spec.status == IndexStatus::Deleted),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ts_columns(&self) -> &[u8] {
        &self.ts_columns
    }

    /// Keys of this index carry a time column id
    pub fn has_ts_idx(&self) -> bool {
        self.ts_columns.len() > 1
    }

    pub fn ttl_type(&self) -> TtlType {
        self.ttl_type
    }

    pub fn is_ready(&self) -> bool {
        !self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_deleted(&self) -> bool {
        !self.deleted.swap(true, Ordering::AcqRel)
    }

    /// Validate a time column id against this index
    pub fn resolve_ts_idx(&self, ts_idx: u32) -> Result<u8> {
        u8::try_from(ts_idx)
            .ok()
            .filter(|c| self.ts_columns.contains(c))
            .ok_or(StorageError::TsColumnNotFound { idx: self.id, ts_idx })
    }

    /// Key-level time column id for a column, `None` when keys carry none
    pub fn key_ts_idx(&self, ts_idx: u8) -> Option<u8> {
        self.has_ts_idx().then_some(ts_idx)
    }

    fn cell(&self, ts_idx: Option<u8>) -> &TtlCell {
        let column = ts_idx.or_else(|| match self.ts_columns.as_slice() {
            [only] => Some(*only),
            _ => None,
        });
        column
            .and_then(|c| self.column_ttl.get(&c))
            .unwrap_or(&self.ttl)
    }

    /// Current TTL of the index, or of one of its time columns
    pub fn ttl(&self, ts_idx: Option<u8>) -> TtlValue {
        self.cell(ts_idx).load()
    }

    pub fn expire_bound(&self, ts_idx: Option<u8>, now_ms: u64) -> ExpireBound {
        ExpireBound::new(self.ttl_type, self.ttl(ts_idx), now_ms)
    }

    /// Stage a TTL change; `None` targets the index and all its time columns
    pub fn stage_ttl(&self, ts_idx: Option<u8>, ttl: TtlValue) {
        match ts_idx {
            Some(column) => {
                if let Some(cell) = self.column_ttl.get(&column) {
                    cell.stage(ttl);
                }
            }
            None => {
                self.ttl.stage(ttl);
                for cell in self.column_ttl.values() {
                    cell.stage(ttl);
                }
            }
        }
    }

    /// Apply staged TTL changes. Returns whether anything changed.
    pub fn apply_pending_ttl(&self) -> bool {
        let mut changed = self.ttl.apply_pending().is_some();
        for cell in self.column_ttl.values() {
            changed |= cell.apply_pending().is_some();
        }
        changed
    }

    pub fn status(&self) -> IndexStatus {
        if self.is_ready() {
            IndexStatus::Ready
        } else {
            IndexStatus::Deleted
        }
    }

    /// Current definition as a spec. Staged TTL changes are included.
    pub fn to_spec(&self) -> IndexSpec {
        let ttl = self.ttl.effective();
        IndexSpec {
            name: self.name.clone(),
            ts_columns: self.ts_columns.iter().map(|&c| c as u32).collect(),
            ttl_type: self.ttl_type,
            ttl,
            column_ttl: self
                .column_ttl
                .iter()
                .map(|(&c, cell)| (c as u32, cell.effective()))
                .filter(|(_, column)| *column != ttl)
                .collect(),
            status: self.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts_columns_validation() {
        let spec = IndexSpec::new("card").with_ts_columns(vec![1, 300]);
        assert!(IndexDef::from_spec(0, &spec).is_err());

        let spec = IndexSpec::new("card").with_ts_columns(vec![1, 1]);
        assert!(IndexDef::from_spec(0, &spec).is_err());

        let spec = IndexSpec::new("card")
            .with_ts_columns(vec![1])
            .with_column_ttl(2, TtlValue::absolute(5));
        assert!(matches!(
            IndexDef::from_spec(3, &spec),
            Err(StorageError::TsColumnNotFound { idx: 3, ts_idx: 2 })
        ));
    }

    #[test]
    fn test_key_layout_flags() {
        let single = IndexDef::from_spec(0, &IndexSpec::new("a").with_ts_columns(vec![4])).unwrap();
        assert!(!single.has_ts_idx());
        assert_eq!(single.key_ts_idx(4), None);

        let multi = IndexDef::from_spec(1, &IndexSpec::new("b").with_ts_columns(vec![1, 2])).unwrap();
        assert!(multi.has_ts_idx());
        assert_eq!(multi.resolve_ts_idx(2).unwrap(), 2);
        assert!(multi.resolve_ts_idx(3).is_err());
    }

    #[test]
    fn test_column_ttl_and_staged_updates() {
        let spec = IndexSpec::new("mcc")
            .with_ts_columns(vec![1, 2])
            .with_ttl(TtlType::LatestCount, TtlValue::latest(3))
            .with_column_ttl(2, TtlValue::latest(1));
        let def = IndexDef::from_spec(0, &spec).unwrap();
        assert_eq!(def.ttl(Some(1)).lat_ttl, 3);
        assert_eq!(def.ttl(Some(2)).lat_ttl, 1);

        def.stage_ttl(Some(1), TtlValue::latest(7));
        assert_eq!(def.ttl(Some(1)).lat_ttl, 3);
        assert!(def.apply_pending_ttl());
        assert_eq!(def.ttl(Some(1)).lat_ttl, 7);
        assert!(!def.apply_pending_ttl());

        def.stage_ttl(None, TtlValue::latest(9));
        def.apply_pending_ttl();
        assert_eq!(def.ttl(Some(2)).lat_ttl, 9);
        assert_eq!(def.to_spec().column_ttl.len(), 0);

        // staged values show up in the spec before they apply
        def.stage_ttl(Some(2), TtlValue::latest(4));
        assert_eq!(def.ttl(Some(2)).lat_ttl, 9);
        assert_eq!(def.to_spec().column_ttl.get(&2), Some(&TtlValue::latest(4)));
    }

    #[test]
    fn test_status_round_trips_through_spec() {
        let def = IndexDef::from_spec(1, &IndexSpec::new("mcc")).unwrap();
        assert_eq!(def.to_spec().status, IndexStatus::Ready);
        assert!(def.mark_deleted());

        let spec = def.to_spec();
        assert_eq!(spec.status, IndexStatus::Deleted);
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"deleted\""));
        let restored = IndexDef::from_spec(1, &serde_json::from_str(&json).unwrap()).unwrap();
        assert!(!restored.is_ready());

        // metadata written before the field existed reads as ready
        let legacy: IndexSpec = serde_json::from_str(r#"{"name":"old"}"#).unwrap();
        assert_eq!(legacy.status, IndexStatus::Ready);
    }
}
