//! Per-table index catalog
//!
//! Index `i` of a table lives in substrate column family `i + 1`; family 0
//! is the `default` family holding table metadata.

pub mod index_def;
pub mod ttl;

pub use index_def::{IndexDef, IndexSpec, IndexStatus};
pub use ttl::{ExpireBound, TtlType, TtlValue};

use crate::types::Dimension;
use crate::{Result, StorageError};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Table metadata: identity plus the ordered index list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub tid: u32,
    pub pid: u32,
    pub indexes: Vec<IndexSpec>,
}

impl TableMeta {
    pub fn new(name: impl Into<String>, tid: u32, pid: u32) -> Self {
        Self {
            name: name.into(),
            tid,
            pid,
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }
}

/// Resolved indexes of one table
#[derive(Debug)]
pub struct IndexCatalog {
    indexes: Vec<Arc<IndexDef>>,
    by_name: AHashMap<String, u32>,
}

impl IndexCatalog {
    pub fn from_meta(meta: &TableMeta) -> Result<Self> {
        if meta.indexes.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "table '{}' declares no index",
                meta.name
            )));
        }

        let mut indexes = Vec::with_capacity(meta.indexes.len());
        let mut by_name = AHashMap::with_capacity(meta.indexes.len());
        for (id, spec) in meta.indexes.iter().enumerate() {
            let id = id as u32;
            if by_name.insert(spec.name.clone(), id).is_some() {
                return Err(StorageError::InvalidArgument(format!(
                    "table '{}': duplicate index name '{}'",
                    meta.name, spec.name
                )));
            }
            if id == 0 && spec.status == IndexStatus::Deleted {
                return Err(StorageError::InvalidArgument(format!(
                    "table '{}': primary index '{}' is marked deleted",
                    meta.name, spec.name
                )));
            }
            indexes.push(Arc::new(IndexDef::from_spec(id, spec)?));
        }
        Ok(Self { indexes, by_name })
    }

    /// Ready index by id
    pub fn get(&self, idx: u32) -> Result<&Arc<IndexDef>> {
        self.indexes
            .get(idx as usize)
            .filter(|def| def.is_ready())
            .ok_or_else(|| StorageError::IndexNotFound(format!("index id {}", idx)))
    }

    /// Index by id regardless of status
    pub fn get_any(&self, idx: u32) -> Option<&Arc<IndexDef>> {
        self.indexes.get(idx as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<IndexDef>> {
        self.by_name
            .get(name)
            .and_then(|&id| self.indexes.get(id as usize))
            .filter(|def| def.is_ready())
    }

    /// Ready indexes in id order
    pub fn ready(&self) -> impl Iterator<Item = &Arc<IndexDef>> {
        self.indexes.iter().filter(|def| def.is_ready())
    }

    /// Number of indexes ever declared, deleted ones included
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Id of the index `delete_index(name)` would delete
    pub fn deletable(&self, name: &str) -> Result<u32> {
        let id = *self
            .by_name
            .get(name)
            .ok_or_else(|| StorageError::IndexNotFound(name.to_string()))?;
        if id == 0 {
            return Err(StorageError::InvalidArgument(format!(
                "index '{}' is the primary index and cannot be deleted",
                name
            )));
        }
        if !self.indexes[id as usize].is_ready() {
            return Err(StorageError::InvalidState(format!("index '{}' is already deleted", name)));
        }
        Ok(id)
    }

    /// Mark an index deleted. Index 0 carries single-pk writes and cannot be deleted.
    pub fn delete_index(&self, name: &str) -> Result<()> {
        let id = self.deletable(name)?;
        if !self.indexes[id as usize].mark_deleted() {
            return Err(StorageError::InvalidState(format!("index '{}' is already deleted", name)));
        }
        info!(index = name, idx = id, "index deleted");
        Ok(())
    }

    /// Stage a TTL update, applied by the next GC pass
    pub fn set_ttl(&self, idx: u32, ts_idx: Option<u32>, ttl: TtlValue) -> Result<()> {
        let def = self.get(idx)?;
        let column = ts_idx.map(|t| def.resolve_ts_idx(t)).transpose()?;
        def.stage_ttl(column, ttl);
        info!(
            idx,
            ts_idx = ?column,
            abs_ttl = ttl.abs_ttl,
            lat_ttl = ttl.lat_ttl,
            "ttl update staged"
        );
        Ok(())
    }

    /// Reject dimensions naming an index that never existed
    pub fn check_dimensions(&self, dimensions: &[Dimension]) -> Result<()> {
        for dimension in dimensions {
            if self.get_any(dimension.idx).is_none() {
                return Err(StorageError::IndexNotFound(format!("index id {}", dimension.idx)));
            }
        }
        Ok(())
    }

    /// Metadata reflecting current and staged TTLs; deleted indexes keep
    /// their slot with status `Deleted`
    pub fn to_specs(&self) -> Vec<IndexSpec> {
        self.indexes.iter().map(|def| def.to_spec()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> TableMeta {
        TableMeta::new("t1", 1, 0)
            .with_index(IndexSpec::new("card"))
            .with_index(IndexSpec::new("mcc").with_ts_columns(vec![1, 2]))
    }

    #[test]
    fn test_lookup_and_delete() {
        let catalog = IndexCatalog::from_meta(&meta()).unwrap();
        assert_eq!(catalog.by_name("mcc").unwrap().id(), 1);
        assert!(catalog.get(2).is_err());

        assert!(catalog.delete_index("card").is_err());
        catalog.delete_index("mcc").unwrap();
        assert!(matches!(catalog.get(1), Err(StorageError::IndexNotFound(_))));
        assert!(catalog.by_name("mcc").is_none());
        assert!(catalog.get_any(1).is_some());
        assert!(catalog.delete_index("mcc").is_err());
        assert_eq!(catalog.ready().count(), 1);

        // dimensions on a deleted index are tolerated, unknown ids are not
        assert!(catalog.check_dimensions(&[Dimension::new("k", 1)]).is_ok());
        assert!(catalog.check_dimensions(&[Dimension::new("k", 5)]).is_err());
    }

    #[test]
    fn test_invalid_meta() {
        assert!(IndexCatalog::from_meta(&TableMeta::new("t", 1, 0)).is_err());
        let dup = TableMeta::new("t", 1, 0)
            .with_index(IndexSpec::new("a"))
            .with_index(IndexSpec::new("a"));
        assert!(IndexCatalog::from_meta(&dup).is_err());

        let mut primary = IndexSpec::new("a");
        primary.status = IndexStatus::Deleted;
        assert!(IndexCatalog::from_meta(&TableMeta::new("t", 1, 0).with_index(primary)).is_err());
    }

    #[test]
    fn test_set_ttl_validates_column() {
        let catalog = IndexCatalog::from_meta(&meta()).unwrap();
        assert!(catalog.set_ttl(1, Some(9), TtlValue::latest(1)).is_err());
        assert!(catalog.deletable("mcc").is_ok());
        catalog.set_ttl(1, Some(2), TtlValue::latest(1)).unwrap();
        assert!(catalog.get(1).unwrap().apply_pending_ttl());
    }
}
