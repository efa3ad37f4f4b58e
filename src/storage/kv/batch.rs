use super::CfHandle;
use serde::{Deserialize, Serialize};

/// One operation of a write batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put {
        cf: u32,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Delete every key in `[begin, end)`
    DeleteRange {
        cf: u32,
        begin: Vec<u8>,
        end: Vec<u8>,
    },
}

impl BatchOp {
    pub fn cf(&self) -> CfHandle {
        match self {
            BatchOp::Put { cf, .. } | BatchOp::DeleteRange { cf, .. } => *cf as CfHandle,
        }
    }
}

/// Operations committed atomically under one sequence number.
///
/// Later operations win over earlier ones touching the same key.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: CfHandle, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        self.size += key.len() + value.len();
        self.ops.push(BatchOp::Put {
            cf: cf as u32,
            key,
            value,
        });
    }

    pub fn delete_range(&mut self, cf: CfHandle, begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) {
        let begin = begin.into();
        let end = end.into();
        self.size += begin.len() + end.len();
        self.ops.push(BatchOp::DeleteRange {
            cf: cf as u32,
            begin,
            end,
        });
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Sum of key and value bytes staged so far
    pub fn approximate_size(&self) -> usize {
        self.size
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.size = 0;
    }
}
