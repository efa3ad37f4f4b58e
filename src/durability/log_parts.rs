//! Binlog segment index
//!
//! Maps a segment number to its start offset: the offset of the last entry
//! written before the segment, so every entry inside it has
//! `log_index > start_offset`. Both fields only grow.

use crate::{Result, StorageError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared between the binlog writer and the recovery reader
#[derive(Debug, Clone, Default)]
pub struct LogParts {
    inner: Arc<RwLock<BTreeMap<u32, u64>>>,
}

impl LogParts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a segment. It must come after every known segment and must
    /// not start before the previous one.
    pub fn insert(&self, segment: u32, start_offset: u64) -> Result<()> {
        let mut parts = self.inner.write();
        if let Some((&last, &last_start)) = parts.iter().next_back() {
            if segment <= last || start_offset < last_start {
                return Err(StorageError::InvalidArgument(format!(
                    "segment {} @ {} does not follow segment {} @ {}",
                    segment, start_offset, last, last_start
                )));
            }
        }
        parts.insert(segment, start_offset);
        Ok(())
    }

    /// Segment holding the entry right after `offset`: the last segment that
    /// starts at or before it. `None` when every segment starts later.
    pub fn find_segment_for(&self, offset: u64) -> Option<u32> {
        self.inner
            .read()
            .iter()
            .rev()
            .find(|(_, &start)| start <= offset)
            .map(|(&segment, _)| segment)
    }

    /// `segment` and every later one, in order
    pub fn segments_from(&self, segment: u32) -> Vec<(u32, u64)> {
        self.inner
            .read()
            .range(segment..)
            .map(|(&s, &start)| (s, start))
            .collect()
    }

    pub fn first(&self) -> Option<(u32, u64)> {
        self.inner.read().iter().next().map(|(&s, &start)| (s, start))
    }

    pub fn last(&self) -> Option<(u32, u64)> {
        self.inner.read().iter().next_back().map(|(&s, &start)| (s, start))
    }

    pub fn start_of(&self, segment: u32) -> Option<u64> {
        self.inner.read().get(&segment).copied()
    }

    /// Forget every segment numbered below `segment`
    pub fn remove_before(&self, segment: u32) -> usize {
        let mut parts = self.inner.write();
        let kept = parts.split_off(&segment);
        let removed = parts.len();
        *parts = kept;
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_insert() {
        let parts = LogParts::new();
        parts.insert(0, 0).unwrap();
        parts.insert(1, 10).unwrap();
        assert!(parts.insert(1, 20).is_err());
        assert!(parts.insert(2, 5).is_err());
        parts.insert(3, 10).unwrap();
        assert_eq!(parts.last(), Some((3, 10)));
    }

    #[test]
    fn test_find_segment() {
        let parts = LogParts::new();
        parts.insert(0, 0).unwrap();
        parts.insert(1, 10).unwrap();
        parts.insert(2, 25).unwrap();

        assert_eq!(parts.find_segment_for(0), Some(0));
        assert_eq!(parts.find_segment_for(9), Some(0));
        assert_eq!(parts.find_segment_for(10), Some(1));
        assert_eq!(parts.find_segment_for(100), Some(2));
        assert_eq!(parts.segments_from(1), vec![(1, 10), (2, 25)]);

        assert_eq!(parts.remove_before(2), 2);
        assert_eq!(parts.first(), Some((2, 25)));
        assert_eq!(parts.find_segment_for(3), None);
    }
}
