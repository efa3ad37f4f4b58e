use super::store::{InternalKey, KvSnapshot, StoreInner};
use super::CfHandle;
use crate::StorageError;
use std::ops::Bound;
use std::sync::Arc;
use tracing::warn;

/// Cursor over one column family at a fixed snapshot.
///
/// Owns its snapshot, so the versions it reads stay alive until the
/// iterator is dropped. Each step re-enters the family's map under a read
/// lock, writers are never blocked for the lifetime of the cursor.
///
/// A failed SSTable read invalidates the cursor; [`KvIterator::take_error`]
/// tells an exhausted cursor from a broken one.
pub struct KvIterator {
    inner: Arc<StoreInner>,
    cf: CfHandle,
    snapshot: KvSnapshot,
    current: Option<(Vec<u8>, Vec<u8>)>,
    error: Option<StorageError>,
}

impl KvIterator {
    pub(crate) fn new(inner: Arc<StoreInner>, cf: CfHandle, snapshot: KvSnapshot) -> Self {
        Self {
            inner,
            cf,
            snapshot,
            current: None,
            error: None,
        }
    }

    fn position(&mut self, from: Bound<InternalKey>) {
        match self.inner.first_visible(self.cf, from, self.snapshot.sequence()) {
            Ok(current) => self.current = current,
            Err(e) => {
                warn!(cf = self.cf, error = %e, "kv iterator stopped on read error");
                self.current = None;
                self.error = Some(e);
            }
        }
    }

    /// Position at the first key `>= target`
    pub fn seek(&mut self, target: &[u8]) {
        self.position(Bound::Included(InternalKey::first_of(target)));
    }

    pub fn seek_to_first(&mut self) {
        self.position(Bound::Unbounded);
    }

    /// Advance to the next key. No-op when not valid.
    pub fn next(&mut self) {
        if let Some((key, _)) = self.current.take() {
            self.position(Bound::Excluded(InternalKey::last_of(key)));
        }
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// Current key; empty when not valid
    pub fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(key, _)| key.as_slice()).unwrap_or(&[])
    }

    /// Current value; empty when not valid
    pub fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, value)| value.as_slice()).unwrap_or(&[])
    }

    /// Error that invalidated the cursor, if any
    pub fn take_error(&mut self) -> Option<StorageError> {
        self.error.take()
    }

    pub fn snapshot(&self) -> &KvSnapshot {
        &self.snapshot
    }
}
