//! Snapshot manifest
//!
//! Plain text, one `key: value` per line:
//!
//! ```text
//! name: 00000000000000000010.sdb
//! offset: 10
//! count: 10
//! term: 3
//! ```
//!
//! Replaced atomically through [`atomic_file::write_atomic`].

use crate::storage::atomic_file;
use crate::{Result, StorageError};
use std::fmt::Write as _;
use std::path::Path;

pub const MANIFEST_FILE: &str = "MANIFEST";

/// Durable watermark of the newest snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Snapshot file name inside the snapshot directory
    pub name: String,
    /// Last log offset the snapshot covers
    pub offset: u64,
    /// Entries in the snapshot file
    pub count: u64,
    pub term: u64,
}

impl Manifest {
    pub fn encode(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = writeln!(out, "name: {}", self.name);
        let _ = writeln!(out, "offset: {}", self.offset);
        let _ = writeln!(out, "count: {}", self.count);
        let _ = writeln!(out, "term: {}", self.term);
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut name = None;
        let mut offset = None;
        let mut count = 0;
        let mut term = 0;

        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| StorageError::Corruption(format!("manifest line {}: '{}'", n + 1, line)))?;
            let value = value.trim();
            match key.trim() {
                "name" => name = Some(value.to_string()),
                "offset" => offset = Some(parse_u64(value, "offset")?),
                "count" => count = parse_u64(value, "count")?,
                "term" => term = parse_u64(value, "term")?,
                _ => {}
            }
        }

        match (name, offset) {
            (Some(name), Some(offset)) if !name.is_empty() => Ok(Self {
                name,
                offset,
                count,
                term,
            }),
            _ => Err(StorageError::Corruption("manifest lacks name or offset".into())),
        }
    }

    /// Read the manifest of `dir`. `Ok(None)` when there is none yet.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Corruption(format!("{}: {}", path.display(), e))),
        }
    }

    pub fn store(&self, dir: &Path, sync: bool) -> Result<()> {
        atomic_file::write_atomic(&dir.join(MANIFEST_FILE), self.encode().as_bytes(), sync)
    }
}

fn parse_u64(value: &str, field: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| StorageError::Corruption(format!("manifest field {}: '{}'", field, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), None);

        let manifest = Manifest {
            name: "00000000000000000038.sdb".into(),
            offset: 38,
            count: 27,
            term: 6,
        };
        manifest.store(dir.path(), true).unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), Some(manifest));
        assert!(!dir.path().join("MANIFEST.tmp").exists());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Manifest::parse("offset: 3\n").is_err());
        assert!(Manifest::parse("name: a.sdb\noffset: x\n").is_err());
        assert!(Manifest::parse("garbage").is_err());

        let parsed = Manifest::parse("name: a.sdb\n\noffset: 3\nextra: 1\n").unwrap();
        assert_eq!((parsed.offset, parsed.count, parsed.term), (3, 0, 0));
    }

    #[test]
    fn test_unreadable_manifest_is_corruption() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"name a.sdb").unwrap();
        assert!(matches!(Manifest::load(dir.path()), Err(StorageError::Corruption(_))));
    }
}
