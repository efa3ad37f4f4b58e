//! Crash-safe file replacement
//!
//! Commit protocol used by the snapshot MANIFEST and the kv store's CURRENT
//! pointer:
//!
//! 1. write `{name}.tmp` and fsync it
//! 2. rename `{name}.tmp` → `{name}` (atomic on POSIX)
//! 3. fsync the parent directory so the rename itself is durable
//!
//! A crash before step 2 leaves the previous file intact plus an orphan
//! `.tmp`; a crash after it leaves the new file.

use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Path of the temporary sibling used while replacing `path`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace `path` with `contents`
pub fn write_atomic(path: &Path, contents: &[u8], sync: bool) -> Result<()> {
    let tmp = temp_path(path);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(contents)?;
        if sync {
            file.sync_all()?;
        }
    }
    std::fs::rename(&tmp, path)?;
    if sync {
        if let Some(parent) = path.parent() {
            sync_dir(parent)?;
        }
    }
    Ok(())
}

/// fsync a directory so renames and creations inside it are persisted
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let dir = File::open(dir)?;
        let rc = unsafe { libc::fsync(dir.as_raw_fd()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
    }

    Ok(())
}

/// Remove leftover `.tmp` files in `dir`, returning how many were removed
pub fn remove_temp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map(|ext| ext == "tmp").unwrap_or(false) {
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("MANIFEST");

        write_atomic(&path, b"offset: 1\n", true).unwrap();
        write_atomic(&path, b"offset: 2\n", true).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "offset: 2\n");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_remove_temp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.sdb.tmp"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("ckpt.tmp")).unwrap();
        std::fs::write(dir.path().join("b.sdb"), b"y").unwrap();

        assert_eq!(remove_temp_files(dir.path()).unwrap(), 2);
        assert!(dir.path().join("b.sdb").exists());
        assert_eq!(temp_path(&dir.path().join("b.sdb")).file_name().unwrap(), "b.sdb.tmp");
    }
}
