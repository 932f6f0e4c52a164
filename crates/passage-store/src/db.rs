//! Shared database handle.
//!
//! All storage components operate on named trees within a single sled
//! database so one directory on disk holds the peer directory, the contact
//! snapshot, and the gossip spool together.

use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// Handle to the on-disk database.
///
/// Cloning is cheap; clones share the same underlying database.
#[derive(Debug, Clone)]
pub struct StoreDb {
    db: sled::Db,
    path: PathBuf,
}

impl StoreDb {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)
            .map_err(|e| StoreError::Database(format!("Failed to open database: {}", e)))?;
        Ok(Self { db, path })
    }

    /// Open a named tree within the database.
    pub(crate) fn tree(&self, name: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| StoreError::Database(format!("Failed to open tree {}: {}", name, e)))
    }

    /// Flush all pending writes to disk.
    ///
    /// Returns the number of bytes flushed.
    pub fn flush(&self) -> Result<usize> {
        self.db
            .flush()
            .map_err(|e| StoreError::Database(format!("Failed to flush database: {}", e)))
    }

    /// Filesystem path the database was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Approximate size of the database on disk, in bytes.
    pub fn size_on_disk(&self) -> Result<u64> {
        self.db
            .size_on_disk()
            .map_err(|e| StoreError::Database(format!("Failed to read database size: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");

        {
            let db = StoreDb::open(&path).unwrap();
            let tree = db.tree("test").unwrap();
            tree.insert(b"key", b"value").unwrap();
            db.flush().unwrap();
        }

        let db = StoreDb::open(&path).unwrap();
        let tree = db.tree("test").unwrap();
        assert_eq!(tree.get(b"key").unwrap().unwrap().as_ref(), b"value");
    }

    #[test]
    fn test_trees_are_isolated() {
        let dir = TempDir::new().unwrap();
        let db = StoreDb::open(dir.path().join("store")).unwrap();

        let a = db.tree("a").unwrap();
        let b = db.tree("b").unwrap();
        a.insert(b"key", b"from-a").unwrap();

        assert!(b.get(b"key").unwrap().is_none());
    }
}
