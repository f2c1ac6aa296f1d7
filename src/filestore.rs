//! Large-object stores attached to a buffer.
//!
//! Independent of blob cells: a file store holds payloads written by the
//! producer directly (one file per named object). Buffers isolated from
//! their producer get a `LocalFileStore` that is archived under
//! `filestores/`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, TableError};
use crate::reclaim::BackgroundReclaimer;

/// Handle to a store of large external payloads.
pub trait FileStoreHandler: Send + Sync + fmt::Debug {
    /// Directory holding the store's files, if any were ever written.
    fn root(&self) -> Option<&Path>;

    /// Release the store. Owned stores queue their files for deletion.
    fn dispose(&self, reclaimer: &BackgroundReclaimer);
}

#[derive(Debug)]
pub struct LocalFileStore {
    root: PathBuf,
    owned: bool,
    disposed: AtomicBool,
}

impl LocalFileStore {
    /// Create a fresh, owned store in a new directory under `parent`.
    pub fn create(parent: &Path) -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("rowstore-fs-")
            .tempdir_in(parent)?
            .into_path();
        Ok(Self {
            root,
            owned: true,
            disposed: AtomicBool::new(false),
        })
    }

    /// Attach to an existing directory (e.g. inside an archive). Never deleted.
    pub fn open(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            owned: false,
            disposed: AtomicBool::new(false),
        }
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(TableError::InvalidFormat(format!(
                "invalid file store object name \"{name}\""
            )));
        }
        Ok(self.root.join(name))
    }

    pub fn put(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TableError::InvalidFormat("file store disposed".into()));
        }
        let path = self.object_path(name)?;
        fs::write(&path, bytes)?;
        Ok(path)
    }

    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.object_path(name)?)?)
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

impl FileStoreHandler for LocalFileStore {
    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn dispose(&self, reclaimer: &BackgroundReclaimer) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.owned {
            reclaimer.delete([self.root.clone()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_and_dispose() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileStore::create(dir.path()).unwrap();
        store.put("model.bin", b"weights").unwrap();
        assert_eq!(store.get("model.bin").unwrap(), b"weights");
        assert!(store.put("../escape", b"x").is_err());

        let reclaimer = BackgroundReclaimer::new(Duration::from_secs(1));
        let root = store.root().unwrap().to_path_buf();
        store.dispose(&reclaimer);
        store.dispose(&reclaimer);
        reclaimer.wait_until_finished();
        assert!(!root.exists());
        assert!(store.put("late", b"x").is_err());
    }

    #[test]
    fn test_opened_store_is_not_deleted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"1").unwrap();
        let store = LocalFileStore::open(dir.path());
        assert!(!store.is_owned());

        let reclaimer = BackgroundReclaimer::new(Duration::from_secs(1));
        store.dispose(&reclaimer);
        reclaimer.wait_until_finished();
        assert_eq!(store.get("a").unwrap(), b"1");
    }
}
