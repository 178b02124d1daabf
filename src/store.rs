//! Filesystem-backed blob store.
//!
//! The client service treats stored objects as opaque byte blobs addressed
//! by name. Blobs live as regular files under a root directory; the
//! hex-encoded name is the file name, which keeps arbitrary client names
//! from escaping the root.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::debug;

/// Byte-blob storage under a single root directory.
#[derive(Clone, Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating store directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(hex::encode(name.as_bytes()))
    }

    /// Store `bytes` under `name`, replacing any previous content.
    pub async fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(name);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing blob {}", path.display()))?;
        debug!(name, len = bytes.len(), "stored blob");
        Ok(())
    }

    /// Fetch the blob stored under `name`, or `None` if there is none.
    pub async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading blob {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_returns_the_same_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsStore::open(dir.path()).await.expect("open store");

        store.put("hello", b"world").await.expect("put");
        assert_eq!(store.get("hello").await.expect("get"), Some(b"world".to_vec()));

        store.put("hello", b"again").await.expect("overwrite");
        assert_eq!(store.get("hello").await.expect("get"), Some(b"again".to_vec()));
    }

    #[tokio::test]
    async fn missing_blob_is_none_and_names_stay_inside_the_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsStore::open(dir.path()).await.expect("open store");

        assert_eq!(store.get("absent").await.expect("get"), None);

        // A hostile name must not resolve outside the store root.
        store.put("../escape", b"x").await.expect("put");
        assert_eq!(store.get("../escape").await.expect("get"), Some(b"x".to_vec()));
        assert!(!dir.path().parent().unwrap().join("escape").exists());
    }
}
