//! Local-disk implementation of the object-storage contract.
//!
//! Production deployments point `BaseImageStore` at real object storage;
//! this implementation backs single-node setups and development.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::traits::BaseImageStore;

pub struct LocalImageStore {
    root: PathBuf,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        // Keys are server-generated, but refuse traversal anyway.
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            anyhow::bail!("invalid image key: {key}");
        }
        Ok(self.root.join(Path::new(key)))
    }
}

#[async_trait]
impl BaseImageStore for LocalImageStore {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let dir = std::env::temp_dir().join(format!("menulens-store-{}", uuid::Uuid::new_v4()));
        let store = LocalImageStore::new(&dir);

        let key = "uploads/abc123.jpg";
        let stored = store.put(key, b"fake-jpeg", "image/jpeg").await.unwrap();
        assert_eq!(stored, key);

        let bytes = store.get(key).await.unwrap();
        assert_eq!(bytes, b"fake-jpeg");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let store = LocalImageStore::new("/tmp");
        assert!(store.get("../etc/passwd").await.is_err());
    }
}
