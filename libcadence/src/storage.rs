//! Object storage for uploaded media

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use crate::error::MediaError;

/// Blob store that serves what it holds at a public URL
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `key`, replacing any existing object
    async fn put_object(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), MediaError>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, MediaError>;

    async fn delete_object(&self, key: &str) -> Result<(), MediaError>;

    /// URL networks fetch the object from
    fn public_url(&self, key: &str) -> String;
}

/// Filesystem-backed store, served by whatever fronts `root`
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<str>, public_base_url: impl Into<String>) -> Self {
        let root = shellexpand::tilde(root.as_ref()).to_string();
        Self {
            root: PathBuf::from(root),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Resolve `key` under the root, refusing anything that escapes it
    fn path_for(&self, key: &str) -> Result<PathBuf, MediaError> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(MediaError::Storage(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<(), MediaError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MediaError::Storage(format!("failed to create {}: {}", parent.display(), e)))?;
        }

        // Write then rename so readers never see a partial file
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| MediaError::Storage(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| MediaError::Storage(format!("failed to store {}: {}", path.display(), e)))?;

        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, MediaError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| MediaError::Storage(format!("failed to read {}: {}", path.display(), e)))
    }

    async fn delete_object(&self, key: &str) -> Result<(), MediaError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MediaError::Storage(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}
