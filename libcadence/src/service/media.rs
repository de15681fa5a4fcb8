//! Media registry
//!
//! Uploads are validated, written to the object store under a
//! content-addressed key (`{user}/{folder}/{sha256}.{ext}`) and recorded.
//! Deletion is soft: the row gets `deleted_at`, disappears from listings and
//! can no longer be attached, but posts that already reference it keep their
//! reference.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::MediaConfig;
use crate::db::Database;
use crate::error::{CadenceError, MediaError, Result};
use crate::storage::ObjectStore;
use crate::types::{MediaItem, MediaKind};

// Object key segment for media not filed in a folder
const UNFILED: &str = "_";

#[derive(Clone)]
pub struct MediaRegistry {
    db: Database,
    store: Arc<dyn ObjectStore>,
    max_image_bytes: u64,
    max_video_bytes: u64,
}

fn extension_for(content_type: &str) -> String {
    let subtype = content_type
        .split(';')
        .next()
        .and_then(|mime| mime.split('/').nth(1))
        .unwrap_or("bin")
        .trim()
        .to_lowercase();

    match subtype.as_str() {
        "jpeg" | "pjpeg" => "jpg".to_string(),
        "quicktime" => "mov".to_string(),
        "svg+xml" => "svg".to_string(),
        other => other.chars().filter(|c| c.is_ascii_alphanumeric()).collect(),
    }
}

fn validate_folder(folder: &str) -> Result<()> {
    let valid = !folder.is_empty()
        && folder != UNFILED
        && folder.len() <= 64
        && folder
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(CadenceError::InvalidInput(format!(
            "Invalid folder name '{}': use 1-64 letters, digits, '-' or '_'",
            folder
        )));
    }
    Ok(())
}

impl MediaRegistry {
    pub fn new(db: Database, store: Arc<dyn ObjectStore>, config: &MediaConfig) -> Self {
        Self {
            db,
            store,
            max_image_bytes: config.max_image_bytes,
            max_video_bytes: config.max_video_bytes,
        }
    }

    /// Store and register an upload
    ///
    /// # Errors
    ///
    /// - `MediaError::UnsupportedType` unless `content_type` is `image/*` or `video/*`
    /// - `MediaError::TooLarge` past the per-kind size limit
    /// - `CadenceError::InvalidInput` for an empty upload or a bad folder name
    pub async fn upload(
        &self,
        user_id: &str,
        bytes: &[u8],
        content_type: &str,
        folder: Option<&str>,
        now: i64,
    ) -> Result<MediaItem> {
        let kind = MediaKind::from_content_type(content_type)
            .ok_or_else(|| MediaError::UnsupportedType(content_type.to_string()))?;

        if bytes.is_empty() {
            return Err(CadenceError::InvalidInput("Upload is empty".to_string()));
        }

        let limit = match kind {
            MediaKind::Image => self.max_image_bytes,
            MediaKind::Video => self.max_video_bytes,
        };
        let size = bytes.len() as u64;
        if size > limit {
            return Err(MediaError::TooLarge {
                kind: kind.to_string(),
                size,
                limit,
            }
            .into());
        }

        if let Some(folder) = folder {
            validate_folder(folder)?;
        }

        let digest = Sha256::digest(bytes);
        let hash: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        let key = format!(
            "{}/{}/{}.{}",
            user_id,
            folder.unwrap_or(UNFILED),
            hash,
            extension_for(content_type)
        );

        self.store.put_object(&key, bytes, content_type).await?;

        let item = MediaItem {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            public_url: self.store.public_url(&key),
            storage_path: key,
            kind,
            content_type: content_type.to_string(),
            size_bytes: size as i64,
            folder: folder.map(str::to_string),
            created_at: now,
            deleted_at: None,
        };
        self.db.insert_media(&item).await?;

        tracing::info!(
            media_id = %item.id,
            user_id,
            kind = %kind,
            size_bytes = size,
            "Media uploaded"
        );
        Ok(item)
    }

    /// Soft-delete one of the user's media items
    ///
    /// Deleting an already deleted item succeeds without changes.
    pub async fn soft_delete(&self, user_id: &str, media_id: &str, now: i64) -> Result<()> {
        let item = self
            .db
            .get_media(media_id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("media item {}", media_id)))?;

        if item.user_id != user_id {
            return Err(MediaError::NotOwned(media_id.to_string()).into());
        }
        if item.is_deleted() {
            return Ok(());
        }

        self.db.soft_delete_media(media_id, user_id, now).await?;
        tracing::info!(media_id, user_id, "Media soft-deleted");
        Ok(())
    }

    /// Live media for a user, optionally within one folder
    pub async fn list(&self, user_id: &str, folder: Option<&str>) -> Result<Vec<MediaItem>> {
        self.db.list_media(user_id, folder, false).await
    }

    pub async fn get(&self, media_id: &str) -> Result<MediaItem> {
        self.db
            .get_media(media_id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("media item {}", media_id)))
    }

    /// Check that every id in `media_ids` may be attached by `user_id`
    ///
    /// Ids in `already_attached` are exempt from the deleted check: a post keeps
    /// media that was deleted after it was attached.
    pub async fn ensure_attachable(
        &self,
        user_id: &str,
        media_ids: &[String],
        already_attached: &[String],
    ) -> Result<()> {
        let grandfathered: HashSet<&str> = already_attached.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();

        for id in media_ids {
            if !seen.insert(id.as_str()) {
                return Err(CadenceError::InvalidInput(format!(
                    "media item {} attached twice",
                    id
                )));
            }

            let item = self.get(id).await?;
            if item.user_id != user_id {
                return Err(MediaError::NotOwned(id.clone()).into());
            }
            if item.is_deleted() && !grandfathered.contains(id.as_str()) {
                return Err(MediaError::Deleted(id.clone()).into());
            }
        }
        Ok(())
    }
}
