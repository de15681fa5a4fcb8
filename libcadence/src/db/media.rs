//! Media item queries

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{corrupt, Database};
use crate::error::{DbError, Result};
use crate::types::{MediaItem, MediaKind};

const MEDIA_COLUMNS: &str = "id, user_id, storage_path, public_url, kind, content_type, \
     size_bytes, folder, created_at, deleted_at";

fn decode_media(row: &SqliteRow) -> Result<MediaItem> {
    let kind: String = row.try_get("kind").map_err(DbError::SqlxError)?;

    Ok(MediaItem {
        id: row.try_get("id").map_err(DbError::SqlxError)?,
        user_id: row.try_get("user_id").map_err(DbError::SqlxError)?,
        storage_path: row.try_get("storage_path").map_err(DbError::SqlxError)?,
        public_url: row.try_get("public_url").map_err(DbError::SqlxError)?,
        kind: MediaKind::parse(&kind)
            .ok_or_else(|| corrupt("media_items", format!("unknown kind '{}'", kind)))?,
        content_type: row.try_get("content_type").map_err(DbError::SqlxError)?,
        size_bytes: row.try_get("size_bytes").map_err(DbError::SqlxError)?,
        folder: row.try_get("folder").map_err(DbError::SqlxError)?,
        created_at: row.try_get("created_at").map_err(DbError::SqlxError)?,
        deleted_at: row.try_get("deleted_at").map_err(DbError::SqlxError)?,
    })
}

impl Database {
    pub async fn insert_media(&self, item: &MediaItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO media_items (
                id, user_id, storage_path, public_url, kind, content_type, size_bytes,
                folder, created_at, deleted_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.id)
        .bind(&item.user_id)
        .bind(&item.storage_path)
        .bind(&item.public_url)
        .bind(item.kind.as_str())
        .bind(&item.content_type)
        .bind(item.size_bytes)
        .bind(&item.folder)
        .bind(item.created_at)
        .bind(item.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Fetch one media item, deleted or not
    pub async fn get_media(&self, media_id: &str) -> Result<Option<MediaItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM media_items WHERE id = ?",
            MEDIA_COLUMNS
        ))
        .bind(media_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(decode_media).transpose()
    }

    /// Fetch media items in the order of `media_ids`, skipping unknown ids
    ///
    /// Soft-deleted items are included: posts keep their recorded references.
    pub async fn get_media_many(&self, media_ids: &[String]) -> Result<Vec<MediaItem>> {
        let mut items = Vec::with_capacity(media_ids.len());
        for id in media_ids {
            if let Some(item) = self.get_media(id).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// A user's media, optionally restricted to one folder, newest first
    pub async fn list_media(
        &self,
        user_id: &str,
        folder: Option<&str>,
        include_deleted: bool,
    ) -> Result<Vec<MediaItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM media_items \
             WHERE user_id = ? AND (? IS NULL OR folder = ?) AND (deleted_at IS NULL OR ?) \
             ORDER BY created_at DESC, id ASC",
            MEDIA_COLUMNS
        ))
        .bind(user_id)
        .bind(folder)
        .bind(folder)
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_media).collect()
    }

    /// Set `deleted_at` on a live item owned by `user_id`
    pub async fn soft_delete_media(&self, media_id: &str, user_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media_items SET deleted_at = ?
            WHERE id = ? AND user_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now)
        .bind(media_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }
}
