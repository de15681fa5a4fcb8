//! Post, publish attempt and metrics queries

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{corrupt, Database};
use crate::error::{DbError, Result};
use crate::types::{AttemptOutcome, Network, Post, PostMetrics, PostStatus, PublishAttempt};

const POST_COLUMNS: &str = "id, user_id, account_id, network, content, media_ids, status, \
     scheduled_for, version, retry_count, last_error, platform_post_id, created_at, \
     updated_at, claimed_at, lease_id, reclaimed_at, published_at, cancelled_at";

fn decode_post(row: &SqliteRow) -> Result<Post> {
    let network: String = row.try_get("network").map_err(DbError::SqlxError)?;
    let status: String = row.try_get("status").map_err(DbError::SqlxError)?;
    let media_ids: String = row.try_get("media_ids").map_err(DbError::SqlxError)?;

    Ok(Post {
        id: row.try_get("id").map_err(DbError::SqlxError)?,
        user_id: row.try_get("user_id").map_err(DbError::SqlxError)?,
        account_id: row.try_get("account_id").map_err(DbError::SqlxError)?,
        network: network
            .parse::<Network>()
            .map_err(|e| corrupt("posts", e))?,
        content: row.try_get("content").map_err(DbError::SqlxError)?,
        media_ids: serde_json::from_str(&media_ids)
            .map_err(|e| corrupt("posts", format!("media_ids: {}", e)))?,
        status: PostStatus::parse(&status)
            .ok_or_else(|| corrupt("posts", format!("unknown status '{}'", status)))?,
        scheduled_for: row.try_get("scheduled_for").map_err(DbError::SqlxError)?,
        version: row.try_get("version").map_err(DbError::SqlxError)?,
        retry_count: row.try_get("retry_count").map_err(DbError::SqlxError)?,
        last_error: row.try_get("last_error").map_err(DbError::SqlxError)?,
        platform_post_id: row.try_get("platform_post_id").map_err(DbError::SqlxError)?,
        created_at: row.try_get("created_at").map_err(DbError::SqlxError)?,
        updated_at: row.try_get("updated_at").map_err(DbError::SqlxError)?,
        claimed_at: row.try_get("claimed_at").map_err(DbError::SqlxError)?,
        lease_id: row.try_get("lease_id").map_err(DbError::SqlxError)?,
        reclaimed_at: row.try_get("reclaimed_at").map_err(DbError::SqlxError)?,
        published_at: row.try_get("published_at").map_err(DbError::SqlxError)?,
        cancelled_at: row.try_get("cancelled_at").map_err(DbError::SqlxError)?,
    })
}

fn encode_media_ids(media_ids: &[String]) -> Result<String> {
    serde_json::to_string(media_ids)
        .map_err(|e| corrupt("posts", format!("media_ids: {}", e)).into())
}

impl Database {
    /// Insert a new post row
    pub async fn insert_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (
                id, user_id, account_id, network, content, media_ids, status,
                scheduled_for, version, retry_count, last_error, platform_post_id,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.user_id)
        .bind(&post.account_id)
        .bind(post.network.as_str())
        .bind(&post.content)
        .bind(encode_media_ids(&post.media_ids)?)
        .bind(post.status.as_str())
        .bind(post.scheduled_for)
        .bind(post.version)
        .bind(post.retry_count)
        .bind(&post.last_error)
        .bind(&post.platform_post_id)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Get a post by ID
    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(&format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS))
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(decode_post).transpose()
    }

    /// List a user's posts, newest first
    pub async fn list_posts(
        &self,
        user_id: &str,
        status: Option<PostStatus>,
        limit: i64,
    ) -> Result<Vec<Post>> {
        let rows = match status {
            Some(status) => sqlx::query(&format!(
                "SELECT {} FROM posts WHERE user_id = ? AND status = ? \
                 ORDER BY COALESCE(scheduled_for, created_at) DESC LIMIT ?",
                POST_COLUMNS
            ))
            .bind(user_id)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(&format!(
                "SELECT {} FROM posts WHERE user_id = ? \
                 ORDER BY COALESCE(scheduled_for, created_at) DESC LIMIT ?",
                POST_COLUMNS
            ))
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_post).collect()
    }

    /// Latest `scheduled_for` among a user's scheduled posts
    pub async fn latest_scheduled_for(&self, user_id: &str) -> Result<Option<i64>> {
        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MAX(scheduled_for) FROM posts
            WHERE user_id = ? AND status = 'scheduled'
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.0)
    }

    // ========================================================================
    // Draft edits (optimistic concurrency)
    // ========================================================================

    /// Replace a draft's content and media if it is still at `expected_version`
    pub async fn update_draft(
        &self,
        post_id: &str,
        expected_version: i64,
        content: &str,
        media_ids: &[String],
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET content = ?, media_ids = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ? AND status = 'draft'
            "#,
        )
        .bind(content)
        .bind(encode_media_ids(media_ids)?)
        .bind(now)
        .bind(post_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Move a draft at `expected_version` to `scheduled`
    pub async fn schedule_draft(
        &self,
        post_id: &str,
        expected_version: i64,
        scheduled_for: i64,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'scheduled', scheduled_for = ?, version = version + 1,
                cancelled_at = NULL, updated_at = ?
            WHERE id = ? AND version = ? AND status = 'draft'
            "#,
        )
        .bind(scheduled_for)
        .bind(now)
        .bind(post_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Arm a draft or scheduled post for immediate publication
    pub async fn arm_now(&self, post_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'scheduled', scheduled_for = ?, version = version + 1,
                cancelled_at = NULL, updated_at = ?
            WHERE id = ? AND status IN ('draft', 'scheduled')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Return a scheduled post to draft. Races fairly against `claim_post`.
    pub async fn cancel_scheduled(&self, post_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'draft', scheduled_for = NULL, version = version + 1,
                cancelled_at = ?, updated_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Hard-delete a post, only while it is a draft
    pub async fn delete_draft(&self, post_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM posts WHERE id = ? AND status = 'draft'")
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    // ========================================================================
    // Scheduler claim protocol
    // ========================================================================

    /// Scheduled posts whose time has come, oldest first
    pub async fn due_posts(&self, now: i64, limit: i64) -> Result<Vec<Post>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM posts WHERE status = 'scheduled' AND scheduled_for <= ? \
             ORDER BY scheduled_for ASC LIMIT ?",
            POST_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_post).collect()
    }

    /// Move a due post that could not be sent yet to a later time
    ///
    /// Guarded on the `scheduled_for` the caller saw, so a cancel or
    /// reschedule in between wins. No retry is consumed.
    pub async fn defer_post(&self, post_id: &str, seen_at: i64, until: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET scheduled_for = ?, updated_at = ?
            WHERE id = ? AND status = 'scheduled' AND scheduled_for = ?
            "#,
        )
        .bind(until)
        .bind(now)
        .bind(post_id)
        .bind(seen_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-swap `scheduled -> publishing`
    ///
    /// Returns `false` when another worker (or a cancel) got there first.
    pub async fn claim_post(&self, post_id: &str, lease_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'publishing', scheduled_for = NULL, claimed_at = ?, lease_id = ?,
                updated_at = ?
            WHERE id = ? AND status = 'scheduled'
            "#,
        )
        .bind(now)
        .bind(lease_id)
        .bind(now)
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// `publishing -> published`, only for the lease holder
    pub async fn mark_published(
        &self,
        post_id: &str,
        lease_id: &str,
        platform_post_id: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'published', platform_post_id = ?, published_at = ?, last_error = NULL,
                claimed_at = NULL, lease_id = NULL, reclaimed_at = NULL, updated_at = ?
            WHERE id = ? AND status = 'publishing' AND lease_id = ?
            "#,
        )
        .bind(platform_post_id)
        .bind(now)
        .bind(now)
        .bind(post_id)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// `publishing -> scheduled` at `next_attempt_at`, always consuming one retry
    pub async fn rearm_post(
        &self,
        post_id: &str,
        lease_id: &str,
        next_attempt_at: i64,
        last_error: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'scheduled', scheduled_for = ?, retry_count = retry_count + 1,
                last_error = ?, claimed_at = NULL, lease_id = NULL, reclaimed_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'publishing' AND lease_id = ?
            "#,
        )
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(now)
        .bind(post_id)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// `publishing -> failed`, keeping `retry_count` as it is
    pub async fn mark_failed(
        &self,
        post_id: &str,
        lease_id: &str,
        last_error: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET status = 'failed', last_error = ?, claimed_at = NULL, lease_id = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'publishing' AND lease_id = ?
            "#,
        )
        .bind(last_error)
        .bind(now)
        .bind(post_id)
        .bind(lease_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Return posts stuck in `publishing` since `claimed_before` to `scheduled`
    ///
    /// `retry_count` is left alone: the interrupted attempt may have gone out,
    /// so the next attempt reuses its idempotency key. Returns the recovered ids.
    pub async fn reclaim_stale_leases(&self, claimed_before: i64, now: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE posts
            SET status = 'scheduled', scheduled_for = ?, claimed_at = NULL, lease_id = NULL,
                reclaimed_at = ?, updated_at = ?
            WHERE status = 'publishing' AND claimed_at <= ?
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(claimed_before)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Posts published at or after `since`, for metrics collection
    pub async fn published_since(&self, since: i64, limit: i64) -> Result<Vec<Post>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM posts WHERE status = 'published' AND published_at >= ? \
             ORDER BY published_at DESC LIMIT ?",
            POST_COLUMNS
        ))
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_post).collect()
    }

    // ========================================================================
    // Publish attempts
    // ========================================================================

    pub async fn record_attempt(&self, attempt: &PublishAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publish_attempts (
                post_id, attempt, started_at, finished_at, outcome, platform_post_id, error
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attempt.post_id)
        .bind(attempt.attempt)
        .bind(attempt.started_at)
        .bind(attempt.finished_at)
        .bind(attempt.outcome.as_str())
        .bind(&attempt.platform_post_id)
        .bind(&attempt.error)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn list_attempts(&self, post_id: &str) -> Result<Vec<PublishAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, attempt, started_at, finished_at, outcome, platform_post_id, error
            FROM publish_attempts
            WHERE post_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| -> Result<PublishAttempt> {
                let outcome: String = r.try_get("outcome").map_err(DbError::SqlxError)?;
                Ok(PublishAttempt {
                    id: r.try_get("id").map_err(DbError::SqlxError)?,
                    post_id: r.try_get("post_id").map_err(DbError::SqlxError)?,
                    attempt: r.try_get("attempt").map_err(DbError::SqlxError)?,
                    started_at: r.try_get("started_at").map_err(DbError::SqlxError)?,
                    finished_at: r.try_get("finished_at").map_err(DbError::SqlxError)?,
                    outcome: AttemptOutcome::parse(&outcome).ok_or_else(|| {
                        corrupt("publish_attempts", format!("unknown outcome '{}'", outcome))
                    })?,
                    platform_post_id: r.try_get("platform_post_id").map_err(DbError::SqlxError)?,
                    error: r.try_get("error").map_err(DbError::SqlxError)?,
                })
            })
            .collect()
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    pub async fn upsert_metrics(&self, post_id: &str, metrics: &PostMetrics, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO post_metrics (post_id, impressions, likes, comments, shares, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(post_id) DO UPDATE SET
                impressions = excluded.impressions,
                likes = excluded.likes,
                comments = excluded.comments,
                shares = excluded.shares,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(post_id)
        .bind(metrics.impressions)
        .bind(metrics.likes)
        .bind(metrics.comments)
        .bind(metrics.shares)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_metrics(&self, post_id: &str) -> Result<Option<(PostMetrics, i64)>> {
        let row: Option<(i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT impressions, likes, comments, shares, fetched_at
            FROM post_metrics WHERE post_id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|(impressions, likes, comments, shares, fetched_at)| {
            (
                PostMetrics {
                    impressions,
                    likes,
                    comments,
                    shares,
                },
                fetched_at,
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{seed_account, setup_test_db};
    use crate::types::{Network, Post, PostStatus};

    async fn seed_scheduled(db: &crate::Database, at: i64) -> Post {
        let account = seed_account(db, "user-1", Network::X).await;
        let post = Post::new_draft("user-1", &account, "hello".to_string(), vec![], 1_000);
        db.insert_post(&post).await.unwrap();
        assert!(db.schedule_draft(&post.id, 0, at, 1_000).await.unwrap());
        db.get_post(&post.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trips_media_order() {
        let (_temp, db) = setup_test_db().await;
        let account = seed_account(&db, "user-1", Network::Facebook).await;
        let media = vec!["m2".to_string(), "m1".to_string(), "m3".to_string()];
        let post = Post::new_draft("user-1", &account, "hi".to_string(), media.clone(), 1_000);

        db.insert_post(&post).await.unwrap();
        let stored = db.get_post(&post.id).await.unwrap().unwrap();

        assert_eq!(stored.media_ids, media, "media order must be preserved");
        assert_eq!(stored.status, PostStatus::Draft);
        assert_eq!(stored.version, 0);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (_temp, db) = setup_test_db().await;
        let post = seed_scheduled(&db, 2_000).await;

        assert!(db.claim_post(&post.id, "lease-a", 2_000).await.unwrap());
        assert!(!db.claim_post(&post.id, "lease-b", 2_000).await.unwrap());

        let stored = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Publishing);
        assert_eq!(stored.lease_id.as_deref(), Some("lease-a"));
        assert_eq!(stored.scheduled_for, None);
    }

    #[tokio::test]
    async fn test_completion_requires_lease() {
        let (_temp, db) = setup_test_db().await;
        let post = seed_scheduled(&db, 2_000).await;
        assert!(db.claim_post(&post.id, "lease-a", 2_000).await.unwrap());

        assert!(!db.mark_published(&post.id, "lease-b", "abc", 2_010).await.unwrap());
        assert!(db.mark_published(&post.id, "lease-a", "abc", 2_010).await.unwrap());

        let stored = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Published);
        assert_eq!(stored.platform_post_id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_rearm_increments_retry_count() {
        let (_temp, db) = setup_test_db().await;
        let post = seed_scheduled(&db, 2_000).await;
        assert!(db.claim_post(&post.id, "lease-a", 2_000).await.unwrap());

        assert!(db.rearm_post(&post.id, "lease-a", 2_120, "rate limited", 2_000).await.unwrap());

        let stored = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Scheduled);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.scheduled_for, Some(2_120));
        assert_eq!(stored.last_error.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn test_defer_keeps_retry_count_and_respects_reschedule() {
        let (_temp, db) = setup_test_db().await;
        let post = seed_scheduled(&db, 2_000).await;

        assert!(db.defer_post(&post.id, 2_000, 3_600, 2_010).await.unwrap());
        let stored = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Scheduled);
        assert_eq!(stored.scheduled_for, Some(3_600));
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.version, post.version);

        // A stale view of the schedule does not overwrite it
        assert!(!db.defer_post(&post.id, 2_000, 7_200, 2_020).await.unwrap());
        assert_eq!(
            db.get_post(&post.id).await.unwrap().unwrap().scheduled_for,
            Some(3_600)
        );
    }

    #[tokio::test]
    async fn test_reclaim_only_touches_stale_leases() {
        let (_temp, db) = setup_test_db().await;
        let stale = seed_scheduled(&db, 2_000).await;
        let fresh = seed_scheduled(&db, 2_000).await;
        assert!(db.claim_post(&stale.id, "lease-a", 2_000).await.unwrap());
        assert!(db.claim_post(&fresh.id, "lease-b", 2_500).await.unwrap());

        let reclaimed = db.reclaim_stale_leases(2_100, 2_700).await.unwrap();
        assert_eq!(reclaimed, vec![stale.id.clone()]);

        let stored = db.get_post(&stale.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Scheduled);
        assert_eq!(stored.retry_count, 0, "reclaim must not consume a retry");
        assert_eq!(stored.reclaimed_at, Some(2_700));

        let untouched = db.get_post(&fresh.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, PostStatus::Publishing);
    }

    #[tokio::test]
    async fn test_cancel_races_with_claim() {
        let (_temp, db) = setup_test_db().await;
        let post = seed_scheduled(&db, 2_000).await;

        assert!(db.claim_post(&post.id, "lease-a", 2_000).await.unwrap());
        assert!(!db.cancel_scheduled(&post.id, 2_001).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_only_drafts() {
        let (_temp, db) = setup_test_db().await;
        let post = seed_scheduled(&db, 2_000).await;

        assert!(!db.delete_draft(&post.id).await.unwrap());
        assert!(db.cancel_scheduled(&post.id, 1_500).await.unwrap());
        assert!(db.delete_draft(&post.id).await.unwrap());
        assert!(db.get_post(&post.id).await.unwrap().is_none());
    }
}
