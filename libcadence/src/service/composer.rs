//! Post composer
//!
//! Every edit a user makes is a conditional write keyed on the version they
//! last read. Losing the race surfaces as `StaleVersionConflict`; the caller
//! re-fetches and retries. Scheduling is itself a versioned edit, and the
//! only user-initiated moves out of `scheduled` (cancel, publish now) are
//! compare-and-swaps that race fairly with the scheduler's claim.

use crate::db::Database;
use crate::error::{CadenceError, PublishError, Result};
use crate::platforms::PublisherRegistry;
use crate::service::media::MediaRegistry;
use crate::types::{Post, PostStatus};

pub const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct PostComposer {
    db: Database,
    media: MediaRegistry,
    publishers: PublisherRegistry,
}

impl PostComposer {
    pub fn new(db: Database, media: MediaRegistry, publishers: PublisherRegistry) -> Self {
        Self {
            db,
            media,
            publishers,
        }
    }

    /// Create a draft for one of the user's accounts
    pub async fn create_draft(
        &self,
        user_id: &str,
        account_id: &str,
        content: String,
        media_ids: Vec<String>,
        now: i64,
    ) -> Result<Post> {
        let account = self
            .db
            .get_account(account_id)
            .await?
            .filter(|a| a.user_id == user_id)
            .ok_or_else(|| CadenceError::NotFound(format!("account {}", account_id)))?;

        if !account.is_active {
            return Err(CadenceError::InvalidInput(format!(
                "account {} has been disconnected",
                account_id
            )));
        }

        self.media.ensure_attachable(user_id, &media_ids, &[]).await?;

        let post = Post::new_draft(user_id, &account, content, media_ids, now);
        self.db.insert_post(&post).await?;

        tracing::debug!(post_id = %post.id, network = %post.network, "Draft created");
        Ok(post)
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Post> {
        self.db
            .get_post(post_id)
            .await?
            .ok_or_else(|| CadenceError::NotFound(format!("post {}", post_id)))
    }

    pub async fn list_posts(
        &self,
        user_id: &str,
        status: Option<PostStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<Post>> {
        self.db
            .list_posts(user_id, status, limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .await
    }

    /// Replace a draft's content and media
    ///
    /// # Errors
    ///
    /// - `StaleVersionConflict` if the draft changed since `expected_version`
    /// - `InvalidState` if the post is no longer a draft
    pub async fn update_draft(
        &self,
        post_id: &str,
        expected_version: i64,
        content: String,
        media_ids: Vec<String>,
        now: i64,
    ) -> Result<Post> {
        let current = self.get_post(post_id).await?;
        self.check_editable(&current, expected_version, "edit")?;

        // Media deleted after it was attached stays attachable to this post
        self.media
            .ensure_attachable(&current.user_id, &media_ids, &current.media_ids)
            .await?;

        let updated = self
            .db
            .update_draft(post_id, expected_version, &content, &media_ids, now)
            .await?;
        if !updated {
            return Err(self.explain_lost_write(post_id, expected_version, "edit").await);
        }

        self.get_post(post_id).await
    }

    /// Move a draft to `scheduled` at `scheduled_for`
    pub async fn schedule(
        &self,
        post_id: &str,
        expected_version: i64,
        scheduled_for: i64,
        now: i64,
    ) -> Result<Post> {
        if scheduled_for <= now {
            return Err(CadenceError::InvalidInput(
                "Scheduled time must be in the future".to_string(),
            ));
        }

        let current = self.get_post(post_id).await?;
        self.check_editable(&current, expected_version, "schedule")?;
        self.check_publishable_content(&current).await?;

        let scheduled = self
            .db
            .schedule_draft(post_id, expected_version, scheduled_for, now)
            .await?;
        if !scheduled {
            return Err(self
                .explain_lost_write(post_id, expected_version, "schedule")
                .await);
        }

        tracing::info!(post_id, scheduled_for, "Post scheduled");
        self.get_post(post_id).await
    }

    /// Return a scheduled post to draft
    ///
    /// Cancelling a draft is a no-op. A post the scheduler has already claimed
    /// is past the point of no return.
    ///
    /// # Errors
    ///
    /// `NotCancellable` once the post is `publishing`, `published` or `failed`.
    pub async fn cancel_schedule(&self, post_id: &str, now: i64) -> Result<Post> {
        let current = self.get_post(post_id).await?;

        match current.status {
            PostStatus::Draft => return Ok(current),
            PostStatus::Scheduled => {}
            status => {
                return Err(CadenceError::NotCancellable {
                    post_id: post_id.to_string(),
                    status,
                })
            }
        }

        if self.db.cancel_scheduled(post_id, now).await? {
            tracing::info!(post_id, "Schedule cancelled");
            return self.get_post(post_id).await;
        }

        // Lost the race: either another cancel (fine) or a claim (too late)
        let after = self.get_post(post_id).await?;
        if after.status == PostStatus::Draft {
            Ok(after)
        } else {
            Err(CadenceError::NotCancellable {
                post_id: post_id.to_string(),
                status: after.status,
            })
        }
    }

    /// Delete a post; only drafts can be deleted
    pub async fn delete_draft(&self, post_id: &str) -> Result<()> {
        let current = self.get_post(post_id).await?;
        if current.status != PostStatus::Draft {
            return Err(CadenceError::InvalidState {
                post_id: post_id.to_string(),
                status: current.status,
                operation: "delete",
            });
        }

        if !self.db.delete_draft(post_id).await? {
            let after = self.get_post(post_id).await?;
            return Err(CadenceError::InvalidState {
                post_id: post_id.to_string(),
                status: after.status,
                operation: "delete",
            });
        }

        tracing::info!(post_id, "Draft deleted");
        Ok(())
    }

    /// Arm a draft or scheduled post for immediate publication
    ///
    /// Goes through the same conditional transitions as scheduling, so a
    /// post already claimed by a sweep is reported rather than armed again.
    pub async fn arm_now(&self, post_id: &str, now: i64) -> Result<Post> {
        let current = self.get_post(post_id).await?;
        if !matches!(current.status, PostStatus::Draft | PostStatus::Scheduled) {
            return Err(CadenceError::InvalidState {
                post_id: post_id.to_string(),
                status: current.status,
                operation: "publish",
            });
        }
        self.check_publishable_content(&current).await?;

        if !self.db.arm_now(post_id, now).await? {
            let after = self.get_post(post_id).await?;
            return Err(CadenceError::InvalidState {
                post_id: post_id.to_string(),
                status: after.status,
                operation: "publish",
            });
        }

        self.get_post(post_id).await
    }

    fn check_editable(&self, post: &Post, expected_version: i64, operation: &'static str) -> Result<()> {
        if post.status != PostStatus::Draft {
            return Err(CadenceError::InvalidState {
                post_id: post.id.clone(),
                status: post.status,
                operation,
            });
        }
        if post.version != expected_version {
            return Err(CadenceError::StaleVersionConflict {
                post_id: post.id.clone(),
                expected: expected_version,
                current: post.version,
            });
        }
        Ok(())
    }

    /// Network content rules, checked before a post is queued
    async fn check_publishable_content(&self, post: &Post) -> Result<()> {
        let media = self.db.get_media_many(&post.media_ids).await?;
        if media.len() != post.media_ids.len() {
            return Err(CadenceError::InvalidInput(
                "Some attached media items no longer exist".to_string(),
            ));
        }

        let publisher = match self.publishers.get(post.network) {
            Some(publisher) => publisher,
            None => {
                tracing::debug!(network = %post.network, "No publisher registered, skipping content rules");
                return Ok(());
            }
        };

        publisher
            .check_content(&post.content, &media)
            .map(|_| ())
            .map_err(|e| match e {
                PublishError::Validation(msg) => CadenceError::InvalidInput(msg),
                other => other.into(),
            })
    }

    /// Why a conditional write affected no rows
    async fn explain_lost_write(
        &self,
        post_id: &str,
        expected_version: i64,
        operation: &'static str,
    ) -> CadenceError {
        match self.db.get_post(post_id).await {
            Ok(Some(post)) if post.status != PostStatus::Draft => CadenceError::InvalidState {
                post_id: post_id.to_string(),
                status: post.status,
                operation,
            },
            Ok(Some(post)) => CadenceError::StaleVersionConflict {
                post_id: post_id.to_string(),
                expected: expected_version,
                current: post.version,
            },
            Ok(None) => CadenceError::NotFound(format!("post {}", post_id)),
            Err(e) => e,
        }
    }
}
