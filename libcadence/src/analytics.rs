//! Engagement metrics collection
//!
//! Periodically asks each network for the latest numbers on recently
//! published posts and stores the snapshot. Collection is best effort: a
//! post whose metrics cannot be fetched keeps its previous snapshot.

use serde::Serialize;

use crate::config::AnalyticsConfig;
use crate::db::Database;
use crate::error::Result;
use crate::platforms::PublisherRegistry;
use crate::types::Post;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalyticsReport {
    pub examined: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct AnalyticsFetcher {
    db: Database,
    publishers: PublisherRegistry,
    window: i64,
    batch_size: i64,
}

impl AnalyticsFetcher {
    pub fn new(db: Database, publishers: PublisherRegistry, config: &AnalyticsConfig) -> Self {
        Self {
            db,
            publishers,
            window: config.window as i64,
            batch_size: config.batch_size,
        }
    }

    /// Refresh metrics for every post published within the window
    pub async fn run_once(&self, now: i64) -> Result<AnalyticsReport> {
        let posts = self.db.published_since(now - self.window, self.batch_size).await?;
        let mut report = AnalyticsReport {
            examined: posts.len(),
            ..Default::default()
        };

        for post in &posts {
            match self.collect(post, now).await {
                Ok(true) => report.updated += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(post_id = %post.id, error = %e, "Metrics fetch failed");
                    report.failed += 1;
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                updated = report.updated,
                skipped = report.skipped,
                failed = report.failed,
                "Metrics collection finished"
            );
        }
        Ok(report)
    }

    /// Returns `false` when there is nothing to ask the network about
    async fn collect(&self, post: &Post, now: i64) -> Result<bool> {
        let platform_post_id = match &post.platform_post_id {
            Some(id) => id,
            None => return Ok(false),
        };
        let publisher = match self.publishers.get(post.network) {
            Some(publisher) => publisher,
            None => return Ok(false),
        };
        let account = match self.db.get_account(&post.account_id).await? {
            Some(account) if account.is_publishable() => account,
            _ => {
                tracing::debug!(post_id = %post.id, "Account unavailable, skipping metrics");
                return Ok(false);
            }
        };

        let metrics = publisher.fetch_metrics(&account, platform_post_id).await?;
        self.db.upsert_metrics(&post.id, &metrics, now).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{seed_account, setup_test_db};
    use crate::error::PublishError;
    use crate::platforms::mock::MockNetwork;
    use crate::types::{Network, PostMetrics};
    use std::sync::Arc;

    const NOW: i64 = 1_700_000_000;

    async fn published_post(db: &Database, platform_post_id: &str, published_at: i64) -> String {
        let account = seed_account(db, "user-1", Network::LinkedIn).await;
        let post = Post::new_draft("user-1", &account, "hi".to_string(), vec![], published_at - 100);
        db.insert_post(&post).await.unwrap();
        db.schedule_draft(&post.id, 0, published_at, published_at - 50).await.unwrap();
        db.claim_post(&post.id, "lease", published_at).await.unwrap();
        db.mark_published(&post.id, "lease", platform_post_id, published_at)
            .await
            .unwrap();
        post.id
    }

    fn fetcher(db: &Database, network: &MockNetwork) -> AnalyticsFetcher {
        let mut publishers = PublisherRegistry::new();
        publishers.register_api(Network::LinkedIn, Arc::new(network.clone()));
        AnalyticsFetcher::new(db.clone(), publishers, &AnalyticsConfig::default())
    }

    #[tokio::test]
    async fn test_collects_recent_posts_only() {
        let (_dir, db) = setup_test_db().await;
        let recent = published_post(&db, "li-1", NOW - 3600).await;
        let old = published_post(&db, "li-2", NOW - 30 * 86_400).await;

        let network = MockNetwork::success();
        network.set_metrics(
            "li-1",
            PostMetrics {
                impressions: 100,
                likes: 7,
                comments: 2,
                shares: 1,
            },
        );

        let report = fetcher(&db, &network).run_once(NOW).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.updated, 1);

        let (metrics, fetched_at) = db.get_metrics(&recent).await.unwrap().unwrap();
        assert_eq!(metrics.likes, 7);
        assert_eq!(fetched_at, NOW);
        assert!(db.get_metrics(&old).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (_dir, db) = setup_test_db().await;
        let id = published_post(&db, "li-1", NOW - 60).await;

        let network = MockNetwork::success();
        network.fail_metrics(PublishError::RateLimited {
            message: "later".to_string(),
            retry_after: Some(60),
        });

        let report = fetcher(&db, &network).run_once(NOW).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(db.get_metrics(&id).await.unwrap().is_none());
    }
}
