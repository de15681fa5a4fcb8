//! Scheduler
//!
//! A sweep does three things:
//!
//! 1. Returns posts stuck in `publishing` past the stale-lease timeout to
//!    `scheduled`. Their `retry_count` is unchanged, so the next attempt
//!    reuses the interrupted attempt's idempotency key.
//! 2. Loads due posts and processes them on a bounded pool of concurrent
//!    workers.
//! 3. For each post: reserves a local rate-limit slot (or defers the post to
//!    the next window), claims the post with a compare-and-swap
//!    `scheduled -> publishing`, calls the publisher with a timeout, then
//!    records the attempt and moves the post on.
//!
//! Only one worker can win a claim, so a post is never published twice by
//! concurrent sweeps. One post failing never affects the others.

pub mod backoff;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::db::Database;
use crate::error::{PublishError, Result};
use crate::platforms::PublisherRegistry;
use crate::rate_limiter::RateLimiter;
use crate::refresher::TokenRefresher;
use crate::service::events::{EngineEvent, EventBus};
use crate::types::{Account, AttemptOutcome, Post, PublishAttempt};

/// What happened to one due post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOutcome {
    Published,
    /// Transient failure; re-armed with backoff
    Retried,
    Failed,
    /// Another worker or a cancel took the post first
    Lost,
    /// Local posts-per-hour ceiling reached; moved to the next window
    Throttled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub due: usize,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
    pub lost: usize,
    pub throttled: usize,
    /// Posts whose processing hit an internal error
    pub errors: usize,
}

impl SweepReport {
    fn tally(&mut self, outcome: ProcessOutcome) {
        match outcome {
            ProcessOutcome::Published => self.published += 1,
            ProcessOutcome::Retried => self.retried += 1,
            ProcessOutcome::Failed => self.failed += 1,
            ProcessOutcome::Lost => self.lost += 1,
            ProcessOutcome::Throttled => self.throttled += 1,
        }
    }
}

/// Clock for one pass
///
/// Starts at the caller's `now` and advances with real elapsed time, so a
/// claim made late in a long batch is stamped when it happened rather than
/// when the sweep began.
#[derive(Debug, Clone, Copy)]
struct PassClock {
    start: i64,
    started: Instant,
}

impl PassClock {
    fn starting_at(now: i64) -> Self {
        Self {
            start: now,
            started: Instant::now(),
        }
    }

    fn now(&self) -> i64 {
        self.start + self.started.elapsed().as_secs() as i64
    }
}

pub struct Scheduler {
    db: Database,
    publishers: PublisherRegistry,
    rate_limiter: RateLimiter,
    refresher: Option<Arc<TokenRefresher>>,
    events: EventBus,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        db: Database,
        publishers: PublisherRegistry,
        rate_limiter: RateLimiter,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            publishers,
            rate_limiter,
            refresher: None,
            events,
            config,
        }
    }

    /// Refresh tokens out of band when a network rejects one
    pub fn with_refresher(mut self, refresher: Arc<TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// One pass: reclaim abandoned leases, then process what is due
    ///
    /// `now` sets the due and stale-lease cutoffs. Claims and attempt
    /// records are stamped with `now` plus the time elapsed in the pass.
    pub async fn sweep(&self, now: i64) -> Result<SweepReport> {
        let clock = PassClock::starting_at(now);
        let mut report = SweepReport::default();

        let stale_before = now - self.config.stale_lease as i64;
        let reclaimed = self.db.reclaim_stale_leases(stale_before, now).await?;
        for post_id in &reclaimed {
            tracing::warn!(post_id = %post_id, "Reclaimed abandoned publishing lease");
            self.events.emit(EngineEvent::LeaseReclaimed {
                post_id: post_id.clone(),
            });
        }
        report.reclaimed = reclaimed.len();

        let due = self.db.due_posts(now, self.config.batch_size).await?;
        report.due = due.len();
        if due.is_empty() {
            return Ok(report);
        }

        tracing::info!(count = due.len(), "Processing due posts");

        let results: Vec<(String, Result<ProcessOutcome>)> = stream::iter(due)
            .map(|post| async move {
                let outcome = self.process(&post, clock).await;
                (post.id, outcome)
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for (post_id, result) in results {
            match result {
                Ok(outcome) => report.tally(outcome),
                Err(e) => {
                    // A claimed post left in publishing is recovered by lease reclaim
                    tracing::error!(post_id = %post_id, error = %e, "Failed to process post");
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            published = report.published,
            retried = report.retried,
            failed = report.failed,
            lost = report.lost,
            throttled = report.throttled,
            errors = report.errors,
            "Sweep finished"
        );

        Ok(report)
    }

    /// Claim and publish one post right away if it is due
    ///
    /// Used by publish-now after the post has been armed.
    pub async fn publish_post(&self, post_id: &str, now: i64) -> Result<ProcessOutcome> {
        match self.db.get_post(post_id).await? {
            Some(post) => self.process(&post, PassClock::starting_at(now)).await,
            None => Ok(ProcessOutcome::Lost),
        }
    }

    async fn process(&self, due: &Post, clock: PassClock) -> Result<ProcessOutcome> {
        let now = clock.now();
        if !self.rate_limiter.try_reserve(&self.db, due.network, now).await? {
            return self.defer(due, now).await;
        }

        let lease_id = Uuid::new_v4().to_string();
        if !self.db.claim_post(&due.id, &lease_id, now).await? {
            self.rate_limiter.release(&self.db, due.network, now).await?;
            tracing::debug!(post_id = %due.id, "Post claimed elsewhere");
            return Ok(ProcessOutcome::Lost);
        }

        // Re-read under the lease: the row may have been edited and re-armed
        // since the due list was loaded
        let post = match self.db.get_post(&due.id).await? {
            Some(post) => post,
            None => return Ok(ProcessOutcome::Lost),
        };

        self.execute(&post, &lease_id, clock).await
    }

    /// Push a post over its network's local ceiling to the next window
    ///
    /// Left at its original time it would stay at the head of every due
    /// batch and starve posts for other networks.
    async fn defer(&self, due: &Post, now: i64) -> Result<ProcessOutcome> {
        let next_window = self.rate_limiter.next_window(now);
        if let Some(seen_at) = due.scheduled_for {
            if self.db.defer_post(&due.id, seen_at, next_window, now).await? {
                tracing::debug!(
                    post_id = %due.id,
                    network = %due.network,
                    next_attempt_at = next_window,
                    "Local rate limit reached, deferred to next window"
                );
            }
        }
        Ok(ProcessOutcome::Throttled)
    }

    async fn execute(&self, post: &Post, lease_id: &str, clock: PassClock) -> Result<ProcessOutcome> {
        let attempt = post.retry_count + 1;
        self.events.emit(EngineEvent::PostClaimed {
            post_id: post.id.clone(),
            network: post.network.to_string(),
            attempt,
        });
        tracing::info!(post_id = %post.id, network = %post.network, attempt, "Publishing post");

        let account = match self.db.get_account(&post.account_id).await? {
            Some(account) => account,
            None => {
                let error = PublishError::AccountDisconnected(format!(
                    "account {} no longer exists",
                    post.account_id
                ));
                return self.settle_failure(post, None, lease_id, error, clock).await;
            }
        };

        let publisher = match self.publishers.get(post.network) {
            Some(publisher) => publisher,
            None => {
                let error = PublishError::Validation(format!(
                    "no publisher configured for {}",
                    post.network
                ));
                return self.settle_failure(post, Some(&account), lease_id, error, clock).await;
            }
        };

        let media = self.db.get_media_many(&post.media_ids).await?;

        let timeout = Duration::from_secs(self.config.publish_timeout);
        let result = match tokio::time::timeout(timeout, publisher.publish(&account, post, &media)).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::NetworkUnreachable(format!(
                "publish timed out after {}s",
                self.config.publish_timeout
            ))),
        };

        match result {
            Ok(platform_post_id) => {
                let now = clock.now();
                self.record(post, attempt, now, AttemptOutcome::Success, Some(&platform_post_id), None)
                    .await?;

                if !self
                    .db
                    .mark_published(&post.id, lease_id, &platform_post_id, now)
                    .await?
                {
                    tracing::warn!(post_id = %post.id, "Lease lost before publish could be recorded");
                    return Ok(ProcessOutcome::Lost);
                }

                tracing::info!(post_id = %post.id, platform_post_id = %platform_post_id, "Post published");
                self.events.emit(EngineEvent::PostPublished {
                    post_id: post.id.clone(),
                    network: post.network.to_string(),
                    platform_post_id,
                });
                Ok(ProcessOutcome::Published)
            }
            Err(error) => self.settle_failure(post, Some(&account), lease_id, error, clock).await,
        }
    }

    /// Record a failed attempt and decide between retry and giving up
    async fn settle_failure(
        &self,
        post: &Post,
        account: Option<&Account>,
        lease_id: &str,
        error: PublishError,
        clock: PassClock,
    ) -> Result<ProcessOutcome> {
        let attempt = post.retry_count + 1;
        let message = format!("{}: {}", error.kind(), error);
        self.record(post, attempt, clock.now(), error.outcome(), None, Some(&message))
            .await?;

        if let (true, Some(account), Some(refresher)) = (error.is_auth(), account, &self.refresher) {
            self.refresh_inline(refresher, account, clock).await;
        }

        if !error.is_transient() {
            return self.give_up(post, lease_id, &message, clock.now()).await;
        }

        let ceiling = match error {
            PublishError::UnknownPlatform(_) => {
                self.config.max_retries.min(self.config.max_unknown_retries)
            }
            _ => self.config.max_retries,
        };
        if post.retry_count >= ceiling {
            let message = format!("giving up after {} retries; last error {}", post.retry_count, message);
            return self.give_up(post, lease_id, &message, clock.now()).await;
        }

        let delay = {
            let mut rng = rand::thread_rng();
            backoff::delay_with_hint(post.retry_count, error.retry_after(), &self.config.backoff, &mut rng)
        };
        let now = clock.now();
        let next_attempt_at = now + delay as i64;

        if !self
            .db
            .rearm_post(&post.id, lease_id, next_attempt_at, &message, now)
            .await?
        {
            tracing::warn!(post_id = %post.id, "Lease lost before retry could be scheduled");
            return Ok(ProcessOutcome::Lost);
        }

        tracing::warn!(
            post_id = %post.id,
            error = %error,
            retry_count = post.retry_count + 1,
            next_attempt_at,
            "Transient publish failure, retrying"
        );
        self.events.emit(EngineEvent::RetryScheduled {
            post_id: post.id.clone(),
            retry_count: post.retry_count + 1,
            next_attempt_at,
            error: message,
        });
        Ok(ProcessOutcome::Retried)
    }

    /// Refresh a rejected token before the retry is armed, within the publish timeout
    async fn refresh_inline(&self, refresher: &TokenRefresher, account: &Account, clock: PassClock) {
        tracing::info!(account_id = %account.id, "Token rejected, refreshing");
        let timeout = Duration::from_secs(self.config.publish_timeout);
        match tokio::time::timeout(timeout, refresher.refresh_account(account, clock.now())).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::error!(account_id = %account.id, error = %e, "Out-of-band token refresh failed");
            }
            Err(_) => {
                tracing::warn!(
                    account_id = %account.id,
                    timeout_secs = self.config.publish_timeout,
                    "Out-of-band token refresh timed out"
                );
            }
        }
    }

    async fn give_up(&self, post: &Post, lease_id: &str, message: &str, now: i64) -> Result<ProcessOutcome> {
        if !self.db.mark_failed(&post.id, lease_id, message, now).await? {
            tracing::warn!(post_id = %post.id, "Lease lost before failure could be recorded");
            return Ok(ProcessOutcome::Lost);
        }

        tracing::error!(post_id = %post.id, error = %message, "Post failed");
        self.events.emit(EngineEvent::PostFailed {
            post_id: post.id.clone(),
            error: message.to_string(),
        });
        Ok(ProcessOutcome::Failed)
    }

    async fn record(
        &self,
        post: &Post,
        attempt: i64,
        finished_at: i64,
        outcome: AttemptOutcome,
        platform_post_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.db
            .record_attempt(&PublishAttempt {
                id: None,
                post_id: post.id.clone(),
                attempt,
                started_at: post.claimed_at.unwrap_or(finished_at),
                finished_at,
                outcome,
                platform_post_id: platform_post_id.map(str::to_string),
                error: error.map(str::to_string),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{seed_account, setup_test_db};
    use crate::oauth::mock::MockOAuthProvider;
    use crate::oauth::ProviderRegistry;
    use crate::platforms::mock::MockNetwork;
    use crate::types::{Network, PostStatus};
    use std::collections::HashMap;
    use tempfile::TempDir;

    const NOW: i64 = 1_700_000_000;

    fn config() -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.backoff.jitter = 0.0;
        config
    }

    fn scheduler(db: &Database, network: MockNetwork, config: SchedulerConfig) -> Scheduler {
        let mut publishers = PublisherRegistry::new();
        publishers.register_api(Network::Facebook, Arc::new(network));
        Scheduler::new(
            db.clone(),
            publishers,
            RateLimiter::default(),
            EventBus::default(),
            config,
        )
    }

    async fn due_post(db: &Database) -> Post {
        let account = seed_account(db, "user-1", Network::Facebook).await;
        let post = Post::new_draft("user-1", &account, "hello".to_string(), vec![], NOW - 100);
        db.insert_post(&post).await.unwrap();
        assert!(db.schedule_draft(&post.id, 0, NOW - 10, NOW - 50).await.unwrap());
        db.get_post(&post.id).await.unwrap().unwrap()
    }

    async fn fixture() -> (TempDir, Database, Post) {
        let (dir, db) = setup_test_db().await;
        let post = due_post(&db).await;
        (dir, db, post)
    }

    #[tokio::test]
    async fn test_publishes_due_post() {
        let (_dir, db, post) = fixture().await;
        let network = MockNetwork::success();
        let scheduler = scheduler(&db, network.clone(), config());
        let mut events = scheduler.events.subscribe();

        let report = scheduler.sweep(NOW).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.published, 1);

        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Published);
        assert!(post.platform_post_id.unwrap().starts_with("facebook:mock-"));
        assert_eq!(post.lease_id, None);
        assert_eq!(network.create_call_count(), 1);

        assert!(matches!(events.recv().await.unwrap(), EngineEvent::PostClaimed { attempt: 1, .. }));
        assert!(matches!(events.recv().await.unwrap(), EngineEvent::PostPublished { .. }));

        let attempts = db.list_attempts(&post.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn test_rate_limited_rearms_with_backoff() {
        let (_dir, db, post) = fixture().await;
        let network = MockNetwork::scripted([Err(PublishError::RateLimited {
            message: "slow down".to_string(),
            retry_after: None,
        })]);
        let scheduler = scheduler(&db, network, config());

        let report = scheduler.sweep(NOW).await.unwrap();
        assert_eq!(report.retried, 1);

        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Scheduled);
        assert_eq!(post.retry_count, 1);
        assert_eq!(post.scheduled_for, Some(NOW + 120));
        assert!(post.last_error.unwrap().starts_with("rate_limited"));
    }

    #[tokio::test]
    async fn test_retry_after_hint_extends_delay() {
        let (_dir, db, post) = fixture().await;
        let network = MockNetwork::scripted([Err(PublishError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(900),
        })]);
        let scheduler = scheduler(&db, network, config());

        scheduler.sweep(NOW).await.unwrap();
        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.scheduled_for, Some(NOW + 900));
    }

    #[tokio::test]
    async fn test_validation_error_fails_without_retry() {
        let (_dir, db, post) = fixture().await;
        let network = MockNetwork::failing(PublishError::Validation("caption too long".to_string()));
        let scheduler = scheduler(&db, network.clone(), config());

        let report = scheduler.sweep(NOW).await.unwrap();
        assert_eq!(report.failed, 1);

        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Failed);
        assert_eq!(post.retry_count, 0);
        assert!(post.last_error.unwrap().contains("caption too long"));

        // Nothing left to do
        let report = scheduler.sweep(NOW + 10_000).await.unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(network.create_call_count(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (_dir, db, post) = fixture().await;
        let network = MockNetwork::failing(PublishError::NetworkUnreachable("down".to_string()));
        let scheduler = scheduler(&db, network.clone(), config());

        let mut now = NOW;
        for expected_retry in 1..=5 {
            assert_eq!(scheduler.sweep(now).await.unwrap().retried, 1);
            let current = db.get_post(&post.id).await.unwrap().unwrap();
            assert_eq!(current.retry_count, expected_retry);
            now = current.scheduled_for.unwrap();
        }

        assert_eq!(scheduler.sweep(now).await.unwrap().failed, 1);
        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Failed);
        assert_eq!(post.retry_count, 5);
        assert_eq!(network.create_call_count(), 6);

        // Each retry used a fresh idempotency key
        let keys: std::collections::HashSet<_> =
            network.requests().into_iter().map(|r| r.idempotency_key).collect();
        assert_eq!(keys.len(), 6);
    }

    #[tokio::test]
    async fn test_unknown_errors_have_lower_ceiling() {
        let (_dir, db, post) = fixture().await;
        let network = MockNetwork::failing(PublishError::UnknownPlatform("500".to_string()));
        let scheduler = scheduler(&db, network.clone(), config());

        let mut now = NOW;
        loop {
            let report = scheduler.sweep(now).await.unwrap();
            if report.failed == 1 {
                break;
            }
            now = db.get_post(&post.id).await.unwrap().unwrap().scheduled_for.unwrap();
        }
        assert_eq!(network.create_call_count(), 4);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_network_unreachable() {
        let (_dir, db, post) = fixture().await;
        let network = MockNetwork::success().with_delay(Duration::from_secs(5));
        let mut config = config();
        config.publish_timeout = 1;
        let scheduler = scheduler(&db, network, config);

        assert_eq!(scheduler.sweep(NOW).await.unwrap().retried, 1);
        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Scheduled);
        assert!(post.last_error.unwrap().starts_with("network_unreachable"));
    }

    #[tokio::test]
    async fn test_stale_lease_is_reclaimed_without_consuming_retry() {
        let (_dir, db, post) = fixture().await;
        assert!(db.claim_post(&post.id, "crashed-worker", NOW - 601).await.unwrap());

        let network = MockNetwork::success();
        let scheduler = scheduler(&db, network.clone(), config());
        let report = scheduler.sweep(NOW).await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.published, 1);

        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Published);
        assert_eq!(post.retry_count, 0);

        // Same key as the interrupted attempt
        assert_eq!(
            network.requests()[0].idempotency_key,
            crate::platforms::idempotency_key(&post.id, 0)
        );
    }

    #[tokio::test]
    async fn test_fresh_lease_is_left_alone() {
        let (_dir, db, post) = fixture().await;
        assert!(db.claim_post(&post.id, "busy-worker", NOW - 60).await.unwrap());

        let scheduler = scheduler(&db, MockNetwork::success(), config());
        let report = scheduler.sweep(NOW).await.unwrap();
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.due, 0);
        assert_eq!(
            db.get_post(&post.id).await.unwrap().unwrap().status,
            PostStatus::Publishing
        );
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let (_dir, db) = setup_test_db().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(due_post(&db).await.id);
        }

        let network = MockNetwork::scripted([
            Err(PublishError::Validation("bad".to_string())),
            Ok(()),
            Ok(()),
        ]);
        let mut config = config();
        config.max_concurrency = 1;
        let scheduler = scheduler(&db, network, config);

        let report = scheduler.sweep(NOW).await.unwrap();
        assert_eq!(report.due, 3);
        assert_eq!(report.published, 2);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_local_ceiling_defers_post() {
        let (_dir, db, post) = fixture().await;
        let mut limits = HashMap::new();
        limits.insert(Network::Facebook, 0);

        let mut publishers = PublisherRegistry::new();
        publishers.register_api(Network::Facebook, Arc::new(MockNetwork::success()));
        let scheduler = Scheduler::new(
            db.clone(),
            publishers,
            RateLimiter::new(limits),
            EventBus::default(),
            config(),
        );

        let report = scheduler.sweep(NOW).await.unwrap();
        assert_eq!(report.throttled, 1);
        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Scheduled);
        assert_eq!(post.retry_count, 0);
        assert_eq!(post.scheduled_for, Some(RateLimiter::default().next_window(NOW)));
    }

    #[tokio::test]
    async fn test_throttled_network_does_not_starve_others() {
        let (_dir, db) = setup_test_db().await;
        let throttled = vec![due_post(&db).await, due_post(&db).await];

        let account = seed_account(&db, "user-1", Network::X).await;
        let other = Post::new_draft("user-1", &account, "hello".to_string(), vec![], NOW - 100);
        db.insert_post(&other).await.unwrap();
        assert!(db.schedule_draft(&other.id, 0, NOW, NOW - 50).await.unwrap());

        let mut limits = HashMap::new();
        limits.insert(Network::Facebook, 0);
        let mut publishers = PublisherRegistry::new();
        publishers.register_api(Network::Facebook, Arc::new(MockNetwork::success()));
        publishers.register_api(Network::X, Arc::new(MockNetwork::success()));
        let mut config = config();
        config.batch_size = 2;
        let scheduler = Scheduler::new(
            db.clone(),
            publishers,
            RateLimiter::new(limits),
            EventBus::default(),
            config,
        );

        let report = scheduler.sweep(NOW).await.unwrap();
        assert_eq!(report.throttled, 2);

        let report = scheduler.sweep(NOW + 10).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.published, 1);
        assert_eq!(
            db.get_post(&other.id).await.unwrap().unwrap().status,
            PostStatus::Published
        );

        for post in throttled {
            let post = db.get_post(&post.id).await.unwrap().unwrap();
            assert_eq!(post.status, PostStatus::Scheduled);
            assert_eq!(post.retry_count, 0);
            assert_eq!(post.scheduled_for, Some(RateLimiter::default().next_window(NOW)));
        }
    }

    #[tokio::test]
    async fn test_late_claims_are_not_reclaimed_in_flight() {
        let (_dir, db) = setup_test_db().await;
        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(due_post(&db).await.id);
        }

        let network = MockNetwork::success().with_delay(Duration::from_millis(800));
        let mut config = config();
        config.max_concurrency = 1;
        config.publish_timeout = 1;
        config.stale_lease = 3;
        let first = scheduler(&db, network.clone(), config.clone());
        let second = scheduler(&db, network.clone(), config);

        // The second instance starts while the first is still working
        // through its batch, with a stale cutoff at the first sweep's start
        let (a, b) = tokio::join!(first.sweep(NOW), async {
            tokio::time::sleep(Duration::from_millis(3_500)).await;
            second.sweep(NOW + 3).await
        });
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.reclaimed + b.reclaimed, 0);
        assert_eq!(a.published + b.published, 6);
        assert_eq!(network.create_call_count(), 6);

        let mut latest_start = 0;
        for id in &ids {
            let post = db.get_post(id).await.unwrap().unwrap();
            assert_eq!(post.status, PostStatus::Published);
            for attempt in db.list_attempts(id).await.unwrap() {
                assert!(attempt.finished_at >= attempt.started_at);
                latest_start = latest_start.max(attempt.started_at);
            }
        }
        assert!(latest_start >= NOW + 3, "late claims carry the time they were made");
    }

    #[tokio::test]
    async fn test_inline_refresh_is_bounded_by_publish_timeout() {
        let (_dir, db, post) = fixture().await;

        let provider = Arc::new(
            MockOAuthProvider::new(Network::Facebook).with_extend_delay(Duration::from_secs(5)),
        );
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());
        let events = EventBus::default();
        let refresher = Arc::new(TokenRefresher::new(db.clone(), providers, events.clone(), 7 * 86_400));

        let mut publishers = PublisherRegistry::new();
        publishers.register_api(
            Network::Facebook,
            Arc::new(MockNetwork::scripted([Err(PublishError::AuthExpired("revoked".to_string()))])),
        );
        let mut config = config();
        config.publish_timeout = 1;
        let scheduler = Scheduler::new(db.clone(), publishers, RateLimiter::default(), events, config)
            .with_refresher(refresher);

        let started = Instant::now();
        assert_eq!(scheduler.sweep(NOW).await.unwrap().retried, 1);
        assert!(started.elapsed() < Duration::from_secs(4));

        let post = db.get_post(&post.id).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Scheduled);
        let account = db.get_account(&post.account_id).await.unwrap().unwrap();
        assert_eq!(account.token_version, 0);
    }

    #[tokio::test]
    async fn test_sweep_runs_on_spawned_task() {
        let (_dir, db, post) = fixture().await;
        let scheduler = Arc::new(scheduler(&db, MockNetwork::success(), config()));

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.sweep(NOW).await })
        };
        assert_eq!(handle.await.unwrap().unwrap().published, 1);
        assert_eq!(
            db.get_post(&post.id).await.unwrap().unwrap().status,
            PostStatus::Published
        );
    }

    #[tokio::test]
    async fn test_auth_expired_triggers_refresh() {
        let (_dir, db) = setup_test_db().await;
        let account = seed_account(&db, "user-1", Network::Facebook).await;
        let post = Post::new_draft("user-1", &account, "hello".to_string(), vec![], NOW - 100);
        db.insert_post(&post).await.unwrap();
        db.schedule_draft(&post.id, 0, NOW - 10, NOW - 50).await.unwrap();

        let provider = Arc::new(MockOAuthProvider::new(Network::Facebook));
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());
        let events = EventBus::default();
        let refresher = Arc::new(TokenRefresher::new(db.clone(), providers, events.clone(), 7 * 86_400));

        let mut publishers = PublisherRegistry::new();
        publishers.register_api(
            Network::Facebook,
            Arc::new(MockNetwork::scripted([Err(PublishError::AuthExpired("revoked".to_string()))])),
        );
        let scheduler = Scheduler::new(db.clone(), publishers, RateLimiter::default(), events, config())
            .with_refresher(refresher);

        assert_eq!(scheduler.sweep(NOW).await.unwrap().retried, 1);
        assert_eq!(provider.extend_call_count(), 1);

        let account = db.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(account.token_version, 1);

        // The retry goes out with the new token
        let next = db.get_post(&post.id).await.unwrap().unwrap().scheduled_for.unwrap();
        assert_eq!(scheduler.sweep(next).await.unwrap().published, 1);
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_publish_once() {
        let (_dir, db, post) = fixture().await;
        let network = MockNetwork::success().with_delay(Duration::from_millis(50));
        let first = scheduler(&db, network.clone(), config());
        let second = scheduler(&db, network.clone(), config());

        let (a, b) = tokio::join!(first.sweep(NOW), second.sweep(NOW));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.published + b.published, 1);
        assert_eq!(network.create_call_count(), 1);
        assert_eq!(
            db.get_post(&post.id).await.unwrap().unwrap().status,
            PostStatus::Published
        );
    }
}
