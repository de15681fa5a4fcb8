//! Service layer for Cadence
//!
//! `CadenceService` is the entry point the CLI and daemon use. It wires the
//! engine components to one database and one event bus:
//!
//! - [`AccountConnector`]: OAuth connection of network accounts
//! - [`MediaRegistry`]: uploads and the media library
//! - [`PostComposer`]: drafts, versioned edits and scheduling
//! - [`Scheduler`]: claims due posts and publishes them
//! - [`TokenRefresher`]: keeps long-lived tokens alive
//! - [`AnalyticsFetcher`]: engagement metrics for published posts
//! - [`EventBus`]: engine event distribution
//!
//! User-facing operations stamp the current time themselves. The background
//! jobs take `now` explicitly so the daemon (and tests) control the clock.
//!
//! # Example
//!
//! ```no_run
//! use libcadence::service::CadenceService;
//!
//! # async fn example() -> libcadence::Result<()> {
//! let service = CadenceService::new().await?;
//!
//! let draft = service
//!     .create_draft("user-1", "account-id", "Launch day!".to_string(), vec![])
//!     .await?;
//! let at = chrono::Utc::now().timestamp() + 3600;
//! service.schedule(&draft.id, draft.version, at).await?;
//! # Ok(())
//! # }
//! ```

pub mod composer;
pub mod events;
pub mod media;

pub use composer::PostComposer;
pub use events::{EngineEvent, EventBus, EventReceiver};
pub use media::MediaRegistry;

use std::sync::Arc;

use crate::analytics::AnalyticsFetcher;
use crate::config::Config;
use crate::db::Database;
use crate::error::{CadenceError, Result};
use crate::oauth::connector::{AccountConnector, AuthRedirect, ConnectOutcome};
use crate::oauth::ProviderRegistry;
use crate::platforms::gateway::GatewayClient;
use crate::platforms::PublisherRegistry;
use crate::rate_limiter::RateLimiter;
use crate::refresher::TokenRefresher;
use crate::scheduler::Scheduler;
use crate::storage::{LocalObjectStore, ObjectStore};
use crate::types::{Account, MediaItem, Network, Post, PostMetrics, PostStatus, PublishAttempt};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Network-facing pieces that differ between production and tests
pub struct Components {
    pub publishers: PublisherRegistry,
    pub providers: ProviderRegistry,
    pub store: Arc<dyn ObjectStore>,
}

impl Components {
    /// Gateway clients for every enabled network and the local object store
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut publishers = PublisherRegistry::new();
        let mut providers = ProviderRegistry::new();

        for (network, network_config) in config.enabled_networks() {
            let client = Arc::new(GatewayClient::new(network, network_config)?);
            publishers.register_api(network, client.clone());
            providers.register(client);
            tracing::debug!(network = %network, api_base = %network_config.api_base, "Network gateway configured");
        }

        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
            &config.media.storage_root,
            config.media.public_base_url.clone(),
        ));

        Ok(Self {
            publishers,
            providers,
            store,
        })
    }
}

/// Main service facade
pub struct CadenceService {
    db: Database,
    config: Arc<Config>,
    connector: AccountConnector,
    media: MediaRegistry,
    composer: PostComposer,
    scheduler: Arc<Scheduler>,
    refresher: Arc<TokenRefresher>,
    analytics: AnalyticsFetcher,
    event_bus: EventBus,
}

impl CadenceService {
    /// Load the default configuration and open its database
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// # Errors
    ///
    /// Fails if the database cannot be opened or migrated, or a network
    /// section has an unusable `api_base`.
    pub async fn from_config(config: Config) -> Result<Self> {
        let db = Database::new(&config.database.path).await?;
        let components = Components::from_config(&config)?;
        Ok(Self::with_components(db, config, components))
    }

    /// Assemble the service around an open database and explicit components
    pub fn with_components(db: Database, config: Config, components: Components) -> Self {
        let Components {
            publishers,
            providers,
            store,
        } = components;
        let event_bus = EventBus::default();

        let connector = AccountConnector::new(db.clone(), providers.clone(), config.oauth.state_ttl as i64);
        let media = MediaRegistry::new(db.clone(), store, &config.media);
        let composer = PostComposer::new(db.clone(), media.clone(), publishers.clone());

        let refresher = Arc::new(TokenRefresher::new(
            db.clone(),
            providers,
            event_bus.clone(),
            config.refresher.lookahead as i64,
        ));
        let scheduler = Arc::new(
            Scheduler::new(
                db.clone(),
                publishers.clone(),
                RateLimiter::new(config.rate_limits()),
                event_bus.clone(),
                config.scheduler.clone(),
            )
            .with_refresher(refresher.clone()),
        );
        let analytics = AnalyticsFetcher::new(db.clone(), publishers, &config.analytics);

        Self {
            db,
            config: Arc::new(config),
            connector,
            media,
            composer,
            scheduler,
            refresher,
            analytics,
            event_bus,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn composer(&self) -> &PostComposer {
        &self.composer
    }

    pub fn media(&self) -> &MediaRegistry {
        &self.media
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn refresher(&self) -> Arc<TokenRefresher> {
        Arc::clone(&self.refresher)
    }

    pub fn analytics(&self) -> &AnalyticsFetcher {
        &self.analytics
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub async fn begin_auth(&self, user_id: &str, network: Network) -> Result<AuthRedirect> {
        self.connector.begin_auth(user_id, network, now()).await
    }

    pub async fn complete_auth(&self, code: &str, state: &str) -> Result<ConnectOutcome> {
        self.connector.complete_auth(code, state, now()).await
    }

    pub async fn list_accounts(&self, user_id: &str, include_inactive: bool) -> Result<Vec<Account>> {
        self.db.list_accounts(user_id, include_inactive).await
    }

    /// Soft-delete one of the user's accounts
    ///
    /// Its scheduled posts stay queued and fail with `account_disconnected`
    /// when they come due.
    pub async fn disconnect_account(&self, user_id: &str, account_id: &str) -> Result<()> {
        let account = self
            .db
            .get_account(account_id)
            .await?
            .filter(|a| a.user_id == user_id)
            .ok_or_else(|| CadenceError::NotFound(format!("account {}", account_id)))?;

        if self.db.deactivate_account(&account.id, now()).await? {
            tracing::info!(account_id, network = %account.network, "Account disconnected");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    pub async fn upload_media(
        &self,
        user_id: &str,
        bytes: &[u8],
        content_type: &str,
        folder: Option<&str>,
    ) -> Result<MediaItem> {
        self.media.upload(user_id, bytes, content_type, folder, now()).await
    }

    pub async fn delete_media(&self, user_id: &str, media_id: &str) -> Result<()> {
        self.media.soft_delete(user_id, media_id, now()).await
    }

    pub async fn list_media(&self, user_id: &str, folder: Option<&str>) -> Result<Vec<MediaItem>> {
        self.media.list(user_id, folder).await
    }

    // ------------------------------------------------------------------
    // Posts
    // ------------------------------------------------------------------

    pub async fn create_draft(
        &self,
        user_id: &str,
        account_id: &str,
        content: String,
        media_ids: Vec<String>,
    ) -> Result<Post> {
        self.composer
            .create_draft(user_id, account_id, content, media_ids, now())
            .await
    }

    pub async fn update_draft(
        &self,
        post_id: &str,
        expected_version: i64,
        content: String,
        media_ids: Vec<String>,
    ) -> Result<Post> {
        self.composer
            .update_draft(post_id, expected_version, content, media_ids, now())
            .await
    }

    pub async fn schedule(&self, post_id: &str, expected_version: i64, scheduled_for: i64) -> Result<Post> {
        self.composer
            .schedule(post_id, expected_version, scheduled_for, now())
            .await
    }

    pub async fn cancel_schedule(&self, post_id: &str) -> Result<Post> {
        self.composer.cancel_schedule(post_id, now()).await
    }

    pub async fn delete_draft(&self, post_id: &str) -> Result<()> {
        self.composer.delete_draft(post_id).await
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Post> {
        self.composer.get_post(post_id).await
    }

    pub async fn list_posts(
        &self,
        user_id: &str,
        status: Option<PostStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<Post>> {
        self.composer.list_posts(user_id, status, limit).await
    }

    /// Latest queued time for a user, the anchor for `random:` schedules
    pub async fn latest_scheduled_for(&self, user_id: &str) -> Result<Option<i64>> {
        self.db.latest_scheduled_for(user_id).await
    }

    /// Publish a draft or scheduled post immediately
    ///
    /// The post is armed as due now and then claimed through the same
    /// compare-and-swap as a sweep, so it cannot be published twice. If a
    /// sweep wins the claim, or the local rate limit defers it, the post is
    /// returned in whatever state that left it.
    pub async fn publish_now(&self, post_id: &str) -> Result<Post> {
        let at = now();
        self.composer.arm_now(post_id, at).await?;
        let outcome = self.scheduler.publish_post(post_id, at).await?;
        tracing::debug!(post_id, ?outcome, "Publish now finished");
        self.composer.get_post(post_id).await
    }

    pub async fn post_attempts(&self, post_id: &str) -> Result<Vec<PublishAttempt>> {
        self.db.list_attempts(post_id).await
    }

    /// Latest metrics snapshot and when it was taken
    pub async fn post_metrics(&self, post_id: &str) -> Result<Option<(PostMetrics, i64)>> {
        self.db.get_metrics(post_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{seed_account, setup_test_db};
    use crate::oauth::mock::MockOAuthProvider;
    use crate::platforms::mock::MockNetwork;
    use tempfile::TempDir;

    async fn service(network: &MockNetwork) -> (TempDir, TempDir, CadenceService) {
        let (db_dir, db) = setup_test_db().await;
        let store_dir = TempDir::new().unwrap();

        let mut publishers = PublisherRegistry::new();
        let mut providers = ProviderRegistry::new();
        for net in Network::all() {
            publishers.register_api(net, Arc::new(network.clone()));
            providers.register(Arc::new(MockOAuthProvider::new(net)));
        }
        let components = Components {
            publishers,
            providers,
            store: Arc::new(LocalObjectStore::new(
                store_dir.path().to_string_lossy(),
                "https://cdn.example.com",
            )),
        };

        let service = CadenceService::with_components(db, Config::default(), components);
        (db_dir, store_dir, service)
    }

    #[tokio::test]
    async fn test_publish_now_from_draft() {
        let network = MockNetwork::success();
        let (_db, _store, service) = service(&network).await;
        let account = seed_account(service.database(), "user-1", Network::LinkedIn).await;

        let draft = service
            .create_draft("user-1", &account.id, "Shipping today".to_string(), vec![])
            .await
            .unwrap();
        let post = service.publish_now(&draft.id).await.unwrap();

        assert_eq!(post.status, PostStatus::Published);
        assert_eq!(network.create_call_count(), 1);
        assert_eq!(service.post_attempts(&post.id).await.unwrap().len(), 1);

        // Already published: cannot be armed again
        let err = service.publish_now(&draft.id).await.unwrap_err();
        assert!(matches!(err, CadenceError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_account() {
        let network = MockNetwork::success();
        let (_db, _store, service) = service(&network).await;
        let account = seed_account(service.database(), "user-1", Network::X).await;

        let err = service.disconnect_account("user-2", &account.id).await.unwrap_err();
        assert!(matches!(err, CadenceError::NotFound(_)));

        service.disconnect_account("user-1", &account.id).await.unwrap();
        assert!(service.list_accounts("user-1", false).await.unwrap().is_empty());
        assert_eq!(service.list_accounts("user-1", true).await.unwrap().len(), 1);

        // Idempotent
        service.disconnect_account("user-1", &account.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_auth_returns_state() {
        let network = MockNetwork::success();
        let (_db, _store, service) = service(&network).await;

        let redirect = service.begin_auth("user-1", Network::Facebook).await.unwrap();
        assert_eq!(redirect.state.len(), 43);
        assert!(redirect.url.contains(&redirect.state));
    }
}
