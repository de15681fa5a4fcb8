//! Network publishing abstraction and per-network adapters
//!
//! Two layers live here:
//!
//! - [`NetworkApi`] is the raw capability of talking to a network: create a
//!   post, optionally look one up by idempotency key, read metrics. The
//!   [`gateway::GatewayClient`] implements it over HTTP and
//!   [`mock::MockNetwork`] in memory.
//! - [`Publisher`] is what the scheduler calls. Each network has one adapter
//!   that validates content against that network's rules, maps the post to a
//!   [`PublishRequest`] and hands it to its `NetworkApi`.
//!
//! Adding a network means adding an adapter and registering it in
//! [`PublisherRegistry`]; nothing else branches on the network.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use libcadence::platforms::{mock::MockNetwork, PublisherRegistry};
//! use libcadence::types::Network;
//!
//! let api = Arc::new(MockNetwork::success());
//! let mut registry = PublisherRegistry::new();
//! registry.register_api(Network::X, api);
//!
//! let publisher = registry.get(Network::X).expect("registered");
//! println!("X allows {} characters", publisher.rules().max_chars);
//! ```

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PublishError, PublishResult};
use crate::types::{AccessToken, Account, MediaItem, MediaKind, Network, Post, PostMetrics};

pub mod facebook;
pub mod gateway;
pub mod instagram;
pub mod linkedin;
pub mod x;

// Mock network is available for all builds (not just tests) to support integration tests
pub mod mock;

/// Layout of a post's media as the network sees it
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PostFormat {
    Text,
    SingleImage,
    SingleVideo,
    Carousel,
}

/// A media attachment as sent to the network
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
    pub content_type: String,
}

/// One fully mapped publish call
#[derive(Debug, Clone, Serialize)]
pub struct PublishRequest {
    pub network: Network,
    /// Stable for a given (post, retry_count); see [`idempotency_key`]
    pub idempotency_key: String,
    /// Network identity to publish as (page id, author URN, ...)
    pub target: String,
    pub auxiliary_ids: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub access_token: AccessToken,
    pub format: PostFormat,
    pub text: String,
    pub media: Vec<MediaRef>,
}

/// Deterministic client-side request id for one publish attempt
///
/// Retries of the same attempt number (including a crash-recovered attempt,
/// which keeps its `retry_count`) produce the same key.
pub fn idempotency_key(post_id: &str, retry_count: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(post_id.as_bytes());
    hasher.update(b":");
    hasher.update(retry_count.to_string().as_bytes());
    let digest = hasher.finalize();

    digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
}

/// Raw capability of one network
#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Create the post and return the network's id for it
    async fn create_post(&self, request: &PublishRequest) -> PublishResult<String>;

    /// Whether [`NetworkApi::find_post`] can actually answer
    fn supports_lookup(&self) -> bool {
        false
    }

    /// Find a recent post created with `request.idempotency_key`
    ///
    /// Networks without such a query return `Ok(None)`.
    async fn find_post(&self, _request: &PublishRequest) -> PublishResult<Option<String>> {
        Ok(None)
    }

    /// Current engagement numbers for a published post
    async fn fetch_metrics(
        &self,
        access_token: &AccessToken,
        platform_post_id: &str,
    ) -> PublishResult<PostMetrics>;
}

/// Content constraints of one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRules {
    /// Maximum caption length in characters
    pub max_chars: usize,
    pub max_hashtags: Option<usize>,
    pub requires_media: bool,
    /// Maximum attachments of any kind
    pub max_items: usize,
    pub max_images: usize,
    pub max_videos: usize,
    /// Whether images and videos may be combined in one post
    pub allow_mixed: bool,
}

impl ContentRules {
    /// Check content and media, returning the resulting post format
    ///
    /// # Errors
    ///
    /// Returns `PublishError::Validation` naming the first violated rule.
    pub fn check(
        &self,
        network: Network,
        content: &str,
        media: &[MediaItem],
    ) -> PublishResult<PostFormat> {
        let chars = content.chars().count();
        if chars > self.max_chars {
            return Err(PublishError::Validation(format!(
                "Caption is {} characters; {} allows at most {}",
                chars, network, self.max_chars
            )));
        }

        if let Some(max_hashtags) = self.max_hashtags {
            let hashtags = content
                .split_whitespace()
                .filter(|word| word.starts_with('#') && word.len() > 1)
                .count();
            if hashtags > max_hashtags {
                return Err(PublishError::Validation(format!(
                    "{} hashtags used; {} allows at most {}",
                    hashtags, network, max_hashtags
                )));
            }
        }

        if media.is_empty() {
            if self.requires_media {
                return Err(PublishError::Validation(format!(
                    "{} posts require at least one image or video",
                    network
                )));
            }
            if content.trim().is_empty() {
                return Err(PublishError::Validation(
                    "Post has neither text nor media".to_string(),
                ));
            }
            return Ok(PostFormat::Text);
        }

        if media.len() > self.max_items {
            return Err(PublishError::Validation(format!(
                "{} attachments; {} allows at most {}",
                media.len(),
                network,
                self.max_items
            )));
        }

        let images = media.iter().filter(|m| m.kind == MediaKind::Image).count();
        let videos = media.len() - images;

        if images > self.max_images {
            return Err(PublishError::Validation(format!(
                "{} images; {} allows at most {}",
                images, network, self.max_images
            )));
        }
        if videos > self.max_videos {
            return Err(PublishError::Validation(format!(
                "{} videos; {} allows at most {}",
                videos, network, self.max_videos
            )));
        }
        if images > 0 && videos > 0 && !self.allow_mixed {
            return Err(PublishError::Validation(format!(
                "{} does not allow mixing images and videos in one post",
                network
            )));
        }

        Ok(match (media.len(), media[0].kind) {
            (1, MediaKind::Image) => PostFormat::SingleImage,
            (1, MediaKind::Video) => PostFormat::SingleVideo,
            _ => PostFormat::Carousel,
        })
    }
}

/// Executes one publish attempt against one network for one post
#[async_trait]
pub trait Publisher: Send + Sync {
    fn network(&self) -> Network;

    fn rules(&self) -> &ContentRules;

    /// Content and media checks alone, independent of any account
    ///
    /// Also used when a draft is scheduled, so rule violations surface to
    /// the user before the post is queued.
    fn check_content(&self, content: &str, media: &[MediaItem]) -> PublishResult<PostFormat> {
        self.rules().check(self.network(), content, media)
    }

    /// Pre-flight checks that need no network call
    ///
    /// # Errors
    ///
    /// - `PublishError::AccountDisconnected` if the account is inactive or its
    ///   connection status is not `connected`
    /// - `PublishError::Validation` if the post breaks the network's rules
    fn validate(
        &self,
        account: &Account,
        post: &Post,
        media: &[MediaItem],
    ) -> PublishResult<PostFormat> {
        validate_common(self, account, post, media)
    }

    /// Validate, map and send the post
    ///
    /// Returns the network's id for the created post.
    async fn publish(
        &self,
        account: &Account,
        post: &Post,
        media: &[MediaItem],
    ) -> PublishResult<String>;

    async fn fetch_metrics(
        &self,
        account: &Account,
        platform_post_id: &str,
    ) -> PublishResult<PostMetrics>;
}

/// Account, routing and content-rule checks behind [`Publisher::validate`]
fn validate_common<P: Publisher + ?Sized>(
    publisher: &P,
    account: &Account,
    post: &Post,
    media: &[MediaItem],
) -> PublishResult<PostFormat> {
    if !account.is_active {
        return Err(PublishError::AccountDisconnected(format!(
            "account {} has been disconnected",
            account.id
        )));
    }
    if !account.is_publishable() {
        return Err(PublishError::AccountDisconnected(format!(
            "account {} connection status is {}",
            account.id, account.connection_status
        )));
    }
    if account.network != publisher.network() || post.network != publisher.network() {
        return Err(PublishError::Validation(format!(
            "post for {} routed to the {} publisher",
            post.network,
            publisher.network()
        )));
    }
    if media.len() != post.media_ids.len() {
        return Err(PublishError::Validation(format!(
            "{} of {} attached media items no longer exist",
            post.media_ids.len() - media.len().min(post.media_ids.len()),
            post.media_ids.len()
        )));
    }

    publisher.check_content(&post.content, media)
}

impl PublishRequest {
    /// The parts of a request every adapter fills in the same way
    pub fn base(
        network: Network,
        account: &Account,
        post: &Post,
        media: &[MediaItem],
        format: PostFormat,
    ) -> Self {
        Self {
            network,
            idempotency_key: idempotency_key(&post.id, post.retry_count),
            target: account.platform_account_id.clone(),
            auxiliary_ids: account.auxiliary_ids.clone(),
            access_token: account.access_token.clone(),
            format,
            text: post.content.clone(),
            media: media
                .iter()
                .map(|m| MediaRef {
                    url: m.public_url.clone(),
                    kind: m.kind,
                    content_type: m.content_type.clone(),
                })
                .collect(),
        }
    }
}

/// Send a mapped request, first checking for a duplicate after crash recovery
///
/// When the post was reclaimed from an abandoned lease, the interrupted
/// attempt may already be live. If the network can look posts up by
/// idempotency key we ask first; otherwise we publish again and accept that
/// at most one duplicate can result.
pub async fn deliver(api: &dyn NetworkApi, post: &Post, request: &PublishRequest) -> PublishResult<String> {
    if post.reclaimed_at.is_some() {
        if api.supports_lookup() {
            if let Some(existing) = api.find_post(request).await? {
                tracing::info!(
                    post_id = %post.id,
                    platform_post_id = %existing,
                    "Reclaimed post was already published, skipping duplicate"
                );
                return Ok(existing);
            }
        } else {
            tracing::warn!(
                post_id = %post.id,
                network = %request.network,
                "Republishing reclaimed post without duplicate lookup; at most one duplicate possible"
            );
        }
    }

    api.create_post(request).await
}

/// Publishers keyed by network
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: HashMap<Network, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(publisher.network(), publisher);
    }

    /// Register the standard adapter for `network` on top of `api`
    pub fn register_api(&mut self, network: Network, api: Arc<dyn NetworkApi>) {
        self.register(adapter_for(network, api));
    }

    pub fn get(&self, network: Network) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(&network).cloned()
    }

    pub fn networks(&self) -> Vec<Network> {
        let mut networks: Vec<_> = self.publishers.keys().copied().collect();
        networks.sort();
        networks
    }
}

/// The adapter for `network`
pub fn adapter_for(network: Network, api: Arc<dyn NetworkApi>) -> Arc<dyn Publisher> {
    match network {
        Network::Facebook => Arc::new(facebook::FacebookPublisher::new(api)),
        Network::Instagram => Arc::new(instagram::InstagramPublisher::new(api)),
        Network::LinkedIn => Arc::new(linkedin::LinkedInPublisher::new(api)),
        Network::X => Arc::new(x::XPublisher::new(api)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::{ConnectionStatus, PostStatus};

    pub fn account(network: Network) -> Account {
        Account {
            id: "acct-1".to_string(),
            user_id: "user-1".to_string(),
            network,
            platform_account_id: "12345".to_string(),
            display_name: "Test".to_string(),
            access_token: AccessToken::new("token"),
            token_expires_at: None,
            token_version: 0,
            auxiliary_ids: serde_json::Map::new(),
            connection_status: ConnectionStatus::Connected,
            is_active: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn post(network: Network, content: &str, media: &[MediaItem]) -> Post {
        Post {
            id: "post-1".to_string(),
            user_id: "user-1".to_string(),
            account_id: "acct-1".to_string(),
            network,
            content: content.to_string(),
            media_ids: media.iter().map(|m| m.id.clone()).collect(),
            status: PostStatus::Publishing,
            scheduled_for: None,
            version: 1,
            retry_count: 0,
            last_error: None,
            platform_post_id: None,
            created_at: 0,
            updated_at: 0,
            claimed_at: Some(0),
            lease_id: Some("lease".to_string()),
            reclaimed_at: None,
            published_at: None,
            cancelled_at: None,
        }
    }

    pub fn media(id: &str, kind: MediaKind) -> MediaItem {
        let content_type = match kind {
            MediaKind::Image => "image/jpeg",
            MediaKind::Video => "video/mp4",
        };
        MediaItem {
            id: id.to_string(),
            user_id: "user-1".to_string(),
            storage_path: format!("user-1/{}", id),
            public_url: format!("https://cdn.example.com/{}", id),
            kind,
            content_type: content_type.to_string(),
            size_bytes: 1024,
            folder: None,
            created_at: 0,
            deleted_at: None,
        }
    }
}
