//! Core types for Cadence

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Networks and accounts
// ============================================================================

/// Social network an account lives on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Facebook,
    Instagram,
    LinkedIn,
    X,
}

impl Network {
    pub fn all() -> [Network; 4] {
        [
            Network::Facebook,
            Network::Instagram,
            Network::LinkedIn,
            Network::X,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Facebook => "facebook",
            Network::Instagram => "instagram",
            Network::LinkedIn => "linkedin",
            Network::X => "x",
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "facebook" | "fb" => Ok(Network::Facebook),
            "instagram" | "ig" => Ok(Network::Instagram),
            "linkedin" => Ok(Network::LinkedIn),
            "x" | "twitter" => Ok(Network::X),
            _ => Err(format!(
                "Unknown network '{}'. Valid options: facebook, instagram, linkedin, x",
                s
            )),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Expired,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Expired => "expired",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(ConnectionStatus::Connected),
            "expired" => Some(ConnectionStatus::Expired),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth access token. Redacted in `Debug` and never serialized.
pub struct AccessToken(SecretString);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for AccessToken {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

impl From<String> for AccessToken {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

/// One connected publishing destination on one network for one user
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub network: Network,
    pub platform_account_id: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub access_token: AccessToken,
    /// `None` for tokens that never expire
    pub token_expires_at: Option<i64>,
    /// Bumped on every token rotation; the refresher's compare-and-swap key
    pub token_version: i64,
    /// Network-specific extra identifiers (e.g. the parent page of a linked account)
    pub auxiliary_ids: serde_json::Map<String, serde_json::Value>,
    pub connection_status: ConnectionStatus,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Account {
    /// Whether the publisher may use this account right now
    pub fn is_publishable(&self) -> bool {
        self.is_active && self.connection_status == ConnectionStatus::Connected
    }

    pub fn auxiliary_id(&self, key: &str) -> Option<&str> {
        self.auxiliary_ids.get(key).and_then(|v| v.as_str())
    }
}

// ============================================================================
// Posts
// ============================================================================

/// Lifecycle state of a post
///
/// Forward transitions only:
/// `draft -> scheduled -> publishing -> published | failed`, with
/// `publishing -> scheduled` when a transient failure re-arms the post.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Publishing => "publishing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PostStatus::Draft),
            "scheduled" => Some(PostStatus::Scheduled),
            "publishing" => Some(PostStatus::Publishing),
            "published" => Some(PostStatus::Published),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Published | PostStatus::Failed)
    }

    /// User-initiated cancel is only allowed before a post is claimed
    pub fn is_cancellable(&self) -> bool {
        matches!(self, PostStatus::Draft | PostStatus::Scheduled)
    }
}

impl FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(&s.to_lowercase()).ok_or_else(|| {
            format!(
                "Invalid status '{}'. Valid options: draft, scheduled, publishing, published, failed",
                s
            )
        })
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of content targeted at one account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub network: Network,
    pub content: String,
    /// Ordered media references
    pub media_ids: Vec<String>,
    pub status: PostStatus,
    pub scheduled_for: Option<i64>,
    pub version: i64,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub platform_post_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// When the current `publishing` lease was taken
    pub claimed_at: Option<i64>,
    /// Identifies the claim that owns the `publishing` lease
    pub lease_id: Option<String>,
    /// Set when a stale lease was recovered; the outcome of that attempt is unknown
    pub reclaimed_at: Option<i64>,
    pub published_at: Option<i64>,
    pub cancelled_at: Option<i64>,
}

impl Post {
    /// A fresh draft at version 0
    pub fn new_draft(
        user_id: &str,
        account: &Account,
        content: String,
        media_ids: Vec<String>,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            account_id: account.id.clone(),
            network: account.network,
            content,
            media_ids,
            status: PostStatus::Draft,
            scheduled_for: None,
            version: 0,
            retry_count: 0,
            last_error: None,
            platform_post_id: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            lease_id: None,
            reclaimed_at: None,
            published_at: None,
            cancelled_at: None,
        }
    }
}

// ============================================================================
// Media
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify a MIME type such as `image/png` or `video/mp4`
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let lower = content_type.to_lowercase();
        if lower.starts_with("image/") {
            Some(MediaKind::Image)
        } else if lower.starts_with("video/") {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded asset available for attachment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaItem {
    pub id: String,
    pub user_id: String,
    pub storage_path: String,
    pub public_url: String,
    pub kind: MediaKind,
    pub content_type: String,
    pub size_bytes: i64,
    pub folder: Option<String>,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

impl MediaItem {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ============================================================================
// Publish attempts and metrics
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::TransientFailure => "transient_failure",
            AttemptOutcome::PermanentFailure => "permanent_failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AttemptOutcome::Success),
            "transient_failure" => Some(AttemptOutcome::TransientFailure),
            "permanent_failure" => Some(AttemptOutcome::PermanentFailure),
            _ => None,
        }
    }
}

/// One publisher invocation for one post
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishAttempt {
    pub id: Option<i64>,
    pub post_id: String,
    /// 1-based; equals the post's retry_count at claim time plus one
    pub attempt: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub outcome: AttemptOutcome,
    pub platform_post_id: Option<String>,
    pub error: Option<String>,
}

/// Latest engagement snapshot for a published post
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostMetrics {
    pub impressions: i64,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
}
