//! Error types for Cadence

use thiserror::Error;

use crate::types::{AttemptOutcome, PostStatus};

pub type Result<T> = std::result::Result<T, CadenceError>;

/// Result of talking to a network
pub type PublishResult<T> = std::result::Result<T, PublishError>;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Post {post_id} was modified concurrently (expected version {expected}, current version {current})")]
    StaleVersionConflict {
        post_id: String,
        expected: i64,
        current: i64,
    },

    #[error("Cannot {operation} post {post_id} while it is {status}")]
    InvalidState {
        post_id: String,
        status: PostStatus,
        operation: &'static str,
    },

    #[error("Post {post_id} is no longer cancellable (status: {status})")]
    NotCancellable { post_id: String, status: PostStatus },
}

impl CadenceError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CadenceError::InvalidInput(_)
            | CadenceError::NotFound(_)
            | CadenceError::InvalidState { .. }
            | CadenceError::Media(_) => 3,
            CadenceError::StaleVersionConflict { .. } | CadenceError::NotCancellable { .. } => 4,
            CadenceError::Auth(_) | CadenceError::Config(_) => 2,
            CadenceError::Publish(PublishError::AuthExpired(_)) => 2,
            CadenceError::Publish(_) => 1,
            CadenceError::Database(_) => 1,
        }
    }

    /// True for errors that the caller caused and can fix by changing input
    pub fn is_user_error(&self) -> bool {
        matches!(self.exit_code(), 3 | 4)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
}

/// Outcome of a single publish attempt against a network.
///
/// The variants split into transient failures, which the scheduler retries
/// with backoff, and permanent failures, which move the post straight to
/// `failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Token rejected by the network. Triggers an out-of-band token refresh.
    #[error("Access token expired or revoked: {0}")]
    AuthExpired(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        /// Seconds the network asked us to wait, when it said so
        retry_after: Option<u64>,
    },

    /// Content or media violates the network's constraints.
    #[error("Content validation failed: {0}")]
    Validation(String),

    /// The account is not in a publishable state (disconnected or token expired).
    #[error("Account unavailable: {0}")]
    AccountDisconnected(String),

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Unknown platform error: {0}")]
    UnknownPlatform(String),
}

impl PublishError {
    /// Whether retrying the same attempt later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            PublishError::AuthExpired(_)
            | PublishError::RateLimited { .. }
            | PublishError::NetworkUnreachable(_)
            | PublishError::UnknownPlatform(_) => true,
            PublishError::Validation(_) | PublishError::AccountDisconnected(_) => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, PublishError::AuthExpired(_))
    }

    /// Seconds the network asked us to wait before the next attempt
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            PublishError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-readable name, stored alongside `last_error`
    pub fn kind(&self) -> &'static str {
        match self {
            PublishError::AuthExpired(_) => "auth_expired",
            PublishError::RateLimited { .. } => "rate_limited",
            PublishError::Validation(_) => "validation",
            PublishError::AccountDisconnected(_) => "account_disconnected",
            PublishError::NetworkUnreachable(_) => "network_unreachable",
            PublishError::UnknownPlatform(_) => "unknown_platform",
        }
    }

    pub fn outcome(&self) -> AttemptOutcome {
        if self.is_transient() {
            AttemptOutcome::TransientFailure
        } else {
            AttemptOutcome::PermanentFailure
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    /// Authorization code invalid, expired or already used. Not retried.
    #[error("Token exchange failed: {0}")]
    Exchange(String),

    /// The token is valid but controls nothing we can publish to.
    #[error("No publishable destinations found for this {network} login")]
    NoDestinations { network: String },

    #[error("Unknown or expired authorization state")]
    InvalidState,

    #[error("No OAuth provider configured for network '{0}'")]
    UnsupportedNetwork(String),

    #[error("Token refresh failed: {0}")]
    Refresh(String),

    #[error("Provider request failed: {0}")]
    Provider(String),
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Unsupported media type: {0}")]
    UnsupportedType(String),

    #[error("Media too large: {size} bytes exceeds the {limit} byte limit for {kind}")]
    TooLarge { kind: String, size: u64, limit: u64 },

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Media item {0} has been deleted and cannot be attached")]
    Deleted(String),

    #[error("Media item {0} does not belong to this user")]
    NotOwned(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CadenceError::InvalidInput("Empty content".to_string());
        assert_eq!(error.exit_code(), 3);
        assert!(error.is_user_error());
    }

    #[test]
    fn test_exit_code_stale_version() {
        let error = CadenceError::StaleVersionConflict {
            post_id: "p1".to_string(),
            expected: 0,
            current: 2,
        };
        assert_eq!(error.exit_code(), 4);
        assert!(error.is_user_error());
    }

    #[test]
    fn test_exit_code_auth_errors() {
        let error = CadenceError::Auth(AuthError::InvalidState);
        assert_eq!(error.exit_code(), 2);

        let error = CadenceError::Publish(PublishError::AuthExpired("revoked".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_publish_and_database() {
        let error = CadenceError::Publish(PublishError::NetworkUnreachable("timeout".to_string()));
        assert_eq!(error.exit_code(), 1);

        let db_error = DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        ));
        assert_eq!(CadenceError::Database(db_error).exit_code(), 1);
    }

    #[test]
    fn test_publish_error_classification() {
        assert!(PublishError::AuthExpired("x".into()).is_transient());
        assert!(PublishError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(30)
        }
        .is_transient());
        assert!(PublishError::NetworkUnreachable("x".into()).is_transient());
        assert!(PublishError::UnknownPlatform("x".into()).is_transient());

        assert!(!PublishError::Validation("too long".into()).is_transient());
        assert!(!PublishError::AccountDisconnected("gone".into()).is_transient());
    }

    #[test]
    fn test_retry_after_only_for_rate_limits() {
        let limited = PublishError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(90),
        };
        assert_eq!(limited.retry_after(), Some(90));
        assert_eq!(PublishError::NetworkUnreachable("x".into()).retry_after(), None);
    }

    #[test]
    fn test_outcome_matches_classification() {
        assert_eq!(
            PublishError::Validation("bad".into()).outcome(),
            AttemptOutcome::PermanentFailure
        );
        assert_eq!(
            PublishError::AuthExpired("bad".into()).outcome(),
            AttemptOutcome::TransientFailure
        );
    }

    #[test]
    fn test_error_message_formatting() {
        let error = CadenceError::Publish(PublishError::Validation(
            "Caption exceeds 280 characters".to_string(),
        ));
        assert_eq!(
            error.to_string(),
            "Publish error: Content validation failed: Caption exceeds 280 characters"
        );

        let error = CadenceError::NotCancellable {
            post_id: "p1".to_string(),
            status: PostStatus::Publishing,
        };
        assert_eq!(
            error.to_string(),
            "Post p1 is no longer cancellable (status: publishing)"
        );
    }

    #[test]
    fn test_error_conversion_from_auth_error() {
        let error: CadenceError = AuthError::NoDestinations {
            network: "facebook".to_string(),
        }
        .into();

        match error {
            CadenceError::Auth(AuthError::NoDestinations { network }) => {
                assert_eq!(network, "facebook");
            }
            _ => panic!("Expected CadenceError::Auth"),
        }
    }
}
