//! Cadence - social content publishing and scheduling
//!
//! This library holds the engine behind the `cadence-queue` CLI and the
//! `cadence-send` daemon: connected network accounts, a media library,
//! versioned drafts, a crash-safe publishing scheduler, token refresh and
//! metrics collection, all persisted in SQLite.

pub mod analytics;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod oauth;
pub mod platforms;
pub mod rate_limiter;
pub mod refresher;
pub mod scheduler;
pub mod scheduling;
pub mod service;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{AuthError, CadenceError, MediaError, PublishError, Result};
pub use service::CadenceService;
pub use types::{Account, MediaItem, MediaKind, Network, Post, PostStatus};
