//! Engine event bus
//!
//! The scheduler, refresher and connector report lifecycle transitions here.
//! The bus is a `tokio::sync::broadcast` channel: with no subscribers events
//! are dropped, and a lagging subscriber misses the oldest events instead of
//! slowing the engine down.
//!
//! # Example
//!
//! ```no_run
//! use libcadence::service::events::{EngineEvent, EventBus};
//!
//! # async fn example() {
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(EngineEvent::PostClaimed {
//!     post_id: "abc123".to_string(),
//!     network: "x".to_string(),
//!     attempt: 1,
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type EventReceiver = broadcast::Receiver<EngineEvent>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before old events are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A worker took the publishing lease
    PostClaimed {
        post_id: String,
        network: String,
        /// 1-based attempt number
        attempt: i64,
    },

    PostPublished {
        post_id: String,
        network: String,
        platform_post_id: String,
    },

    /// A transient failure re-armed the post
    RetryScheduled {
        post_id: String,
        retry_count: i64,
        next_attempt_at: i64,
        error: String,
    },

    PostFailed {
        post_id: String,
        error: String,
    },

    /// An abandoned `publishing` lease was returned to `scheduled`
    LeaseReclaimed { post_id: String },

    TokenRefreshed {
        account_id: String,
        expires_at: Option<i64>,
    },

    /// Refresh failed; the account needs to be reconnected
    TokenExpired { account_id: String, error: String },
}

impl EngineEvent {
    pub fn post_id(&self) -> Option<&str> {
        match self {
            EngineEvent::PostClaimed { post_id, .. }
            | EngineEvent::PostPublished { post_id, .. }
            | EngineEvent::RetryScheduled { post_id, .. }
            | EngineEvent::PostFailed { post_id, .. }
            | EngineEvent::LeaseReclaimed { post_id } => Some(post_id),
            EngineEvent::TokenRefreshed { .. } | EngineEvent::TokenExpired { .. } => None,
        }
    }
}
