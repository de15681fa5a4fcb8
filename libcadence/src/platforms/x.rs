//! X (formerly Twitter) publishing
//!
//! Posts are limited to 280 characters, where every link counts as 23
//! regardless of its length. Up to four images or one video, never both.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{PublishError, PublishResult};
use crate::platforms::{deliver, ContentRules, NetworkApi, PostFormat, PublishRequest, Publisher};
use crate::types::{Account, MediaItem, Network, Post, PostMetrics};

const MAX_WEIGHTED_LENGTH: usize = 280;
const LINK_WEIGHT: usize = 23;

const X_RULES: ContentRules = ContentRules {
    // Raw length is checked loosely; the weighted length below is authoritative
    max_chars: 4_000,
    max_hashtags: None,
    requires_media: false,
    max_items: 4,
    max_images: 4,
    max_videos: 1,
    allow_mixed: false,
};

pub struct XPublisher {
    api: Arc<dyn NetworkApi>,
    rules: ContentRules,
}

impl XPublisher {
    pub fn new(api: Arc<dyn NetworkApi>) -> Self {
        Self { api, rules: X_RULES }
    }
}

/// Length of `text` as X counts it
pub fn weighted_length(text: &str) -> usize {
    let mut length = 0;
    let mut first = true;
    for word in text.split(' ') {
        if !first {
            length += 1;
        }
        first = false;

        if word.starts_with("http://") || word.starts_with("https://") {
            length += LINK_WEIGHT;
        } else {
            length += word.chars().count();
        }
    }
    length
}

#[async_trait]
impl Publisher for XPublisher {
    fn network(&self) -> Network {
        Network::X
    }

    fn rules(&self) -> &ContentRules {
        &self.rules
    }

    fn check_content(&self, content: &str, media: &[MediaItem]) -> PublishResult<PostFormat> {
        let format = self.rules.check(Network::X, content, media)?;

        let length = weighted_length(content);
        if length > MAX_WEIGHTED_LENGTH {
            return Err(PublishError::Validation(format!(
                "Post is {} characters; x allows at most {}",
                length, MAX_WEIGHTED_LENGTH
            )));
        }

        Ok(format)
    }

    async fn publish(
        &self,
        account: &Account,
        post: &Post,
        media: &[MediaItem],
    ) -> PublishResult<String> {
        let format = self.validate(account, post, media)?;
        let request = PublishRequest::base(Network::X, account, post, media, format);

        deliver(self.api.as_ref(), post, &request).await
    }

    async fn fetch_metrics(
        &self,
        account: &Account,
        platform_post_id: &str,
    ) -> PublishResult<PostMetrics> {
        self.api
            .fetch_metrics(&account.access_token, platform_post_id)
            .await
    }
}
