//! Instagram professional account publishing
//!
//! Every post needs media: one image, one video (published as a reel), or a
//! carousel of up to ten items. Captions are capped at 2 200 characters and
//! 30 hashtags.
//!
//! Instagram accounts are reached through the Facebook page they are linked
//! to. The connector stores that page id under the `page_id` auxiliary key;
//! it is forwarded with every request.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::PublishResult;
use crate::platforms::{deliver, ContentRules, NetworkApi, PublishRequest, Publisher};
use crate::types::{Account, MediaItem, Network, Post, PostMetrics};

const INSTAGRAM_RULES: ContentRules = ContentRules {
    max_chars: 2_200,
    max_hashtags: Some(30),
    requires_media: true,
    max_items: 10,
    max_images: 10,
    max_videos: 10,
    allow_mixed: true,
};

pub struct InstagramPublisher {
    api: Arc<dyn NetworkApi>,
    rules: ContentRules,
}

impl InstagramPublisher {
    pub fn new(api: Arc<dyn NetworkApi>) -> Self {
        Self {
            api,
            rules: INSTAGRAM_RULES,
        }
    }
}

#[async_trait]
impl Publisher for InstagramPublisher {
    fn network(&self) -> Network {
        Network::Instagram
    }

    fn rules(&self) -> &ContentRules {
        &self.rules
    }

    async fn publish(
        &self,
        account: &Account,
        post: &Post,
        media: &[MediaItem],
    ) -> PublishResult<String> {
        let format = self.validate(account, post, media)?;
        let request = PublishRequest::base(Network::Instagram, account, post, media, format);

        if account.auxiliary_id("page_id").is_none() {
            tracing::warn!(
                account_id = %account.id,
                "Instagram account has no linked page id; publishing may be rejected"
            );
        }

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
