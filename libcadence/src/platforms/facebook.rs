//! Facebook page publishing
//!
//! Posts go to a page feed as the page. Text-only posts are allowed; photos
//! and videos can be combined in one multi-item post.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::PublishResult;
use crate::platforms::{deliver, ContentRules, NetworkApi, PublishRequest, Publisher};
use crate::types::{Account, MediaItem, Network, Post, PostMetrics};

const FACEBOOK_RULES: ContentRules = ContentRules {
    max_chars: 63_206,
    max_hashtags: None,
    requires_media: false,
    max_items: 10,
    max_images: 10,
    max_videos: 10,
    allow_mixed: true,
};

pub struct FacebookPublisher {
    api: Arc<dyn NetworkApi>,
    rules: ContentRules,
}

impl FacebookPublisher {
    pub fn new(api: Arc<dyn NetworkApi>) -> Self {
        Self {
            api,
            rules: FACEBOOK_RULES,
        }
    }
}

#[async_trait]
impl Publisher for FacebookPublisher {
    fn network(&self) -> Network {
        Network::Facebook
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
        let request = PublishRequest::base(Network::Facebook, account, post, media, format);

        tracing::debug!(
            post_id = %post.id,
            page_id = %request.target,
            format = ?format,
            "Publishing to Facebook page"
        );

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockNetwork;
    use crate::platforms::test_support::{account, media, post};
    use crate::platforms::PostFormat;
    use crate::types::MediaKind;

    #[tokio::test]
    async fn test_text_only_post() {
        let api = Arc::new(MockNetwork::success());
        let publisher = FacebookPublisher::new(api.clone());

        let id = publisher
            .publish(&account(Network::Facebook), &post(Network::Facebook, "Hello page", &[]), &[])
            .await
            .unwrap();

        assert!(id.starts_with("facebook:"));
        let request = &api.requests()[0];
        assert_eq!(request.format, PostFormat::Text);
        assert_eq!(request.target, "12345");
    }

    #[tokio::test]
    async fn test_mixed_media_allowed_up_to_ten() {
        let api = Arc::new(MockNetwork::success());
        let publisher = FacebookPublisher::new(api.clone());

        let items = vec![media("m1", MediaKind::Image), media("m2", MediaKind::Video)];
        publisher
            .publish(&account(Network::Facebook), &post(Network::Facebook, "", &items), &items)
            .await
            .unwrap();
        assert_eq!(api.requests()[0].format, PostFormat::Carousel);
        assert_eq!(api.requests()[0].media.len(), 2);

        let eleven: Vec<_> = (0..11)
            .map(|i| media(&format!("m{}", i), MediaKind::Image))
            .collect();
        let result = publisher
            .publish(&account(Network::Facebook), &post(Network::Facebook, "", &eleven), &eleven)
            .await;
        assert!(result.is_err());
        assert_eq!(api.create_call_count(), 1, "invalid post must not reach the network");
    }
}
