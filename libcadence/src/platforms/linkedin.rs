//! LinkedIn member and organization publishing
//!
//! One login can publish as the member and as any organization the member
//! administers. The connector records which under the `kind` auxiliary key
//! (`person` or `organization`); the author is sent as the matching URN.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::PublishResult;
use crate::platforms::{deliver, ContentRules, NetworkApi, PublishRequest, Publisher};
use crate::types::{Account, MediaItem, Network, Post, PostMetrics};

const LINKEDIN_RULES: ContentRules = ContentRules {
    max_chars: 3_000,
    max_hashtags: None,
    requires_media: false,
    max_items: 9,
    max_images: 9,
    max_videos: 1,
    allow_mixed: false,
};

pub struct LinkedInPublisher {
    api: Arc<dyn NetworkApi>,
    rules: ContentRules,
}

impl LinkedInPublisher {
    pub fn new(api: Arc<dyn NetworkApi>) -> Self {
        Self {
            api,
            rules: LINKEDIN_RULES,
        }
    }
}

/// Author URN for the account
pub fn author_urn(account: &Account) -> String {
    let id = &account.platform_account_id;
    if id.starts_with("urn:li:") {
        return id.clone();
    }
    match account.auxiliary_id("kind") {
        Some("organization") => format!("urn:li:organization:{}", id),
        _ => format!("urn:li:person:{}", id),
    }
}

#[async_trait]
impl Publisher for LinkedInPublisher {
    fn network(&self) -> Network {
        Network::LinkedIn
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
        let mut request = PublishRequest::base(Network::LinkedIn, account, post, media, format);
        request.target = author_urn(account);

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
    use crate::types::MediaKind;

    #[test]
    fn test_author_urn() {
        let mut acct = account(Network::LinkedIn);
        assert_eq!(author_urn(&acct), "urn:li:person:12345");

        acct.auxiliary_ids
            .insert("kind".to_string(), serde_json::json!("organization"));
        assert_eq!(author_urn(&acct), "urn:li:organization:12345");

        acct.platform_account_id = "urn:li:organization:777".to_string();
        assert_eq!(author_urn(&acct), "urn:li:organization:777");
    }

    #[tokio::test]
    async fn test_publish_as_organization() {
        let api = Arc::new(MockNetwork::success());
        let publisher = LinkedInPublisher::new(api.clone());
        let mut acct = account(Network::LinkedIn);
        acct.auxiliary_ids
            .insert("kind".to_string(), serde_json::json!("organization"));

        publisher
            .publish(&acct, &post(Network::LinkedIn, "Quarterly update", &[]), &[])
            .await
            .unwrap();

        assert_eq!(api.requests()[0].target, "urn:li:organization:12345");
    }

    #[test]
    fn test_media_limits() {
        let publisher = LinkedInPublisher::new(Arc::new(MockNetwork::success()));
        let acct = account(Network::LinkedIn);

        let nine: Vec<_> = (0..9)
            .map(|i| media(&format!("m{}", i), MediaKind::Image))
            .collect();
        assert!(publisher
            .validate(&acct, &post(Network::LinkedIn, "", &nine), &nine)
            .is_ok());

        let two_videos = vec![media("v1", MediaKind::Video), media("v2", MediaKind::Video)];
        assert!(publisher
            .validate(&acct, &post(Network::LinkedIn, "", &two_videos), &two_videos)
            .is_err());

        let long = "a".repeat(3_001);
        assert!(publisher
            .validate(&acct, &post(Network::LinkedIn, &long, &[]), &[])
            .is_err());
    }
}
