//! HTTP gateway client
//!
//! Each network is reached through a JSON gateway configured by
//! `[networks.<name>]`. The gateway speaks one small protocol for all
//! networks; per-network differences live in the adapters.
//!
//! | Call                     | Request                                   |
//! |--------------------------|-------------------------------------------|
//! | create post              | `POST {api_base}/posts`                   |
//! | find post                | `GET {api_base}/posts?idempotency_key=..` |
//! | metrics                  | `GET {api_base}/posts/{id}/metrics`       |
//! | token exchange / refresh | `POST {api_base}/oauth/token`             |
//! | destinations             | `GET {api_base}/me/destinations`          |
//! | identities               | `GET {api_base}/destinations/{id}/identities` |
//!
//! HTTP failures map onto the publish error taxonomy in
//! [`classify_status`].

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::{AuthError, CadenceError, ConfigError, PublishError, PublishResult};
use crate::oauth::{AuthResult, Destination, OAuthProvider, ResolvedIdentity, TokenGrant};
use crate::platforms::{NetworkApi, PublishRequest};
use crate::types::{AccessToken, Network, PostMetrics};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// JSON gateway for one network
#[derive(Clone)]
pub struct GatewayClient {
    network: Network,
    client: Client,
    api_base: Url,
    config: NetworkConfig,
}

#[derive(Serialize)]
struct CreatePostBody<'a> {
    target: &'a str,
    format: crate::platforms::PostFormat,
    text: &'a str,
    media: &'a [crate::platforms::MediaRef],
    auxiliary_ids: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct PostIdBody {
    id: String,
}

#[derive(Deserialize)]
struct LookupBody {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
struct TokenBody {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize)]
struct DestinationBody {
    id: String,
    name: String,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct IdentityBody {
    network: Option<String>,
    id: String,
    name: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    auxiliary_ids: serde_json::Map<String, serde_json::Value>,
}

/// Map a non-success HTTP status to a publish error
///
/// 401/403 mean the token is no longer accepted, 429 carries the network's
/// requested wait, 400/409/422 reject the content itself. Anything else is
/// unexplained and retried under the lower unknown-error ceiling.
pub fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> PublishError {
    let message = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), truncate(body, 300))
    };

    match status.as_u16() {
        401 | 403 => PublishError::AuthExpired(message),
        429 => PublishError::RateLimited {
            message,
            retry_after,
        },
        400 | 409 | 422 => PublishError::Validation(message),
        _ => PublishError::UnknownPlatform(message),
    }
}

fn classify_transport(error: reqwest::Error) -> PublishError {
    if error.is_timeout() || error.is_connect() {
        PublishError::NetworkUnreachable(error.to_string())
    } else if error.is_decode() {
        PublishError::UnknownPlatform(format!("malformed gateway response: {}", error))
    } else {
        PublishError::NetworkUnreachable(error.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl GatewayClient {
    pub fn new(network: Network, config: &NetworkConfig) -> crate::error::Result<Self> {
        let api_base = Url::parse(config.api_base.trim_end_matches('/')).map_err(|e| {
            CadenceError::Config(ConfigError::InvalidValue {
                field: format!("networks.{}.api_base", network),
                reason: e.to_string(),
            })
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                CadenceError::Config(ConfigError::InvalidValue {
                    field: format!("networks.{}", network),
                    reason: format!("failed to build HTTP client: {}", e),
                })
            })?;

        Ok(Self {
            network,
            client,
            api_base,
            config: config.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_base.as_str().trim_end_matches('/'), path)
    }

    async fn send(&self, request: RequestBuilder) -> PublishResult<Response> {
        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();

        tracing::debug!(
            network = %self.network,
            status = status.as_u16(),
            "Gateway request failed"
        );
        Err(classify_status(status, retry_after, &body))
    }

    async fn token_request(&self, form: serde_json::Value) -> PublishResult<TokenGrant> {
        let response = self
            .send(self.client.post(self.endpoint("oauth/token")).json(&form))
            .await?;
        let body: TokenBody = response.json().await.map_err(classify_transport)?;

        Ok(TokenGrant {
            access_token: AccessToken::new(body.access_token),
            expires_in: body.expires_in,
        })
    }

    fn client_credentials(&self) -> serde_json::Value {
        serde_json::json!({
            "client_id": self.config.client_id,
            "client_secret": self.config.client_secret().unwrap_or_default(),
        })
    }
}

fn merge(mut base: serde_json::Value, extra: serde_json::Value) -> serde_json::Value {
    if let (Some(base), serde_json::Value::Object(extra)) = (base.as_object_mut(), extra) {
        base.extend(extra);
    }
    base
}

fn provider_error(error: PublishError) -> AuthError {
    AuthError::Provider(error.to_string())
}

#[async_trait]
impl NetworkApi for GatewayClient {
    async fn create_post(&self, request: &PublishRequest) -> PublishResult<String> {
        let body = CreatePostBody {
            target: &request.target,
            format: request.format,
            text: &request.text,
            media: &request.media,
            auxiliary_ids: &request.auxiliary_ids,
        };

        let response = self
            .send(
                self.client
                    .post(self.endpoint("posts"))
                    .bearer_auth(request.access_token.expose())
                    .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
                    .json(&body),
            )
            .await?;

        let created: PostIdBody = response.json().await.map_err(classify_transport)?;
        Ok(created.id)
    }

    fn supports_lookup(&self) -> bool {
        self.config.supports_lookup
    }

    async fn find_post(&self, request: &PublishRequest) -> PublishResult<Option<String>> {
        if !self.config.supports_lookup {
            return Ok(None);
        }

        let response = self
            .send(
                self.client
                    .get(self.endpoint("posts"))
                    .bearer_auth(request.access_token.expose())
                    .query(&[
                        ("idempotency_key", request.idempotency_key.as_str()),
                        ("target", request.target.as_str()),
                    ]),
            )
            .await?;

        let found: LookupBody = response.json().await.map_err(classify_transport)?;
        Ok(found.id)
    }

    async fn fetch_metrics(
        &self,
        access_token: &AccessToken,
        platform_post_id: &str,
    ) -> PublishResult<PostMetrics> {
        let response = self
            .send(
                self.client
                    .get(self.endpoint(&format!("posts/{}/metrics", platform_post_id)))
                    .bearer_auth(access_token.expose()),
            )
            .await?;

        response.json().await.map_err(classify_transport)
    }
}

#[async_trait]
impl OAuthProvider for GatewayClient {
    fn network(&self) -> Network {
        self.network
    }

    fn authorize_url(&self, state: &str) -> AuthResult<String> {
        let base = self
            .config
            .authorize_url
            .clone()
            .unwrap_or_else(|| self.endpoint("oauth/authorize"));
        let scopes = self.config.scopes.join(" ");

        let url = Url::parse_with_params(
            &base,
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", scopes.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| AuthError::Provider(format!("invalid authorize URL: {}", e)))?;

        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> AuthResult<TokenGrant> {
        let form = merge(
            self.client_credentials(),
            serde_json::json!({
                "grant_type": "authorization_code",
                "code": code,
                "redirect_uri": self.config.redirect_uri,
            }),
        );

        self.token_request(form).await.map_err(|e| match e {
            PublishError::Validation(msg) | PublishError::AuthExpired(msg) => AuthError::Exchange(msg),
            other => provider_error(other),
        })
    }

    async fn exchange_long_lived(&self, short_lived: &AccessToken) -> AuthResult<TokenGrant> {
        let form = merge(
            self.client_credentials(),
            serde_json::json!({
                "grant_type": "long_lived_token",
                "access_token": short_lived.expose(),
            }),
        );

        self.token_request(form).await.map_err(|e| match e {
            PublishError::Validation(msg) | PublishError::AuthExpired(msg) => AuthError::Exchange(msg),
            other => provider_error(other),
        })
    }

    async fn list_destinations(&self, token: &AccessToken) -> AuthResult<Vec<Destination>> {
        let response = self
            .send(
                self.client
                    .get(self.endpoint("me/destinations"))
                    .bearer_auth(token.expose()),
            )
            .await
            .map_err(provider_error)?;

        let body: Vec<DestinationBody> = response
            .json()
            .await
            .map_err(|e| provider_error(classify_transport(e)))?;

        Ok(body
            .into_iter()
            .map(|d| Destination {
                id: d.id,
                name: d.name,
                access_token: d.access_token.map(AccessToken::new),
            })
            .collect())
    }

    async fn resolve_identity(
        &self,
        token: &AccessToken,
        destination: &Destination,
    ) -> AuthResult<Vec<ResolvedIdentity>> {
        let token = destination.access_token.as_ref().unwrap_or(token);
        let response = self
            .send(
                self.client
                    .get(self.endpoint(&format!("destinations/{}/identities", destination.id)))
                    .bearer_auth(token.expose()),
            )
            .await
            .map_err(provider_error)?;

        let body: Vec<IdentityBody> = response
            .json()
            .await
            .map_err(|e| provider_error(classify_transport(e)))?;

        body.into_iter()
            .map(|identity| {
                let network = match identity.network.as_deref() {
                    Some(name) => name.parse::<Network>().map_err(AuthError::Provider)?,
                    None => self.network,
                };
                Ok(ResolvedIdentity {
                    network,
                    platform_account_id: identity.id,
                    display_name: identity.name,
                    access_token: identity.access_token.map(AccessToken::new),
                    expires_in: identity.expires_in,
                    auxiliary_ids: identity.auxiliary_ids,
                })
            })
            .collect()
    }

    async fn extend_token(&self, token: &AccessToken) -> AuthResult<TokenGrant> {
        let form = merge(
            self.client_credentials(),
            serde_json::json!({
                "grant_type": "refresh_token",
                "access_token": token.expose(),
            }),
        );

        self.token_request(form)
            .await
            .map_err(|e| AuthError::Refresh(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::{MediaRef, PostFormat};
    use crate::types::MediaKind;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, supports_lookup: bool) -> NetworkConfig {
        NetworkConfig {
            enabled: true,
            api_base: server.uri(),
            authorize_url: None,
            client_id: "client-1".to_string(),
            client_secret_env: None,
            redirect_uri: "https://app.example.com/callback".to_string(),
            scopes: vec!["publish".to_string(), "read".to_string()],
            request_timeout: 5,
            supports_lookup,
        }
    }

    fn request() -> PublishRequest {
        PublishRequest {
            network: Network::Facebook,
            idempotency_key: "abc123".to_string(),
            target: "page-1".to_string(),
            auxiliary_ids: serde_json::Map::new(),
            access_token: AccessToken::new("secret-token"),
            format: PostFormat::SingleImage,
            text: "Fresh bread".to_string(),
            media: vec![MediaRef {
                url: "https://cdn.example.com/a.jpg".to_string(),
                kind: MediaKind::Image,
                content_type: "image/jpeg".to_string(),
            }],
        }
    }

    async fn status_error(status: u16, retry_after: Option<&str>) -> PublishError {
        let server = MockServer::start().await;
        let mut template = ResponseTemplate::new(status).set_body_string("nope");
        if let Some(value) = retry_after {
            template = template.insert_header("Retry-After", value);
        }
        Mock::given(method("POST"))
            .and(path("/posts"))
            .respond_with(template)
            .mount(&server)
            .await;

        let client = GatewayClient::new(Network::Facebook, &config(&server, false)).unwrap();
        client.create_post(&request()).await.unwrap_err()
    }

    #[tokio::test]
    async fn test_create_post_sends_token_and_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/posts"))
            .and(header("authorization", "Bearer secret-token"))
            .and(header("idempotency-key", "abc123"))
            .and(body_partial_json(serde_json::json!({
                "target": "page-1",
                "format": "single_image",
                "text": "Fresh bread",
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "fb_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = GatewayClient::new(Network::Facebook, &config(&server, false)).unwrap();
        let id = client.create_post(&request()).await.unwrap();
        assert_eq!(id, "fb_1");
    }

    #[tokio::test]
    async fn test_status_mapping() {
        assert!(matches!(status_error(401, None).await, PublishError::AuthExpired(_)));
        assert!(matches!(status_error(403, None).await, PublishError::AuthExpired(_)));
        assert!(matches!(status_error(422, None).await, PublishError::Validation(_)));
        assert!(matches!(status_error(409, None).await, PublishError::Validation(_)));
        assert!(matches!(status_error(500, None).await, PublishError::UnknownPlatform(_)));
        assert!(matches!(status_error(404, None).await, PublishError::UnknownPlatform(_)));

        let limited = status_error(429, Some("120")).await;
        assert_eq!(limited.retry_after(), Some(120));
        assert_eq!(status_error(429, None).await.retry_after(), None);
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_unreachable() {
        let server = MockServer::start().await;
        let cfg = config(&server, false);
        drop(server);

        let client = GatewayClient::new(Network::Facebook, &cfg).unwrap();
        let err = client.create_post(&request()).await.unwrap_err();
        assert!(matches!(err, PublishError::NetworkUnreachable(_)));
    }

    #[tokio::test]
    async fn test_find_post_only_when_supported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts"))
            .and(query_param("idempotency_key", "abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "fb_1"})))
            .mount(&server)
            .await;

        let without = GatewayClient::new(Network::Facebook, &config(&server, false)).unwrap();
        assert!(!without.supports_lookup());
        assert_eq!(without.find_post(&request()).await.unwrap(), None);

        let with = GatewayClient::new(Network::Facebook, &config(&server, true)).unwrap();
        assert_eq!(with.find_post(&request()).await.unwrap(), Some("fb_1".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_metrics() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts/fb_1/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "impressions": 100, "likes": 7, "comments": 2, "shares": 1
            })))
            .mount(&server)
            .await;

        let client = GatewayClient::new(Network::Facebook, &config(&server, false)).unwrap();
        let metrics = client
            .fetch_metrics(&AccessToken::new("t"), "fb_1")
            .await
            .unwrap();
        assert_eq!(metrics.impressions, 100);
        assert_eq!(metrics.likes, 7);
    }

    #[tokio::test]
    async fn test_authorize_url_carries_state_and_scopes() {
        let server = MockServer::start().await;
        let client = GatewayClient::new(Network::LinkedIn, &config(&server, false)).unwrap();

        let url = Url::parse(&client.authorize_url("state-xyz").unwrap()).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/oauth/authorize");
        assert_eq!(params["state"], "state-xyz");
        assert_eq!(params["client_id"], "client-1");
        assert_eq!(params["scope"], "publish read");
    }

    #[tokio::test]
    async fn test_exchange_code_rejection_is_exchange_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_partial_json(serde_json::json!({"grant_type": "authorization_code"})))
            .respond_with(ResponseTemplate::new(400).set_body_string("code expired"))
            .mount(&server)
            .await;

        let client = GatewayClient::new(Network::Facebook, &config(&server, false)).unwrap();
        let err = client.exchange_code("old-code").await.unwrap_err();
        assert!(matches!(err, AuthError::Exchange(_)));
    }

    #[tokio::test]
    async fn test_token_exchanges_and_identities() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_partial_json(serde_json::json!({"grant_type": "long_lived_token"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "long-1", "expires_in": 5_184_000
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/destinations/page-1/identities"))
            .and(header("authorization", "Bearer page-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "page-1", "name": "Bakery"},
                {"network": "instagram", "id": "ig-1", "name": "@bakery",
                 "auxiliary_ids": {"page_id": "page-1"}}
            ])))
            .mount(&server)
            .await;

        let client = GatewayClient::new(Network::Facebook, &config(&server, false)).unwrap();

        let grant = client
            .exchange_long_lived(&AccessToken::new("short-1"))
            .await
            .unwrap();
        assert_eq!(grant.access_token.expose(), "long-1");
        assert_eq!(grant.expires_in, Some(5_184_000));

        let destination = Destination {
            id: "page-1".to_string(),
            name: "Bakery".to_string(),
            access_token: Some(AccessToken::new("page-token")),
        };
        let identities = client
            .resolve_identity(&grant.access_token, &destination)
            .await
            .unwrap();
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].network, Network::Facebook);
        assert_eq!(identities[1].network, Network::Instagram);
        assert_eq!(
            identities[1].auxiliary_ids.get("page_id"),
            Some(&serde_json::json!("page-1"))
        );
    }
}
