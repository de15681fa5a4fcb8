//! OAuth provider abstraction
//!
//! An [`OAuthProvider`] performs the network side of connecting an account:
//! building the authorization URL, trading the one-time code for a
//! short-lived token, upgrading that to a long-lived token, and listing what
//! the token can publish to. [`connector::AccountConnector`] drives the flow
//! and owns persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AuthError;
use crate::types::{AccessToken, Network};

pub mod connector;
pub mod mock;

pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// A token returned by the provider
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: AccessToken,
    /// Seconds until expiry; `None` for tokens that do not expire
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Absolute expiry given the time the grant was received
    pub fn expires_at(&self, now: i64) -> Option<i64> {
        self.expires_in.map(|secs| now + secs)
    }
}

/// Something the login controls, e.g. a page or an organization
#[derive(Debug, Clone)]
pub struct Destination {
    pub id: String,
    pub name: String,
    /// Destination-scoped token (page token), when the network issues one
    pub access_token: Option<AccessToken>,
}

/// A concrete account we can publish as
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    /// May differ from the provider's network (a page proxying a linked account)
    pub network: Network,
    pub platform_account_id: String,
    pub display_name: String,
    /// Falls back to the destination token, then the user token
    pub access_token: Option<AccessToken>,
    pub expires_in: Option<i64>,
    pub auxiliary_ids: serde_json::Map<String, serde_json::Value>,
}

/// Network side of the authorization flow for one network
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn network(&self) -> Network;

    /// URL to send the user to; `state` comes back on the callback
    fn authorize_url(&self, state: &str) -> AuthResult<String>;

    /// Trade the single-use authorization code for a short-lived token
    ///
    /// # Errors
    ///
    /// `AuthError::Exchange` if the code is invalid, expired or already used.
    async fn exchange_code(&self, code: &str) -> AuthResult<TokenGrant>;

    /// Trade a short-lived token for a long-lived one
    async fn exchange_long_lived(&self, short_lived: &AccessToken) -> AuthResult<TokenGrant>;

    async fn list_destinations(&self, token: &AccessToken) -> AuthResult<Vec<Destination>>;

    /// The publishable identities behind one destination
    ///
    /// Usually one; a page with a linked account yields both.
    async fn resolve_identity(
        &self,
        token: &AccessToken,
        destination: &Destination,
    ) -> AuthResult<Vec<ResolvedIdentity>>;

    /// Exchange a still-valid long-lived token for a fresh one
    async fn extend_token(&self, token: &AccessToken) -> AuthResult<TokenGrant>;
}

/// Providers keyed by network
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<Network, Arc<dyn OAuthProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn OAuthProvider>) {
        self.providers.insert(provider.network(), provider);
    }

    /// Provider for `network`, or `AuthError::UnsupportedNetwork`
    pub fn get(&self, network: Network) -> AuthResult<Arc<dyn OAuthProvider>> {
        self.providers
            .get(&network)
            .cloned()
            .ok_or_else(|| AuthError::UnsupportedNetwork(network.to_string()))
    }
}
