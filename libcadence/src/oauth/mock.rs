//! In-memory OAuth provider for tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AuthError;
use crate::oauth::{AuthResult, Destination, OAuthProvider, ResolvedIdentity, TokenGrant};
use crate::types::{AccessToken, Network};

#[derive(Default)]
struct MockProviderState {
    /// Codes that exchange successfully; each works once
    valid_codes: Vec<String>,
    destinations: Vec<Destination>,
    /// Destination id -> identities; missing entries fail resolution
    identities: HashMap<String, Vec<ResolvedIdentity>>,
    extend_error: Option<String>,
    issued: usize,
    exchange_calls: usize,
    long_lived_calls: usize,
    extend_calls: usize,
}

/// Provider with scripted codes, destinations and identities
#[derive(Clone)]
pub struct MockOAuthProvider {
    network: Network,
    long_lived_ttl: Option<i64>,
    extend_delay: Option<Duration>,
    state: Arc<Mutex<MockProviderState>>,
}

impl MockOAuthProvider {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            long_lived_ttl: Some(60 * 24 * 60 * 60),
            extend_delay: None,
            state: Arc::new(Mutex::new(MockProviderState::default())),
        }
    }

    /// Issue long-lived tokens that never expire
    pub fn non_expiring(mut self) -> Self {
        self.long_lived_ttl = None;
        self
    }

    /// Make token extension slow
    pub fn with_extend_delay(mut self, delay: Duration) -> Self {
        self.extend_delay = Some(delay);
        self
    }

    pub fn accept_code(&self, code: &str) {
        self.state.lock().unwrap().valid_codes.push(code.to_string());
    }

    /// Add a destination that resolves to a single identity on the provider's network
    pub fn add_destination(&self, id: &str, name: &str) {
        let identity = ResolvedIdentity {
            network: self.network,
            platform_account_id: id.to_string(),
            display_name: name.to_string(),
            access_token: None,
            expires_in: None,
            auxiliary_ids: serde_json::Map::new(),
        };
        self.add_destination_with(id, name, vec![identity]);
    }

    pub fn add_destination_with(&self, id: &str, name: &str, identities: Vec<ResolvedIdentity>) {
        let mut state = self.state.lock().unwrap();
        state.destinations.push(Destination {
            id: id.to_string(),
            name: name.to_string(),
            access_token: Some(AccessToken::new(format!("page-token-{}", id))),
        });
        state.identities.insert(id.to_string(), identities);
    }

    /// Add a destination whose identity lookup fails
    pub fn add_broken_destination(&self, id: &str, name: &str) {
        self.state.lock().unwrap().destinations.push(Destination {
            id: id.to_string(),
            name: name.to_string(),
            access_token: None,
        });
    }

    pub fn fail_extend(&self, message: &str) {
        self.state.lock().unwrap().extend_error = Some(message.to_string());
    }

    pub fn exchange_call_count(&self) -> usize {
        self.state.lock().unwrap().exchange_calls
    }

    pub fn long_lived_call_count(&self) -> usize {
        self.state.lock().unwrap().long_lived_calls
    }

    pub fn extend_call_count(&self) -> usize {
        self.state.lock().unwrap().extend_calls
    }

    fn issue(&self, prefix: &str, ttl: Option<i64>) -> TokenGrant {
        let mut state = self.state.lock().unwrap();
        state.issued += 1;
        TokenGrant {
            access_token: AccessToken::new(format!("{}-{}", prefix, state.issued)),
            expires_in: ttl,
        }
    }
}

#[async_trait]
impl OAuthProvider for MockOAuthProvider {
    fn network(&self) -> Network {
        self.network
    }

    fn authorize_url(&self, state: &str) -> AuthResult<String> {
        Ok(format!(
            "https://auth.example.com/{}/authorize?state={}",
            self.network, state
        ))
    }

    async fn exchange_code(&self, code: &str) -> AuthResult<TokenGrant> {
        {
            let mut state = self.state.lock().unwrap();
            state.exchange_calls += 1;
            let position = state.valid_codes.iter().position(|c| c == code);
            match position {
                Some(index) => {
                    state.valid_codes.remove(index);
                }
                None => {
                    return Err(AuthError::Exchange(format!(
                        "authorization code '{}' is invalid or was already used",
                        code
                    )))
                }
            }
        }
        Ok(self.issue("short", Some(3600)))
    }

    async fn exchange_long_lived(&self, _short_lived: &AccessToken) -> AuthResult<TokenGrant> {
        self.state.lock().unwrap().long_lived_calls += 1;
        Ok(self.issue("long", self.long_lived_ttl))
    }

    async fn list_destinations(&self, _token: &AccessToken) -> AuthResult<Vec<Destination>> {
        Ok(self.state.lock().unwrap().destinations.clone())
    }

    async fn resolve_identity(
        &self,
        _token: &AccessToken,
        destination: &Destination,
    ) -> AuthResult<Vec<ResolvedIdentity>> {
        self.state
            .lock()
            .unwrap()
            .identities
            .get(&destination.id)
            .cloned()
            .ok_or_else(|| {
                AuthError::Provider(format!("destination {} could not be resolved", destination.id))
            })
    }

    async fn extend_token(&self, _token: &AccessToken) -> AuthResult<TokenGrant> {
        if let Some(delay) = self.extend_delay {
            tokio::time::sleep(delay).await;
        }
        let error = {
            let mut state = self.state.lock().unwrap();
            state.extend_calls += 1;
            state.extend_error.clone()
        };
        match error {
            Some(message) => Err(AuthError::Refresh(message)),
            None => Ok(self.issue("extended", self.long_lived_ttl)),
        }
    }
}
