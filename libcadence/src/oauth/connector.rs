//! Account connection flow
//!
//! `begin_auth` hands out an authorization URL bound to a one-time state.
//! `complete_auth` consumes that state, performs the two token exchanges,
//! enumerates destinations and upserts one account per resolved identity.
//! A destination that fails to resolve is reported and skipped; it does not
//! abort the rest of the batch.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Serialize;

use crate::db::{AccountUpsert, Database};
use crate::error::{AuthError, Result};
use crate::oauth::{Destination, ProviderRegistry, TokenGrant};
use crate::types::{AccessToken, Account, Network};

/// Where to send the user to authorize
#[derive(Debug, Clone, Serialize)]
pub struct AuthRedirect {
    pub url: String,
    pub state: String,
}

/// A destination that could not be turned into an account
#[derive(Debug, Clone, Serialize)]
pub struct DestinationFailure {
    pub destination_id: String,
    pub destination_name: String,
    pub error: String,
}

/// Result of a completed authorization
#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub network: Network,
    pub accounts: Vec<Account>,
    pub failures: Vec<DestinationFailure>,
}

pub struct AccountConnector {
    db: Database,
    providers: ProviderRegistry,
    state_ttl: i64,
}

fn new_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl AccountConnector {
    pub fn new(db: Database, providers: ProviderRegistry, state_ttl: i64) -> Self {
        Self {
            db,
            providers,
            state_ttl,
        }
    }

    /// Start connecting `network` for `user_id`
    pub async fn begin_auth(&self, user_id: &str, network: Network, now: i64) -> Result<AuthRedirect> {
        let provider = self.providers.get(network)?;

        let purged = self.db.purge_oauth_states(now - self.state_ttl).await?;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired authorization states");
        }

        let state = new_state();
        let url = provider.authorize_url(&state)?;
        self.db.save_oauth_state(&state, user_id, network, now).await?;

        tracing::info!(user_id, network = %network, "Authorization started");
        Ok(AuthRedirect { url, state })
    }

    /// Finish an authorization started by [`AccountConnector::begin_auth`]
    ///
    /// # Errors
    ///
    /// - `AuthError::InvalidState` if the state is unknown, already used or expired
    /// - `AuthError::Exchange` if the code is rejected
    /// - `AuthError::NoDestinations` if nothing publishable was found
    pub async fn complete_auth(&self, code: &str, state: &str, now: i64) -> Result<ConnectOutcome> {
        let pending = self
            .db
            .take_oauth_state(state)
            .await?
            .ok_or(AuthError::InvalidState)?;

        if now - pending.created_at > self.state_ttl {
            tracing::warn!(user_id = %pending.user_id, "Authorization state expired");
            return Err(AuthError::InvalidState.into());
        }

        let provider = self.providers.get(pending.network)?;

        // The code is single-use and the short-lived token cannot publish
        // reliably, so both exchanges happen before anything is stored.
        let short_lived = provider.exchange_code(code).await?;
        let long_lived = provider.exchange_long_lived(&short_lived.access_token).await?;

        let destinations = provider.list_destinations(&long_lived.access_token).await?;
        if destinations.is_empty() {
            return Err(AuthError::NoDestinations {
                network: pending.network.to_string(),
            }
            .into());
        }

        let mut accounts = Vec::new();
        let mut failures = Vec::new();

        for destination in &destinations {
            match self
                .connect_destination(&pending.user_id, provider.as_ref(), &long_lived, destination, now)
                .await
            {
                Ok(mut connected) => accounts.append(&mut connected),
                Err(e) => {
                    tracing::warn!(
                        destination_id = %destination.id,
                        error = %e,
                        "Skipping destination that failed to resolve"
                    );
                    failures.push(DestinationFailure {
                        destination_id: destination.id.clone(),
                        destination_name: destination.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if accounts.is_empty() {
            return Err(AuthError::NoDestinations {
                network: pending.network.to_string(),
            }
            .into());
        }

        tracing::info!(
            user_id = %pending.user_id,
            network = %pending.network,
            connected = accounts.len(),
            failed = failures.len(),
            "Authorization completed"
        );

        Ok(ConnectOutcome {
            network: pending.network,
            accounts,
            failures,
        })
    }

    async fn connect_destination(
        &self,
        user_id: &str,
        provider: &dyn crate::oauth::OAuthProvider,
        grant: &TokenGrant,
        destination: &Destination,
        now: i64,
    ) -> Result<Vec<Account>> {
        let identities = provider
            .resolve_identity(&grant.access_token, destination)
            .await?;

        let mut accounts = Vec::with_capacity(identities.len());
        for identity in identities {
            let (access_token, token_expires_at) = match identity.access_token {
                Some(token) => (token, identity.expires_in.map(|secs| now + secs)),
                None => (
                    destination
                        .access_token
                        .clone()
                        .unwrap_or_else(|| AccessToken::clone(&grant.access_token)),
                    grant.expires_at(now),
                ),
            };

            let upsert = AccountUpsert {
                user_id: user_id.to_string(),
                network: identity.network,
                platform_account_id: identity.platform_account_id,
                display_name: identity.display_name,
                access_token,
                token_expires_at,
                auxiliary_ids: identity.auxiliary_ids,
            };
            accounts.push(self.db.upsert_account(&upsert, now).await?);
        }

        Ok(accounts)
    }
}
