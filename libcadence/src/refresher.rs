//! Token refresher
//!
//! Runs hourly. Every active account whose token expires within the
//! lookahead window gets its token extended through the network's OAuth
//! provider. Non-expiring tokens are never selected.
//!
//! Writes are compare-and-swap on `token_version`, so two refreshers (or a
//! refresher racing a reconnect) cannot both rotate the same token: the loser
//! sees zero rows affected and moves on. A failed refresh keeps the old
//! token and marks the account `expired` so the user is prompted to
//! reconnect; the next run tries again and restores `connected` on success.

use serde::Serialize;

use crate::db::Database;
use crate::error::Result;
use crate::oauth::ProviderRegistry;
use crate::service::events::{EngineEvent, EventBus};
use crate::types::{Account, ConnectionStatus};

/// What happened to one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Refreshed,
    /// Provider refused or was unreachable; account marked expired
    Failed,
    /// Someone else rotated the token first
    Superseded,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub examined: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub superseded: usize,
}

pub struct TokenRefresher {
    db: Database,
    providers: ProviderRegistry,
    events: EventBus,
    lookahead: i64,
}

impl TokenRefresher {
    pub fn new(db: Database, providers: ProviderRegistry, events: EventBus, lookahead: i64) -> Self {
        Self {
            db,
            providers,
            events,
            lookahead,
        }
    }

    /// One pass over every account expiring before `now + lookahead`
    ///
    /// A failing account never stops the pass.
    pub async fn run_once(&self, now: i64) -> Result<RefreshReport> {
        let accounts = self.db.accounts_expiring_before(now + self.lookahead).await?;
        let mut report = RefreshReport {
            examined: accounts.len(),
            ..Default::default()
        };

        for account in &accounts {
            match self.refresh_account(account, now).await {
                Ok(RefreshOutcome::Refreshed) => report.refreshed += 1,
                Ok(RefreshOutcome::Failed) => report.failed += 1,
                Ok(RefreshOutcome::Superseded) => report.superseded += 1,
                Err(e) => {
                    tracing::error!(account_id = %account.id, error = %e, "Token refresh aborted");
                    report.failed += 1;
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                refreshed = report.refreshed,
                failed = report.failed,
                superseded = report.superseded,
                "Token refresh pass finished"
            );
        }

        Ok(report)
    }

    /// Extend the token of `account` as it was read
    ///
    /// The snapshot's `token_version` is the compare-and-swap key, so a
    /// refresh triggered by a stale read never overwrites a newer token.
    pub async fn refresh_account(&self, account: &Account, now: i64) -> Result<RefreshOutcome> {
        let extended = match self.providers.get(account.network) {
            Ok(provider) => provider.extend_token(&account.access_token).await,
            Err(e) => Err(e),
        };

        match extended {
            Ok(grant) => {
                let expires_at = grant.expires_at(now);
                let rotated = self
                    .db
                    .rotate_token(
                        &account.id,
                        account.token_version,
                        &grant.access_token,
                        expires_at,
                        now,
                    )
                    .await?;

                if !rotated {
                    tracing::debug!(account_id = %account.id, "Token already rotated elsewhere");
                    return Ok(RefreshOutcome::Superseded);
                }

                tracing::info!(account_id = %account.id, network = %account.network, "Token refreshed");
                self.events.emit(EngineEvent::TokenRefreshed {
                    account_id: account.id.clone(),
                    expires_at,
                });
                Ok(RefreshOutcome::Refreshed)
            }
            Err(e) => {
                let marked = self
                    .db
                    .set_connection_status(
                        &account.id,
                        account.token_version,
                        ConnectionStatus::Expired,
                        now,
                    )
                    .await?;

                if !marked {
                    return Ok(RefreshOutcome::Superseded);
                }

                tracing::warn!(
                    account_id = %account.id,
                    network = %account.network,
                    error = %e,
                    "Token refresh failed, account marked expired"
                );
                self.events.emit(EngineEvent::TokenExpired {
                    account_id: account.id.clone(),
                    error: e.to_string(),
                });
                Ok(RefreshOutcome::Failed)
            }
        }
    }
}
