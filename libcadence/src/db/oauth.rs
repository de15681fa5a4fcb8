//! Pending OAuth authorization states

use super::{corrupt, Database};
use crate::error::{DbError, Result};
use crate::types::Network;

/// Who started an authorization and when
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuth {
    pub user_id: String,
    pub network: Network,
    pub created_at: i64,
}

impl Database {
    pub async fn save_oauth_state(
        &self,
        state: &str,
        user_id: &str,
        network: Network,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_states (state, user_id, network, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(state)
        .bind(user_id)
        .bind(network.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Consume a state. A second call with the same state returns `None`.
    pub async fn take_oauth_state(&self, state: &str) -> Result<Option<PendingAuth>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            r#"
            DELETE FROM oauth_states WHERE state = ?
            RETURNING user_id, network, created_at
            "#,
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.map(|(user_id, network, created_at)| -> Result<PendingAuth> {
            Ok(PendingAuth {
                user_id,
                network: network
                    .parse::<Network>()
                    .map_err(|e| corrupt("oauth_states", e))?,
                created_at,
            })
        })
        .transpose()
    }

    /// Drop states created before `cutoff`
    pub async fn purge_oauth_states(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}
