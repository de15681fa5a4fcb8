//! Account and token store queries

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{corrupt, Database};
use crate::error::{DbError, Result};
use crate::types::{AccessToken, Account, ConnectionStatus, Network};

const ACCOUNT_COLUMNS: &str = "id, user_id, network, platform_account_id, display_name, \
     access_token, token_expires_at, token_version, auxiliary_ids, connection_status, \
     is_active, created_at, updated_at";

/// Everything the connector learns about one resolved destination
#[derive(Debug, Clone)]
pub struct AccountUpsert {
    pub user_id: String,
    pub network: Network,
    pub platform_account_id: String,
    pub display_name: String,
    pub access_token: AccessToken,
    pub token_expires_at: Option<i64>,
    pub auxiliary_ids: serde_json::Map<String, serde_json::Value>,
}

fn decode_account(row: &SqliteRow) -> Result<Account> {
    let network: String = row.try_get("network").map_err(DbError::SqlxError)?;
    let status: String = row.try_get("connection_status").map_err(DbError::SqlxError)?;
    let auxiliary_ids: String = row.try_get("auxiliary_ids").map_err(DbError::SqlxError)?;
    let access_token: String = row.try_get("access_token").map_err(DbError::SqlxError)?;

    Ok(Account {
        id: row.try_get("id").map_err(DbError::SqlxError)?,
        user_id: row.try_get("user_id").map_err(DbError::SqlxError)?,
        network: network
            .parse::<Network>()
            .map_err(|e| corrupt("accounts", e))?,
        platform_account_id: row
            .try_get("platform_account_id")
            .map_err(DbError::SqlxError)?,
        display_name: row.try_get("display_name").map_err(DbError::SqlxError)?,
        access_token: AccessToken::new(access_token),
        token_expires_at: row.try_get("token_expires_at").map_err(DbError::SqlxError)?,
        token_version: row.try_get("token_version").map_err(DbError::SqlxError)?,
        auxiliary_ids: serde_json::from_str(&auxiliary_ids)
            .map_err(|e| corrupt("accounts", format!("auxiliary_ids: {}", e)))?,
        connection_status: ConnectionStatus::parse(&status).ok_or_else(|| {
            corrupt("accounts", format!("unknown connection_status '{}'", status))
        })?,
        is_active: row.try_get("is_active").map_err(DbError::SqlxError)?,
        created_at: row.try_get("created_at").map_err(DbError::SqlxError)?,
        updated_at: row.try_get("updated_at").map_err(DbError::SqlxError)?,
    })
}

impl Database {
    /// Insert or refresh the account keyed by (user, network, platform account)
    ///
    /// Reconnecting an existing destination rotates its token, reactivates it
    /// and resets its connection status. The row id is stable across upserts.
    pub async fn upsert_account(&self, upsert: &AccountUpsert, now: i64) -> Result<Account> {
        let auxiliary_ids = serde_json::Value::Object(upsert.auxiliary_ids.clone()).to_string();

        sqlx::query(
            r#"
            INSERT INTO accounts (
                id, user_id, network, platform_account_id, display_name, access_token,
                token_expires_at, token_version, auxiliary_ids, connection_status, is_active,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, 'connected', 1, ?, ?)
            ON CONFLICT(user_id, network, platform_account_id) DO UPDATE SET
                display_name = excluded.display_name,
                access_token = excluded.access_token,
                token_expires_at = excluded.token_expires_at,
                token_version = accounts.token_version + 1,
                auxiliary_ids = excluded.auxiliary_ids,
                connection_status = 'connected',
                is_active = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&upsert.user_id)
        .bind(upsert.network.as_str())
        .bind(&upsert.platform_account_id)
        .bind(&upsert.display_name)
        .bind(upsert.access_token.expose())
        .bind(upsert.token_expires_at)
        .bind(auxiliary_ids)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE user_id = ? AND network = ? AND platform_account_id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(&upsert.user_id)
        .bind(upsert.network.as_str())
        .bind(&upsert.platform_account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        decode_account(&row)
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS))
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(decode_account).transpose()
    }

    /// A user's accounts; soft-deleted ones only when `include_inactive`
    pub async fn list_accounts(&self, user_id: &str, include_inactive: bool) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE user_id = ? AND (is_active = 1 OR ?) \
             ORDER BY network, display_name",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_account).collect()
    }

    /// Soft-delete an account
    pub async fn deactivate_account(&self, account_id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts SET is_active = 0, updated_at = ?
            WHERE id = ? AND is_active = 1
            "#,
        )
        .bind(now)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Active accounts whose token expires at or before `deadline`
    ///
    /// Non-expiring tokens (`token_expires_at IS NULL`) are never selected.
    pub async fn accounts_expiring_before(&self, deadline: i64) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM accounts \
             WHERE token_expires_at IS NOT NULL AND token_expires_at <= ? AND is_active = 1 \
             ORDER BY token_expires_at ASC",
            ACCOUNT_COLUMNS
        ))
        .bind(deadline)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_account).collect()
    }

    /// Swap in a new token if nobody rotated it since `expected_token_version`
    pub async fn rotate_token(
        &self,
        account_id: &str,
        expected_token_version: i64,
        access_token: &AccessToken,
        token_expires_at: Option<i64>,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET access_token = ?, token_expires_at = ?, token_version = token_version + 1,
                connection_status = 'connected', updated_at = ?
            WHERE id = ? AND token_version = ?
            "#,
        )
        .bind(access_token.expose())
        .bind(token_expires_at)
        .bind(now)
        .bind(account_id)
        .bind(expected_token_version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Flag the connection status without touching the stored token
    ///
    /// Guarded by `token_version` so a concurrent successful rotation wins.
    pub async fn set_connection_status(
        &self,
        account_id: &str,
        expected_token_version: i64,
        status: ConnectionStatus,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts SET connection_status = ?, updated_at = ?
            WHERE id = ? AND token_version = ?
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(account_id)
        .bind(expected_token_version)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::setup_test_db;
    use super::*;

    fn upsert(platform_account_id: &str, token: &str, expires: Option<i64>) -> AccountUpsert {
        AccountUpsert {
            user_id: "user-1".to_string(),
            network: Network::Facebook,
            platform_account_id: platform_account_id.to_string(),
            display_name: format!("Page {}", platform_account_id),
            access_token: AccessToken::new(token),
            token_expires_at: expires,
            auxiliary_ids: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_by_destination() {
        let (_temp, db) = setup_test_db().await;

        let first = db.upsert_account(&upsert("page-1", "t1", Some(5_000)), 1_000).await.unwrap();
        let second = db.upsert_account(&upsert("page-1", "t2", Some(9_000)), 2_000).await.unwrap();

        assert_eq!(first.id, second.id, "same destination must keep its id");
        assert_eq!(second.access_token.expose(), "t2");
        assert_eq!(second.token_expires_at, Some(9_000));
        assert_eq!(second.token_version, first.token_version + 1);

        let all = db.list_accounts("user-1", false).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_reactivates_disconnected_account() {
        let (_temp, db) = setup_test_db().await;
        let account = db.upsert_account(&upsert("page-1", "t1", None), 1_000).await.unwrap();

        assert!(db.deactivate_account(&account.id, 1_100).await.unwrap());
        assert!(db.list_accounts("user-1", false).await.unwrap().is_empty());
        assert_eq!(db.list_accounts("user-1", true).await.unwrap().len(), 1);

        let again = db.upsert_account(&upsert("page-1", "t2", None), 1_200).await.unwrap();
        assert!(again.is_active);
    }

    #[tokio::test]
    async fn test_expiring_selection_skips_non_expiring_tokens() {
        let (_temp, db) = setup_test_db().await;
        db.upsert_account(&upsert("soon", "t", Some(1_500)), 1_000).await.unwrap();
        db.upsert_account(&upsert("later", "t", Some(99_000)), 1_000).await.unwrap();
        db.upsert_account(&upsert("never", "t", None), 1_000).await.unwrap();

        let selected = db.accounts_expiring_before(2_000).await.unwrap();
        let ids: Vec<_> = selected.iter().map(|a| a.platform_account_id.as_str()).collect();
        assert_eq!(ids, vec!["soon"]);
    }

    #[tokio::test]
    async fn test_rotate_token_is_compare_and_swap() {
        let (_temp, db) = setup_test_db().await;
        let account = db.upsert_account(&upsert("page-1", "t1", Some(1_500)), 1_000).await.unwrap();

        let new_token = AccessToken::new("t2");
        assert!(db
            .rotate_token(&account.id, account.token_version, &new_token, Some(8_000), 1_100)
            .await
            .unwrap());
        // Second writer read the same version and must lose
        assert!(!db
            .rotate_token(&account.id, account.token_version, &new_token, Some(9_000), 1_100)
            .await
            .unwrap());

        let stored = db.get_account(&account.id).await.unwrap().unwrap();
        assert_eq!(stored.token_expires_at, Some(8_000));
    }
}
