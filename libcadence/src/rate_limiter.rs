//! Local per-network posting ceilings
//!
//! Counts posts per network in one-hour windows stored in `rate_limits`.
//! Reserving a slot is a single conditional upsert, so concurrent sweep
//! workers cannot overshoot a ceiling between checking and recording.

use std::collections::HashMap;

use crate::db::Database;
use crate::error::{DbError, Result};
use crate::types::Network;

const WINDOW_SECS: i64 = 3600;

/// Posts-per-hour limits keyed by network
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    limits: HashMap<Network, u32>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<Network, u32>) -> Self {
        Self { limits }
    }

    pub fn limit(&self, network: Network) -> Option<u32> {
        self.limits.get(&network).copied()
    }

    /// Take one slot in the current window if any remain
    ///
    /// Returns `Ok(false)` when the network is at its ceiling. Networks
    /// without a configured limit always succeed and are not counted.
    pub async fn try_reserve(&self, db: &Database, network: Network, now: i64) -> Result<bool> {
        let limit = match self.limit(network) {
            Some(limit) => limit,
            None => return Ok(true),
        };
        if limit == 0 {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO rate_limits (network, window_start, post_count)
            VALUES (?, ?, 1)
            ON CONFLICT(network, window_start)
            DO UPDATE SET post_count = post_count + 1
            WHERE rate_limits.post_count < ?
            "#,
        )
        .bind(network.as_str())
        .bind(window_start(now))
        .bind(limit as i64)
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// When the window after the one containing `now` opens
    pub fn next_window(&self, now: i64) -> i64 {
        window_start(now) + WINDOW_SECS
    }

    /// Give back a slot reserved at `now` that was not used
    pub async fn release(&self, db: &Database, network: Network, now: i64) -> Result<()> {
        if self.limit(network).is_none() {
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE rate_limits SET post_count = post_count - 1
            WHERE network = ? AND window_start = ? AND post_count > 0
            "#,
        )
        .bind(network.as_str())
        .bind(window_start(now))
        .execute(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Posts counted for `network` in the window containing `now`
    pub async fn used(&self, db: &Database, network: Network, now: i64) -> Result<u32> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT post_count FROM rate_limits WHERE network = ? AND window_start = ?",
        )
        .bind(network.as_str())
        .bind(window_start(now))
        .fetch_optional(db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|(count,)| count.max(0) as u32).unwrap_or(0))
    }

    /// Delete windows that ended before `cutoff`
    pub async fn cleanup_old_windows(&self, db: &Database, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE window_start < ?")
            .bind(window_start(cutoff))
            .execute(db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

/// Start of the hour window containing `timestamp`
fn window_start(timestamp: i64) -> i64 {
    (timestamp / WINDOW_SECS) * WINDOW_SECS
}
