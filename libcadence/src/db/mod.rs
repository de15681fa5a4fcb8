//! Database operations for Cadence
//!
//! All durable engine state lives here. Writes that can race with another
//! worker or editor are conditional `UPDATE`s; callers inspect the returned
//! `bool` (whether a row was affected) instead of taking locks.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use crate::error::{DbError, Result};

mod accounts;
mod media;
mod oauth;
mod posts;

pub use accounts::AccountUpsert;
pub use oauth::PendingAuth;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        // Several sweep workers write concurrently; WAL plus a busy timeout
        // makes a losing writer wait for the lock instead of erroring.
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and run migrations on it
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn corrupt(table: &'static str, detail: impl Into<String>) -> DbError {
    DbError::CorruptRow {
        table,
        detail: detail.into(),
    }
}
