//! Persistent domain state for the meshcore console.
//!
//! Peers, channels, threads, messages and the rolling packet history live in
//! SQLite (see `meshcore-db`). Query functions take a plain
//! [`rusqlite::Connection`] so that callers can compose several of them
//! inside one transaction; [`Store`] wraps the pool and provides that
//! transaction boundary.
//!
//! The [`NodeResolver`] maps the sender identifiers found in packets onto
//! peer records, creating provisional peers for unknown senders and merging
//! them once a full public key is observed.

pub mod channels;
pub mod messages;
pub mod packets;
pub mod peers;
mod resolver;
pub mod threads;

pub use resolver::{Evidence, NodeResolver, Resolution, ResolutionConflict, SenderIdentifier};

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use meshcore_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings, MigrationError, PoolError};
use rusqlite::{Connection, ErrorCode, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("pool setup failed: {0}")]
    PoolInit(#[from] PoolError),
    #[error("migration failed: {0}")]
    Migration(#[from] MigrationError),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    /// Lock contention or pool exhaustion: the same write may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Pool(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Handle to the pooled database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    /// Opens (creating if needed) the database at `path`, applies migrations
    /// and ensures the public channel exists.
    pub fn open(path: &str, settings: DbRuntimeSettings) -> Result<Self, StoreError> {
        let pool = create_pool(path, settings)?;
        Self::from_pool(pool)
    }

    /// A private in-memory database, for tests and dry runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:", DbRuntimeSettings::default())
    }

    /// Wraps an existing pool, applying migrations first.
    pub fn from_pool(pool: DbPool) -> Result<Self, StoreError> {
        {
            let conn = pool.get()?;
            let applied = run_migrations(&conn)?;
            if applied > 0 {
                tracing::info!(applied, "database schema updated");
            }
            channels::ensure_public_channel(&conn, Utc::now())?;
        }
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Runs read-only queries on a pooled connection.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.pool.get()?;
        f(&conn)
    }

    /// Runs `f` inside one write transaction.
    ///
    /// The write lock is taken when the transaction begins, so contention
    /// surfaces as a transient error before any work is done. Nothing is
    /// committed if `f` fails.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.pool.get()?;
        immediate(&mut conn, f)
    }

    /// Like [`transaction`](Self::transaction), but waits at most `wait` for
    /// a pooled connection and for the write lock. A shorter configured busy
    /// timeout still applies. Running out of time is a transient error.
    pub fn transaction_within<T>(
        &self,
        wait: Duration,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let wait = wait.max(Duration::from_millis(1));
        let mut conn = self.pool.get_timeout(wait)?;
        let configured: u64 = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?;
        let configured = Duration::from_millis(configured);
        conn.busy_timeout(wait.min(configured))?;
        let result = immediate(&mut conn, f);
        if let Err(e) = conn.busy_timeout(configured) {
            tracing::warn!(error = %e, "failed to restore busy timeout");
        }
        result
    }
}

fn immediate<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Connection) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("max_size", &self.pool.max_size())
            .finish()
    }
}

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_col<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_has_public_channel() {
        let store = Store::in_memory().expect("store");
        let channel = store
            .read(|conn| channels::get_channel(conn, meshcore_types::PUBLIC_CHANNEL_ID))
            .expect("public channel");
        assert!(channel.joined);
        assert_eq!(channel.hashtag(), "#public");
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let store = Store::in_memory().expect("store");
        let result: Result<(), StoreError> = store.transaction(|conn| {
            channels::import_channel(conn, "ops", "00112233445566778899aabbccddeeff", Utc::now())?;
            Err(StoreError::NotFound("forced".into()))
        });
        assert!(result.is_err());

        let found = store
            .read(|conn| channels::find_channel_by_name(conn, "ops"))
            .expect("query");
        assert!(found.is_none(), "import must not survive a failed transaction");
    }

    #[test]
    fn bounded_transaction_gives_up_on_a_held_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bounded.db");
        let path = path.to_str().expect("utf-8 path");
        let store = Store::open(path, DbRuntimeSettings::default()).expect("store");

        let blocker = Connection::open(path).expect("blocker");
        blocker.execute_batch("BEGIN IMMEDIATE").expect("take write lock");

        let started = std::time::Instant::now();
        let err = store
            .transaction_within(Duration::from_millis(30), |_| Ok(()))
            .expect_err("lock is held");
        assert!(err.is_transient(), "{err}");
        assert!(started.elapsed() < Duration::from_millis(1_000));

        blocker.execute_batch("COMMIT").expect("release write lock");
        let timeout: u64 = store
            .read(|conn| Ok(conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0))?))
            .expect("busy timeout");
        assert_eq!(timeout, DbRuntimeSettings::default().busy_timeout_ms);
        store
            .transaction_within(Duration::from_millis(30), |conn| {
                channels::import_channel(conn, "ops", "00112233445566778899aabbccddeeff", Utc::now())
            })
            .expect("lock released");
    }

    #[test]
    fn busy_errors_are_transient() {
        let busy = StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = encode_ts(DateTime::from_timestamp(1_700_000_000, 5_000).expect("ts"));
        let b = encode_ts(DateTime::from_timestamp(1_700_000_000, 120_000_000).expect("ts"));
        assert!(a < b);
        assert_eq!(a.len(), b.len());
    }
}
