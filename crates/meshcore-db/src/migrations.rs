//! Embedded SQL migration runner.
//!
//! Migrations are SQL files embedded at compile time. They run sequentially
//! on startup, tracked by the `_meshcore_migrations` table. Each migration
//! runs exactly once; if it has already been applied, it is skipped.
//!
//! Migrations only add tables, columns and indexes. Existing peer stable ids
//! and the `messages.seq` arrival order are never rewritten.

use rusqlite::Connection;
use thiserror::Error;

/// A single embedded migration.
struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. New migrations are appended here.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "000_init",
        sql: include_str!("migrations/000_init.sql"),
    },
    Migration {
        name: "001_packet_history",
        sql: include_str!("migrations/001_packet_history.sql"),
    },
    Migration {
        name: "002_message_indexes",
        sql: include_str!("migrations/002_message_indexes.sql"),
    },
    Migration {
        name: "003_peer_favorites",
        sql: include_str!("migrations/003_peer_favorites.sql"),
    },
];

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A SQL statement within a migration failed.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        /// The name of the migration that failed.
        name: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// Failed to query migration state.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),

    /// The requested target migration does not exist.
    #[error("unknown migration '{0}'")]
    UnknownMigration(String),
}

/// Runs all pending migrations against the given connection.
///
/// Migrations that have already been applied (tracked in
/// `_meshcore_migrations`) are skipped. New migrations are applied in order
/// and recorded.
///
/// # Errors
///
/// Returns `MigrationError` if any migration fails to execute or if the
/// migration tracking table cannot be queried.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    run_migrations_from_list(conn, MIGRATIONS)
}

/// Runs pending migrations up to and including `target`.
///
/// Used to stage a database at an older schema version, e.g. to check that
/// later migrations leave existing rows untouched.
pub fn run_migrations_up_to(conn: &Connection, target: &str) -> Result<usize, MigrationError> {
    let end = MIGRATIONS
        .iter()
        .position(|m| m.name == target)
        .ok_or_else(|| MigrationError::UnknownMigration(target.to_string()))?;
    run_migrations_from_list(conn, &MIGRATIONS[..=end])
}

fn run_migrations_from_list(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _meshcore_migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| MigrationError::ExecutionFailed {
        name: "_meshcore_migrations_bootstrap".to_string(),
        source: e,
    })?;

    let mut applied = 0;

    for migration in migrations {
        let already_applied: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _meshcore_migrations WHERE name = ?1",
                [migration.name],
                |row| row.get(0),
            )
            .map_err(MigrationError::StateQuery)?;

        if already_applied {
            tracing::debug!(
                migration = migration.name,
                "migration already applied, skipping"
            );
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");

        let exec_err = |e| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source: e,
        };

        let tx = conn.unchecked_transaction().map_err(exec_err)?;
        tx.execute_batch(migration.sql).map_err(exec_err)?;
        tx.execute(
            "INSERT INTO _meshcore_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(exec_err)?;
        tx.commit().map_err(exec_err)?;

        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    #[test]
    fn run_migrations_on_fresh_db() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, MIGRATIONS.len());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM _meshcore_migrations", [], |row| {
                row.get(0)
            })
            .expect("should query migration count");
        assert_eq!(count as usize, MIGRATIONS.len());

        for table in ["peers", "channels", "threads", "messages", "packets"] {
            assert!(table_exists(&conn, table), "{table} table should exist");
        }
    }

    #[test]
    fn run_migrations_idempotent() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");

        let first = run_migrations(&conn).expect("first run should succeed");
        assert_eq!(first, MIGRATIONS.len());

        let second = run_migrations(&conn).expect("second run should succeed");
        assert_eq!(second, 0, "no new migrations to apply");
    }

    #[test]
    fn staged_run_stops_at_target() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let applied = run_migrations_up_to(&conn, "000_init").expect("staged run");
        assert_eq!(applied, 1);
        assert!(table_exists(&conn, "peers"));
        assert!(!table_exists(&conn, "packets"));

        let rest = run_migrations(&conn).expect("remaining migrations");
        assert_eq!(rest, MIGRATIONS.len() - 1);
    }

    #[test]
    fn unknown_target_is_rejected() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let err = run_migrations_up_to(&conn, "999_missing").expect_err("should fail");
        assert!(matches!(err, MigrationError::UnknownMigration(name) if name == "999_missing"));
    }

    #[test]
    fn thread_must_reference_exactly_one_owner() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        run_migrations(&conn).expect("migrations should succeed");

        let neither = conn.execute(
            "INSERT INTO threads (channel_id, peer_id, created_at) VALUES (NULL, NULL, 'now')",
            [],
        );
        assert!(neither.is_err(), "thread without owner must be rejected");

        conn.execute(
            "INSERT INTO channels (channel_id, name, created_at, updated_at) VALUES ('c', 'c', 'now', 'now')",
            [],
        )
        .expect("insert channel");
        conn.execute(
            "INSERT INTO peers (stable_id, display_name, first_seen_at, last_seen_at) VALUES ('p', 'p', 'now', 'now')",
            [],
        )
        .expect("insert peer");
        let both = conn.execute(
            "INSERT INTO threads (channel_id, peer_id, created_at) VALUES ('c', 'p', 'now')",
            [],
        );
        assert!(both.is_err(), "thread with two owners must be rejected");
    }

    #[test]
    fn migration_side_effects_rollback_when_tracking_insert_fails() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let migrations = [Migration {
            name: "001_tracking_insert_conflict",
            sql: "
                CREATE TABLE rollback_marker (id INTEGER PRIMARY KEY);
                INSERT INTO _meshcore_migrations (name) VALUES ('001_tracking_insert_conflict');
            ",
        }];

        let err = run_migrations_from_list(&conn, &migrations)
            .expect_err("tracking insert conflict should fail migration");

        match err {
            MigrationError::ExecutionFailed { name, .. } => {
                assert_eq!(name, "001_tracking_insert_conflict")
            }
            other => panic!("unexpected error type: {other:?}"),
        }

        assert!(
            !table_exists(&conn, "rollback_marker"),
            "schema side effects should be rolled back when tracking insert fails"
        );
    }
}
