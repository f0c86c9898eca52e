//! Database layer for the meshcore console.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. Every table holding peers, channels, threads,
//! messages and packet history is created through versioned migrations
//! managed by this crate.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: the console is a single-host process; WAL
//!   lets status readers run while the pump thread writes.
//! - **`r2d2` connection pool**: bounded connection reuse; the acquire
//!   timeout keeps a stalled writer from blocking the presentation tick.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, so the schema ships with the code that queries it.

mod migrations;
mod pool;

pub use migrations::{run_migrations, run_migrations_up_to, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
