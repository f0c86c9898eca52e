//! Conversation threads. Each belongs to exactly one channel or one peer;
//! the schema enforces it with a CHECK constraint.

use chrono::{DateTime, Utc};
use meshcore_types::{Thread, ThreadTarget};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{encode_ts, ts_col, StoreError};

const THREAD_COLUMNS: &str = "id, channel_id, peer_id, unread_count, created_at";

/// Returns the channel's thread, creating it on first use.
pub fn ensure_channel_thread(
    conn: &Connection,
    channel_id: &str,
    now: DateTime<Utc>,
) -> Result<Thread, StoreError> {
    conn.execute(
        "INSERT INTO threads (channel_id, created_at) VALUES (?1, ?2)
         ON CONFLICT(channel_id) DO NOTHING",
        params![channel_id, encode_ts(now)],
    )?;
    let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE channel_id = ?1");
    conn.query_row(&sql, [channel_id], map_row_to_thread)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(channel_id.to_string()))
}

/// Returns the direct-message thread with a peer, creating it on first use.
pub fn ensure_direct_thread(
    conn: &Connection,
    peer_id: &str,
    now: DateTime<Utc>,
) -> Result<Thread, StoreError> {
    conn.execute(
        "INSERT INTO threads (peer_id, created_at) VALUES (?1, ?2)
         ON CONFLICT(peer_id) DO NOTHING",
        params![peer_id, encode_ts(now)],
    )?;
    thread_for_peer(conn, peer_id)?.ok_or_else(|| StoreError::NotFound(peer_id.to_string()))
}

pub fn thread_for_peer(conn: &Connection, peer_id: &str) -> Result<Option<Thread>, StoreError> {
    let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE peer_id = ?1");
    Ok(conn.query_row(&sql, [peer_id], map_row_to_thread).optional()?)
}

pub fn get_thread(conn: &Connection, id: i64) -> Result<Thread, StoreError> {
    let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1");
    conn.query_row(&sql, [id], map_row_to_thread)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("thread {id}")))
}

/// Lists threads, most recent activity first.
pub fn list_threads(conn: &Connection) -> Result<Vec<Thread>, StoreError> {
    let sql = format!(
        "SELECT {THREAD_COLUMNS} FROM threads t
         ORDER BY COALESCE((SELECT MAX(seq) FROM messages m WHERE m.thread_id = t.id), 0) DESC,
                  id DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], map_row_to_thread)?;
    let mut threads = Vec::new();
    for row in rows {
        threads.push(row?);
    }
    Ok(threads)
}

pub fn add_unread(conn: &Connection, id: i64, count: u32) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE threads SET unread_count = unread_count + ?2 WHERE id = ?1",
        params![id, count],
    )?;
    Ok(())
}

pub fn mark_read(conn: &Connection, id: i64) -> Result<Thread, StoreError> {
    let count = conn.execute("UPDATE threads SET unread_count = 0 WHERE id = ?1", [id])?;
    if count == 0 {
        return Err(StoreError::NotFound(format!("thread {id}")));
    }
    get_thread(conn, id)
}

/// Hands a direct thread over to another peer.
pub fn reassign_peer(conn: &Connection, id: i64, peer_id: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE threads SET peer_id = ?2 WHERE id = ?1",
        params![id, peer_id],
    )?;
    Ok(())
}

/// Deletes a thread. Fails while it still holds messages.
pub fn delete_empty_thread(conn: &Connection, id: i64) -> Result<(), StoreError> {
    let count = conn.execute(
        "DELETE FROM threads WHERE id = ?1
         AND NOT EXISTS (SELECT 1 FROM messages WHERE thread_id = ?1)",
        [id],
    )?;
    if count == 0 {
        return Err(StoreError::InvalidInput(format!(
            "thread {id} is missing or not empty"
        )));
    }
    Ok(())
}

fn map_row_to_thread(row: &Row) -> rusqlite::Result<Thread> {
    let channel_id: Option<String> = row.get(1)?;
    let peer_id: Option<String> = row.get(2)?;
    let target = match (channel_id, peer_id) {
        (Some(channel), None) => ThreadTarget::Channel(channel),
        (None, Some(peer)) => ThreadTarget::Direct(peer),
        _ => {
            return Err(rusqlite::Error::InvalidColumnType(
                1,
                "channel_id".to_string(),
                rusqlite::types::Type::Null,
            ));
        }
    };
    Ok(Thread {
        id: row.get(0)?,
        target,
        unread_count: row.get(3)?,
        created_at: ts_col(row, 4)?,
    })
}
