//! Group channels.
//!
//! A channel is created the first time it is referenced: imported with its
//! secret, announced by a room server, or named by an inbound group packet's
//! hash. Channels are renamed in place; removing one takes its thread and
//! messages with it. The public channel always stays.

use chrono::{DateTime, Utc};
use meshcore_codec::{channel_hash, channel_hash_hex};
use meshcore_types::{Channel, PUBLIC_CHANNEL_ID, PUBLIC_CHANNEL_SECRET};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{encode_ts, ts_col, StoreError};

const CHANNEL_COLUMNS: &str =
    "channel_id, name, channel_hash, secret, joined, created_at, updated_at";

/// Strips a leading `#` and lowercases.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_start_matches('#').trim().to_lowercase()
}

/// Makes sure the public channel exists and is joined.
pub fn ensure_public_channel(conn: &Connection, now: DateTime<Utc>) -> Result<Channel, StoreError> {
    let hash = channel_hash_hex(PUBLIC_CHANNEL_SECRET).map(|h| format!("{h:02x}"));
    let ts = encode_ts(now);
    conn.execute(
        "INSERT OR IGNORE INTO channels
            (channel_id, name, channel_hash, secret, joined, created_at, updated_at)
         VALUES (?1, ?1, ?2, ?3, 1, ?4, ?4)",
        params![PUBLIC_CHANNEL_ID, hash, PUBLIC_CHANNEL_SECRET, ts],
    )?;
    get_channel(conn, PUBLIC_CHANNEL_ID)
}

/// Imports a channel secret and joins the channel.
///
/// An existing channel with the same name gets the new secret. A channel
/// previously seen only by its hash is renamed in place. Otherwise a new
/// channel is created with the name as its id.
pub fn import_channel(
    conn: &Connection,
    name: &str,
    secret_hex: &str,
    now: DateTime<Utc>,
) -> Result<Channel, StoreError> {
    let name = normalize_name(name);
    if name.is_empty() {
        return Err(StoreError::InvalidInput("channel name is empty".into()));
    }
    let secret = secret_hex.trim().to_lowercase();
    let secret_bytes = hex::decode(&secret)
        .map_err(|e| StoreError::InvalidInput(format!("channel secret is not hex: {e}")))?;
    if secret_bytes.is_empty() {
        return Err(StoreError::InvalidInput("channel secret is empty".into()));
    }
    let hash = format!("{:02x}", channel_hash(&secret_bytes));
    let ts = encode_ts(now);

    if let Some(existing) = find_channel_by_name(conn, &name)? {
        conn.execute(
            "UPDATE channels SET secret = ?2, channel_hash = ?3, joined = 1, updated_at = ?4
             WHERE channel_id = ?1",
            params![existing.channel_id, secret, hash, ts],
        )?;
        return get_channel(conn, &existing.channel_id);
    }

    let discovered: Option<String> = conn
        .query_row(
            "SELECT channel_id FROM channels
             WHERE channel_hash = ?1 AND secret IS NULL
             ORDER BY created_at ASC, channel_id ASC LIMIT 1",
            [&hash],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(channel_id) = discovered {
        tracing::info!(channel_id = %channel_id, name = %name, "renaming channel discovered by hash");
        conn.execute(
            "UPDATE channels SET name = ?2, secret = ?3, joined = 1, updated_at = ?4
             WHERE channel_id = ?1",
            params![channel_id, name, secret, ts],
        )?;
        return get_channel(conn, &channel_id);
    }

    let sql = format!(
        "INSERT INTO channels (channel_id, name, channel_hash, secret, joined, created_at, updated_at)
         VALUES (?1, ?1, ?2, ?3, 1, ?4, ?4)
         RETURNING {CHANNEL_COLUMNS}"
    );
    Ok(conn.query_row(&sql, params![name, hash, secret, ts], map_row_to_channel)?)
}

/// The channel that group packets with this hash belong to, creating an
/// `unknown-xx` placeholder for hashes we hold no secret for.
///
/// When several channels share a hash, joined channels win, then the oldest.
pub fn channel_for_hash(
    conn: &Connection,
    hash: u8,
    now: DateTime<Utc>,
) -> Result<Channel, StoreError> {
    let hash_hex = format!("{hash:02x}");
    let sql = format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels WHERE channel_hash = ?1
         ORDER BY joined DESC, created_at ASC, channel_id ASC LIMIT 1"
    );
    if let Some(channel) = conn
        .query_row(&sql, [&hash_hex], map_row_to_channel)
        .optional()?
    {
        return Ok(channel);
    }

    let channel_id = format!("unknown-{hash_hex}");
    tracing::debug!(channel_id = %channel_id, "creating channel for unknown hash");
    let sql = format!(
        "INSERT INTO channels (channel_id, name, channel_hash, joined, created_at, updated_at)
         VALUES (?1, ?1, ?2, 0, ?3, ?3)
         RETURNING {CHANNEL_COLUMNS}"
    );
    Ok(conn.query_row(
        &sql,
        params![channel_id, hash_hex, encode_ts(now)],
        map_row_to_channel,
    )?)
}

/// Channel announced by a room server advert. Not joined until imported.
pub fn ensure_room_channel(
    conn: &Connection,
    room_name: &str,
    room_peer_id: &str,
    now: DateTime<Utc>,
) -> Result<Channel, StoreError> {
    let prefix: String = room_peer_id.chars().take(8).collect();
    let channel_id = format!("room-{prefix}");
    if let Some(existing) = get_channel(conn, &channel_id).map(Some).or_else(not_found_to_none)? {
        return Ok(existing);
    }

    let wanted = normalize_name(room_name);
    let name = if wanted.is_empty() || find_channel_by_name(conn, &wanted)?.is_some() {
        channel_id.clone()
    } else {
        wanted
    };
    let sql = format!(
        "INSERT INTO channels (channel_id, name, joined, created_at, updated_at)
         VALUES (?1, ?2, 0, ?3, ?3)
         RETURNING {CHANNEL_COLUMNS}"
    );
    Ok(conn.query_row(
        &sql,
        params![channel_id, name, encode_ts(now)],
        map_row_to_channel,
    )?)
}

/// Retrieves a channel by id.
pub fn get_channel(conn: &Connection, channel_id: &str) -> Result<Channel, StoreError> {
    let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE channel_id = ?1");
    conn.query_row(&sql, [channel_id], map_row_to_channel)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(channel_id.to_string()))
}

/// Case-insensitive lookup; accepts `#name`.
pub fn find_channel_by_name(conn: &Connection, name: &str) -> Result<Option<Channel>, StoreError> {
    let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE name = ?1 COLLATE NOCASE");
    Ok(conn
        .query_row(&sql, [normalize_name(name)], map_row_to_channel)
        .optional()?)
}

/// Lists all channels, joined first, then by name.
pub fn list_channels(conn: &Connection) -> Result<Vec<Channel>, StoreError> {
    let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY joined DESC, name ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], map_row_to_channel)?;
    let mut channels = Vec::new();
    for row in rows {
        channels.push(row?);
    }
    Ok(channels)
}

pub fn rename_channel(
    conn: &Connection,
    channel_id: &str,
    new_name: &str,
    now: DateTime<Utc>,
) -> Result<Channel, StoreError> {
    let name = normalize_name(new_name);
    if name.is_empty() {
        return Err(StoreError::InvalidInput("channel name is empty".into()));
    }
    let count = conn.execute(
        "UPDATE channels SET name = ?2, updated_at = ?3 WHERE channel_id = ?1",
        params![channel_id, name, encode_ts(now)],
    )?;
    if count == 0 {
        return Err(StoreError::NotFound(channel_id.to_string()));
    }
    get_channel(conn, channel_id)
}

/// Sets the membership marker. The public channel cannot be left.
pub fn set_joined(
    conn: &Connection,
    channel_id: &str,
    joined: bool,
    now: DateTime<Utc>,
) -> Result<Channel, StoreError> {
    if channel_id == PUBLIC_CHANNEL_ID && !joined {
        return Err(StoreError::InvalidInput("the public channel cannot be left".into()));
    }
    let count = conn.execute(
        "UPDATE channels SET joined = ?2, updated_at = ?3 WHERE channel_id = ?1",
        params![channel_id, joined, encode_ts(now)],
    )?;
    if count == 0 {
        return Err(StoreError::NotFound(channel_id.to_string()));
    }
    get_channel(conn, channel_id)
}

/// Deletes a channel together with its thread and messages. Returns how
/// many messages were deleted.
pub fn remove_channel(conn: &Connection, channel_id: &str) -> Result<usize, StoreError> {
    if channel_id == PUBLIC_CHANNEL_ID {
        return Err(StoreError::InvalidInput("the public channel cannot be removed".into()));
    }
    let removed_messages = conn.execute(
        "DELETE FROM messages
         WHERE thread_id IN (SELECT id FROM threads WHERE channel_id = ?1)",
        [channel_id],
    )?;
    conn.execute("DELETE FROM threads WHERE channel_id = ?1", [channel_id])?;
    if conn.execute("DELETE FROM channels WHERE channel_id = ?1", [channel_id])? == 0 {
        return Err(StoreError::NotFound(channel_id.to_string()));
    }
    Ok(removed_messages)
}

fn not_found_to_none(err: StoreError) -> Result<Option<Channel>, StoreError> {
    match err {
        StoreError::NotFound(_) => Ok(None),
        other => Err(other),
    }
}

fn map_row_to_channel(row: &Row) -> rusqlite::Result<Channel> {
    Ok(Channel {
        channel_id: row.get(0)?,
        name: row.get(1)?,
        channel_hash: row.get(2)?,
        secret: row.get(3)?,
        joined: row.get(4)?,
        created_at: ts_col(row, 5)?,
        updated_at: ts_col(row, 6)?,
    })
}
