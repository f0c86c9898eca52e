//! Peer records.

use chrono::{DateTime, Utc};
use meshcore_types::{rssi_to_signal_percent, GeoPoint, NodeType, Peer, PublicKey};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{encode_ts, json_col, ts_col, StoreError};

const PEER_COLUMNS: &str = "stable_id, public_key, short_id, display_name, node_type,
    is_provisional, signal_quality, rssi, snr, latitude, longitude, last_path,
    first_seen_at, last_seen_at, merged_into, is_favorite";

/// Parameters for creating a peer.
#[derive(Debug, Clone)]
pub struct NewPeer {
    pub stable_id: String,
    pub public_key: Option<PublicKey>,
    pub short_id: Option<String>,
    pub display_name: String,
    pub node_type: NodeType,
    pub seen_at: DateTime<Utc>,
}

/// Observed facts folded into an existing peer. `None` fields leave the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct PeerUpdate {
    pub display_name: Option<String>,
    pub node_type: Option<NodeType>,
    pub rssi: Option<i16>,
    pub snr: Option<f32>,
    pub location: Option<GeoPoint>,
    pub last_path: Option<Vec<String>>,
    pub seen_at: Option<DateTime<Utc>>,
}

/// Creates a peer. Peers without a public key are provisional.
pub fn insert_peer(conn: &Connection, new: &NewPeer) -> Result<Peer, StoreError> {
    let seen = encode_ts(new.seen_at);
    let sql = format!(
        "INSERT INTO peers (
            stable_id, public_key, short_id, display_name, node_type,
            is_provisional, first_seen_at, last_seen_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        RETURNING {PEER_COLUMNS}"
    );
    let peer = conn.query_row(
        &sql,
        params![
            new.stable_id,
            new.public_key.map(|k| k.to_hex()),
            new.short_id,
            new.display_name,
            new.node_type.as_u8(),
            new.public_key.is_none(),
            seen,
        ],
        map_row_to_peer,
    )?;
    Ok(peer)
}

/// Retrieves a peer by stable id.
pub fn get_peer(conn: &Connection, stable_id: &str) -> Result<Peer, StoreError> {
    let sql = format!("SELECT {PEER_COLUMNS} FROM peers WHERE stable_id = ?1");
    conn.query_row(&sql, [stable_id], map_row_to_peer)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(stable_id.to_string()))
}

pub fn find_by_public_key(conn: &Connection, key: &PublicKey) -> Result<Option<Peer>, StoreError> {
    let sql = format!("SELECT {PEER_COLUMNS} FROM peers WHERE public_key = ?1");
    Ok(conn
        .query_row(&sql, [key.to_hex()], map_row_to_peer)
        .optional()?)
}

/// Live peers with this short id, best match first: most recently seen,
/// ties broken by stable id.
pub fn candidates_by_short_id(conn: &Connection, short_id: &str) -> Result<Vec<Peer>, StoreError> {
    let sql = format!(
        "SELECT {PEER_COLUMNS} FROM peers
         WHERE short_id = ?1 AND merged_into IS NULL
         ORDER BY last_seen_at DESC, stable_id ASC"
    );
    collect(conn, &sql, [short_id])
}

/// Live peers with this display name, best match first.
pub fn candidates_by_name(conn: &Connection, name: &str) -> Result<Vec<Peer>, StoreError> {
    let sql = format!(
        "SELECT {PEER_COLUMNS} FROM peers
         WHERE display_name = ?1 AND merged_into IS NULL
         ORDER BY last_seen_at DESC, stable_id ASC"
    );
    collect(conn, &sql, [name])
}

/// Provisional peers that a full key with this short id could belong to:
/// same short id, or no short id yet and the same display name.
pub fn provisional_candidates(
    conn: &Connection,
    short_id: &str,
    name: Option<&str>,
) -> Result<Vec<Peer>, StoreError> {
    let sql = format!(
        "SELECT {PEER_COLUMNS} FROM peers
         WHERE is_provisional = 1 AND merged_into IS NULL
           AND (short_id = ?1 OR (short_id IS NULL AND display_name = ?2))
         ORDER BY last_seen_at DESC, stable_id ASC"
    );
    collect(conn, &sql, params![short_id, name])
}

/// Lists peers, most recently seen first. Merged records are skipped unless
/// `include_merged` is set.
pub fn list_peers(conn: &Connection, include_merged: bool) -> Result<Vec<Peer>, StoreError> {
    let sql = format!(
        "SELECT {PEER_COLUMNS} FROM peers
         WHERE ?1 OR merged_into IS NULL
         ORDER BY last_seen_at DESC, stable_id ASC"
    );
    collect(conn, &sql, [include_merged])
}

/// Applies observed facts in one UPDATE. `last_seen_at` only moves forward.
pub fn apply_update(
    conn: &Connection,
    stable_id: &str,
    update: &PeerUpdate,
) -> Result<Peer, StoreError> {
    let last_path = update
        .last_path
        .as_ref()
        .filter(|p| !p.is_empty())
        .map(serde_json::to_string)
        .transpose()?;
    let sql = format!(
        "UPDATE peers SET
            display_name = COALESCE(?2, display_name),
            node_type = COALESCE(?3, node_type),
            rssi = COALESCE(?4, rssi),
            signal_quality = COALESCE(?5, signal_quality),
            snr = COALESCE(?6, snr),
            latitude = COALESCE(?7, latitude),
            longitude = COALESCE(?8, longitude),
            last_path = COALESCE(?9, last_path),
            last_seen_at = MAX(last_seen_at, COALESCE(?10, last_seen_at))
         WHERE stable_id = ?1
         RETURNING {PEER_COLUMNS}"
    );
    conn.query_row(
        &sql,
        params![
            stable_id,
            update.display_name,
            update
                .node_type
                .filter(|t| *t != NodeType::Unknown)
                .map(NodeType::as_u8),
            update.rssi,
            update.rssi.map(rssi_to_signal_percent),
            update.snr,
            update.location.map(|l| l.latitude),
            update.location.map(|l| l.longitude),
            last_path,
            update.seen_at.map(encode_ts),
        ],
        map_row_to_peer,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(stable_id.to_string()))
}

/// Attaches a full key to a provisional peer, keeping its stable id.
pub fn promote(conn: &Connection, stable_id: &str, key: &PublicKey) -> Result<(), StoreError> {
    let count = conn.execute(
        "UPDATE peers SET public_key = ?2, short_id = ?3, is_provisional = 0
         WHERE stable_id = ?1 AND is_provisional = 1",
        params![stable_id, key.to_hex(), key.short_id().to_string()],
    )?;
    if count == 0 {
        return Err(StoreError::NotFound(stable_id.to_string()));
    }
    Ok(())
}

/// Pins or unpins a peer.
pub fn set_favorite(conn: &Connection, stable_id: &str, favorite: bool) -> Result<Peer, StoreError> {
    let sql = format!(
        "UPDATE peers SET is_favorite = ?2 WHERE stable_id = ?1 RETURNING {PEER_COLUMNS}"
    );
    conn.query_row(&sql, params![stable_id, favorite], map_row_to_peer)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(stable_id.to_string()))
}

/// Pinned peers that were not merged away, by name.
pub fn list_favorites(conn: &Connection) -> Result<Vec<Peer>, StoreError> {
    let sql = format!(
        "SELECT {PEER_COLUMNS} FROM peers
         WHERE is_favorite = 1 AND merged_into IS NULL
         ORDER BY display_name COLLATE NOCASE, stable_id"
    );
    collect(conn, &sql, [])
}

/// Records that `from` was folded into `into`.
pub fn mark_merged(conn: &Connection, from: &str, into: &str) -> Result<(), StoreError> {
    let count = conn.execute(
        "UPDATE peers SET merged_into = ?2 WHERE stable_id = ?1 AND merged_into IS NULL",
        [from, into],
    )?;
    if count == 0 {
        return Err(StoreError::NotFound(from.to_string()));
    }
    Ok(())
}

fn collect<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Peer>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map_row_to_peer)?;
    let mut peers = Vec::new();
    for row in rows {
        peers.push(row?);
    }
    Ok(peers)
}

fn map_row_to_peer(row: &Row) -> rusqlite::Result<Peer> {
    let public_key = row
        .get::<_, Option<String>>(1)?
        .map(|hex| {
            hex.parse::<PublicKey>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        })
        .transpose()?;

    let latitude: Option<f64> = row.get(9)?;
    let longitude: Option<f64> = row.get(10)?;

    Ok(Peer {
        stable_id: row.get(0)?,
        public_key,
        short_id: row.get(2)?,
        display_name: row.get(3)?,
        node_type: NodeType::from_u8(row.get(4)?),
        is_provisional: row.get(5)?,
        signal_quality: row.get(6)?,
        rssi: row.get(7)?,
        snr: row.get::<_, Option<f64>>(8)?.map(|v| v as f32),
        location: latitude
            .zip(longitude)
            .map(|(latitude, longitude)| GeoPoint {
                latitude,
                longitude,
            }),
        last_path: json_col(row, 11)?,
        first_seen_at: ts_col(row, 12)?,
        last_seen_at: ts_col(row, 13)?,
        merged_into: row.get(14)?,
        is_favorite: row.get(15)?,
    })
}
