//! Message persistence and delivery status transitions.
//!
//! Status changes are guarded in SQL: an UPDATE only matches rows whose
//! current status may move to the requested one, so a late or repeated
//! event can never regress a message.

use chrono::{DateTime, Utc};
use meshcore_types::{DeliveryStatus, Direction, Message};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{encode_ts, json_col, parse_col, ts_col, StoreError};

const MESSAGE_COLUMNS: &str = "message_id, thread_id, direction, sender_peer_id, sender_name,
    body, delivery_status, ack_code, path_hops, snr, rssi, created_at, status_updated_at";

/// Parameters for recording a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub thread_id: i64,
    pub direction: Direction,
    pub sender_peer_id: Option<String>,
    pub sender_name: Option<String>,
    pub body: String,
    pub delivery_status: DeliveryStatus,
    pub ack_code: Option<u32>,
    pub path_hops: Vec<String>,
    pub snr: Option<f32>,
    pub rssi: Option<i16>,
    pub created_at: DateTime<Utc>,
}

/// Result of [`insert_message`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Message),
    /// A message with this id already exists; it is returned unchanged.
    Duplicate(Message),
}

impl InsertOutcome {
    pub fn message(&self) -> &Message {
        match self {
            Self::Inserted(m) | Self::Duplicate(m) => m,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Appends a message to its thread unless its id was already recorded.
pub fn insert_message(conn: &Connection, new: &NewMessage) -> Result<InsertOutcome, StoreError> {
    let created = encode_ts(new.created_at);
    let sql = format!(
        "INSERT INTO messages (
            message_id, thread_id, direction, sender_peer_id, sender_name, body,
            delivery_status, ack_code, path_hops, snr, rssi, created_at, status_updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
        ON CONFLICT(message_id) DO NOTHING
        RETURNING {MESSAGE_COLUMNS}"
    );
    let inserted = conn
        .query_row(
            &sql,
            params![
                new.message_id,
                new.thread_id,
                new.direction.as_str(),
                new.sender_peer_id,
                new.sender_name,
                new.body,
                new.delivery_status.as_str(),
                new.ack_code,
                serde_json::to_string(&new.path_hops)?,
                new.snr,
                new.rssi,
                created,
            ],
            map_row_to_message,
        )
        .optional()?;

    match inserted {
        Some(message) => Ok(InsertOutcome::Inserted(message)),
        None => get_message(conn, &new.message_id).map(InsertOutcome::Duplicate),
    }
}

/// Retrieves a message by id.
pub fn get_message(conn: &Connection, message_id: &str) -> Result<Message, StoreError> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1");
    conn.query_row(&sql, [message_id], map_row_to_message)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(message_id.to_string()))
}

/// The last `limit` messages of a thread, oldest first.
pub fn list_thread_messages(
    conn: &Connection,
    thread_id: i64,
    limit: u32,
) -> Result<Vec<Message>, StoreError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM (
            SELECT * FROM messages WHERE thread_id = ?1 ORDER BY seq DESC LIMIT ?2
         ) ORDER BY seq ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![thread_id, limit], map_row_to_message)?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

/// Moves a message to `to` if its current status allows it.
///
/// Returns `None` when the message is missing or the transition is not
/// allowed from its current status.
pub fn transition_status(
    conn: &Connection,
    message_id: &str,
    to: DeliveryStatus,
    at: DateTime<Utc>,
) -> Result<Option<Message>, StoreError> {
    let Some(from) = allowed_sources(to) else {
        return Ok(None);
    };
    let sql = format!(
        "UPDATE messages SET delivery_status = ?2, status_updated_at = ?3
         WHERE message_id = ?1 AND delivery_status IN ({from})
         RETURNING {MESSAGE_COLUMNS}"
    );
    Ok(conn
        .query_row(
            &sql,
            params![message_id, to.as_str(), encode_ts(at)],
            map_row_to_message,
        )
        .optional()?)
}

/// Marks the newest undelivered outbound message carrying `ack_code` as
/// delivered.
pub fn deliver_by_ack(
    conn: &Connection,
    ack_code: u32,
    at: DateTime<Utc>,
) -> Result<Option<Message>, StoreError> {
    let sql = format!(
        "UPDATE messages SET delivery_status = 'delivered', status_updated_at = ?2
         WHERE seq = (
            SELECT seq FROM messages
            WHERE direction = 'outbound' AND ack_code = ?1
              AND delivery_status IN ('pending', 'unconfirmed')
            ORDER BY seq DESC LIMIT 1
         )
         RETURNING {MESSAGE_COLUMNS}"
    );
    Ok(conn
        .query_row(&sql, params![ack_code, encode_ts(at)], map_row_to_message)
        .optional()?)
}

/// Whether any outbound message has been pending since `cutoff`.
pub fn has_expired_pending(conn: &Connection, cutoff: DateTime<Utc>) -> Result<bool, StoreError> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM messages
         WHERE direction = 'outbound' AND delivery_status = 'pending' AND created_at <= ?1)",
        params![encode_ts(cutoff)],
        |row| row.get(0),
    )?)
}

/// Moves outbound messages still pending since `cutoff` to unconfirmed.
pub fn expire_pending(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    at: DateTime<Utc>,
) -> Result<Vec<Message>, StoreError> {
    let sql = format!(
        "UPDATE messages SET delivery_status = 'unconfirmed', status_updated_at = ?2
         WHERE direction = 'outbound' AND delivery_status = 'pending' AND created_at <= ?1
         RETURNING {MESSAGE_COLUMNS}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![encode_ts(cutoff), encode_ts(at)], map_row_to_message)?;
    let mut expired = Vec::new();
    for row in rows {
        expired.push(row?);
    }
    expired.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(expired)
}

/// Re-points sender references from one peer to another.
pub fn reassign_sender(conn: &Connection, from: &str, to: &str) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "UPDATE messages SET sender_peer_id = ?2 WHERE sender_peer_id = ?1",
        [from, to],
    )?)
}

/// Moves every message of one thread into another, keeping arrival order.
pub fn move_thread_messages(conn: &Connection, from: i64, to: i64) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "UPDATE messages SET thread_id = ?2 WHERE thread_id = ?1",
        [from, to],
    )?)
}

fn allowed_sources(to: DeliveryStatus) -> Option<String> {
    let from: Vec<String> = [
        DeliveryStatus::Received,
        DeliveryStatus::Pending,
        DeliveryStatus::Delivered,
        DeliveryStatus::Unconfirmed,
    ]
    .into_iter()
    .filter(|s| s.can_transition_to(to))
    .map(|s| format!("'{}'", s.as_str()))
    .collect();
    (!from.is_empty()).then(|| from.join(", "))
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        message_id: row.get(0)?,
        thread_id: row.get(1)?,
        direction: parse_col(row, 2)?,
        sender_peer_id: row.get(3)?,
        sender_name: row.get(4)?,
        body: row.get(5)?,
        delivery_status: parse_col(row, 6)?,
        ack_code: row.get(7)?,
        path_hops: json_col(row, 8)?,
        snr: row.get::<_, Option<f64>>(9)?.map(|v| v as f32),
        rssi: row.get(10)?,
        created_at: ts_col(row, 11)?,
        status_updated_at: ts_col(row, 12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;
    use crate::threads::ensure_channel_thread;
    use chrono::Duration;
    use meshcore_types::PUBLIC_CHANNEL_ID;

    fn outbound(conn: &Connection, id: &str, ack: u32, at: DateTime<Utc>) -> Message {
        let thread = ensure_channel_thread(conn, PUBLIC_CHANNEL_ID, at).expect("thread");
        let outcome = insert_message(
            conn,
            &NewMessage {
                message_id: id.to_string(),
                thread_id: thread.id,
                direction: Direction::Outbound,
                sender_peer_id: None,
                sender_name: Some("me".into()),
                body: "hello".into(),
                delivery_status: DeliveryStatus::Pending,
                ack_code: Some(ack),
                path_hops: Vec::new(),
                snr: None,
                rssi: None,
                created_at: at,
            },
        )
        .expect("insert");
        outcome.message().clone()
    }

    #[test]
    fn duplicate_ids_are_not_inserted_twice() {
        let conn = setup_db();
        let now = Utc::now();
        let first = outbound(&conn, "m1", 1, now);
        let thread = ensure_channel_thread(&conn, PUBLIC_CHANNEL_ID, now).expect("thread");

        let again = insert_message(
            &conn,
            &NewMessage {
                message_id: "m1".into(),
                thread_id: thread.id,
                direction: Direction::Inbound,
                sender_peer_id: None,
                sender_name: None,
                body: "different".into(),
                delivery_status: DeliveryStatus::Received,
                ack_code: None,
                path_hops: vec!["aa".into()],
                snr: Some(1.0),
                rssi: Some(-90),
                created_at: now,
            },
        )
        .expect("insert");

        assert!(again.is_duplicate());
        assert_eq!(again.message(), &first);
        assert_eq!(list_thread_messages(&conn, thread.id, 10).expect("list").len(), 1);
    }

    #[test]
    fn ack_delivers_pending_message() {
        let conn = setup_db();
        outbound(&conn, "m1", 0xabcd, Utc::now());

        let delivered = deliver_by_ack(&conn, 0xabcd, Utc::now())
            .expect("ack")
            .expect("message matched");
        assert_eq!(delivered.delivery_status, DeliveryStatus::Delivered);

        // A repeated ack finds nothing left to deliver.
        assert!(deliver_by_ack(&conn, 0xabcd, Utc::now()).expect("ack").is_none());
    }

    #[test]
    fn expiry_then_late_ack() {
        let conn = setup_db();
        let now = Utc::now();
        outbound(&conn, "old", 1, now - Duration::seconds(60));
        outbound(&conn, "fresh", 2, now);

        let expired = expire_pending(&conn, now - Duration::seconds(30), now).expect("expire");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message_id, "old");
        assert_eq!(expired[0].delivery_status, DeliveryStatus::Unconfirmed);
        assert_eq!(
            get_message(&conn, "fresh").expect("get").delivery_status,
            DeliveryStatus::Pending
        );

        let late = deliver_by_ack(&conn, 1, now).expect("ack").expect("matched");
        assert_eq!(late.message_id, "old");
        assert_eq!(late.delivery_status, DeliveryStatus::Delivered);
    }

    #[test]
    fn delivered_never_regresses() {
        let conn = setup_db();
        outbound(&conn, "m1", 9, Utc::now());
        transition_status(&conn, "m1", DeliveryStatus::Delivered, Utc::now())
            .expect("transition")
            .expect("allowed");

        for to in [DeliveryStatus::Unconfirmed, DeliveryStatus::Pending] {
            let result = transition_status(&conn, "m1", to, Utc::now()).expect("transition");
            assert!(result.is_none(), "delivered must not move to {to}");
        }
        let expired = expire_pending(&conn, Utc::now() + Duration::days(1), Utc::now()).expect("expire");
        assert!(expired.is_empty());
        assert_eq!(
            get_message(&conn, "m1").expect("get").delivery_status,
            DeliveryStatus::Delivered
        );
    }

    #[test]
    fn thread_listing_is_arrival_ordered() {
        let conn = setup_db();
        let now = Utc::now();
        // Later message carries an earlier timestamp; arrival order still wins.
        outbound(&conn, "first", 1, now);
        outbound(&conn, "second", 2, now - Duration::minutes(10));
        outbound(&conn, "third", 3, now);

        let thread = ensure_channel_thread(&conn, PUBLIC_CHANNEL_ID, now).expect("thread");
        let ids: Vec<String> = list_thread_messages(&conn, thread.id, 10)
            .expect("list")
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["first", "second", "third"]);

        let last_two: Vec<String> = list_thread_messages(&conn, thread.id, 2)
            .expect("list")
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(last_two, vec!["second", "third"]);
    }
}
