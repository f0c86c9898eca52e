//! Rolling history of decoded packets.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::{encode_ts, json_col, ts_col, StoreError};

/// Default number of packets kept.
pub const DEFAULT_MAX_PACKETS: u32 = 1000;

/// A packet as shown in the packet analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    pub id: i64,
    pub packet_hash: String,
    pub payload_type: u8,
    pub route_type: u8,
    pub hops: Vec<String>,
    pub snr: Option<f32>,
    pub rssi: Option<i16>,
    pub raw_hex: String,
    pub summary: String,
    pub received_at: DateTime<Utc>,
}

/// Parameters for recording a packet.
#[derive(Debug, Clone)]
pub struct NewPacket {
    pub packet_hash: String,
    pub payload_type: u8,
    pub route_type: u8,
    pub hops: Vec<String>,
    pub snr: Option<f32>,
    pub rssi: Option<i16>,
    pub raw: Vec<u8>,
    pub summary: String,
    pub received_at: DateTime<Utc>,
}

/// Records a packet and prunes the history to `keep` rows.
pub fn record_packet(conn: &Connection, packet: &NewPacket, keep: u32) -> Result<i64, StoreError> {
    let id: i64 = conn.query_row(
        "INSERT INTO packets (
            packet_hash, payload_type, route_type, hops, snr, rssi, raw_hex, summary, received_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        RETURNING id",
        params![
            packet.packet_hash,
            packet.payload_type,
            packet.route_type,
            serde_json::to_string(&packet.hops)?,
            packet.snr,
            packet.rssi,
            hex::encode(&packet.raw),
            packet.summary,
            encode_ts(packet.received_at),
        ],
        |row| row.get(0),
    )?;

    let pruned = conn.execute(
        "DELETE FROM packets WHERE id <= (
            SELECT id FROM packets ORDER BY id DESC LIMIT 1 OFFSET ?1
         )",
        [keep.max(1)],
    )?;
    if pruned > 0 {
        tracing::trace!(pruned, "pruned packet history");
    }
    Ok(id)
}

/// Most recent packets, newest first.
pub fn list_recent_packets(conn: &Connection, limit: u32) -> Result<Vec<PacketRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, packet_hash, payload_type, route_type, hops, snr, rssi, raw_hex, summary, received_at
         FROM packets ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], map_row_to_packet)?;
    let mut packets = Vec::new();
    for row in rows {
        packets.push(row?);
    }
    Ok(packets)
}

fn map_row_to_packet(row: &Row) -> rusqlite::Result<PacketRecord> {
    Ok(PacketRecord {
        id: row.get(0)?,
        packet_hash: row.get(1)?,
        payload_type: row.get(2)?,
        route_type: row.get(3)?,
        hops: json_col(row, 4)?,
        snr: row.get::<_, Option<f64>>(5)?.map(|v| v as f32),
        rssi: row.get(6)?,
        raw_hex: row.get(7)?,
        summary: row.get(8)?,
        received_at: ts_col(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;

    fn packet(n: u8) -> NewPacket {
        NewPacket {
            packet_hash: format!("{n:016X}"),
            payload_type: 4,
            route_type: 1,
            hops: vec![format!("{n:02x}")],
            snr: Some(5.5),
            rssi: Some(-70),
            raw: vec![n, n],
            summary: format!("packet {n}"),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn history_is_pruned_to_limit() {
        let conn = setup_db();
        for n in 0..10 {
            record_packet(&conn, &packet(n), 4).expect("record");
        }
        let recent = list_recent_packets(&conn, 100).expect("list");
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].summary, "packet 9");
        assert_eq!(recent[3].summary, "packet 6");
        assert_eq!(recent[0].raw_hex, "0909");
        assert_eq!(recent[0].hops, vec!["09"]);
    }
}
