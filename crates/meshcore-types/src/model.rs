//! Durable domain records reconciled from radio traffic.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::PublicKey;
use crate::NodeType;

/// A string did not name any variant of the target enum.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Latitude/longitude in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A node known to this console.
///
/// `stable_id` is assigned on first sight and never changes. Peers first
/// heard with a full key use the key's hex form; peers first heard by short
/// id or name get a generated UUID and stay `is_provisional` until a full
/// key arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub stable_id: String,
    pub public_key: Option<PublicKey>,
    /// Hex form of the key's first byte, when known.
    pub short_id: Option<String>,
    pub display_name: String,
    pub node_type: NodeType,
    pub is_provisional: bool,
    /// Pinned by the operator.
    #[serde(default)]
    pub is_favorite: bool,
    /// Reception strength as a 0-100 percentage.
    pub signal_quality: Option<u8>,
    pub rssi: Option<i16>,
    pub snr: Option<f32>,
    pub location: Option<GeoPoint>,
    /// Relay hops (short id hex) of the most recent route to this peer.
    pub last_path: Vec<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Set when this provisional record was folded into a confirmed peer.
    pub merged_into: Option<String>,
}

impl Peer {
    pub fn is_repeater(&self) -> bool {
        self.node_type.is_relay()
    }
}

/// A group channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub name: String,
    /// One-byte channel hash (hex) carried by group packets.
    pub channel_hash: Option<String>,
    /// Shared secret (hex); absent for channels only seen by hash.
    pub secret: Option<String>,
    /// Membership marker: the user has joined or imported this channel.
    pub joined: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    /// Hashtag form shown to users, e.g. `#public`.
    pub fn hashtag(&self) -> String {
        format!("#{}", self.name)
    }
}

/// Owner of a conversation thread: exactly one channel or one peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ThreadTarget {
    Channel(String),
    Direct(String),
}

/// An ordered conversation. Messages are listed by arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub target: ThreadTarget,
    pub unread_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Destination named by a user on the command line or in a compose box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `#name`: a channel by name.
    Channel(String),
    /// A full public key (64 hex chars).
    Key(PublicKey),
    /// `@name`, a bare name, or a peer stable id.
    Peer(String),
}

impl Destination {
    /// Parses user input into a destination.
    ///
    /// Returns `None` for empty input.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if let Some(name) = input.strip_prefix('#') {
            let name = name.trim();
            return (!name.is_empty()).then(|| Self::Channel(name.to_lowercase()));
        }
        if let Some(name) = input.strip_prefix('@') {
            let name = name.trim();
            return (!name.is_empty()).then(|| Self::Peer(name.to_string()));
        }
        if input.is_empty() {
            return None;
        }
        if input.len() == PublicKey::LEN * 2 {
            if let Ok(key) = input.parse::<PublicKey>() {
                return Some(Self::Key(key));
            }
        }
        Some(Self::Peer(input.to_string()))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(name) => write!(f, "#{name}"),
            Self::Key(key) => write!(f, "{key}"),
            Self::Peer(name) => write!(f, "@{name}"),
        }
    }
}

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(UnknownVariant {
                kind: "direction",
                value: other.to_string(),
            }),
        }
    }
}

/// Delivery state of a message.
///
/// Outbound messages start `Pending`. An acknowledgement moves them to
/// `Delivered`; silence past the send timeout moves them to `Unconfirmed`.
/// A late acknowledgement may still promote `Unconfirmed` to `Delivered`.
/// Inbound messages are `Received` and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Received,
    Pending,
    Delivered,
    Unconfirmed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Unconfirmed => "unconfirmed",
        }
    }

    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Received | Self::Delivered)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Delivered)
                | (Self::Pending, Self::Unconfirmed)
                | (Self::Unconfirmed, Self::Delivered)
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "unconfirmed" => Ok(Self::Unconfirmed),
            other => Err(UnknownVariant {
                kind: "delivery status",
                value: other.to_string(),
            }),
        }
    }
}

/// A chat message in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Packet hash. A repeater echo of an outbound group text carries the
    /// same hash as the original.
    pub message_id: String,
    pub thread_id: i64,
    pub direction: Direction,
    /// Resolved sender; `None` for outbound messages or unresolved senders.
    pub sender_peer_id: Option<String>,
    /// Name as written by the sender (group texts carry a name prefix).
    pub sender_name: Option<String>,
    pub body: String,
    pub delivery_status: DeliveryStatus,
    pub ack_code: Option<u32>,
    /// Relay hops (short id hex) the packet travelled.
    pub path_hops: Vec<String>,
    pub snr: Option<f32>,
    pub rssi: Option<i16>,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
}
