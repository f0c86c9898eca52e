//! Shared types and constants for the meshcore console.
//!
//! This crate holds the domain records every other crate passes around:
//! peers, channels, threads and messages, plus node identity types and the
//! signal helpers used when a packet's reception metadata is folded into a
//! peer record.
//!
//! It has no I/O. Persistence lives in `meshcore-store`, wire decoding in
//! `meshcore-codec`.

mod identity;
mod model;
mod signal;

pub use identity::{KeyParseError, PublicKey, ShortId};
pub use model::{
    Channel, DeliveryStatus, Destination, Direction, GeoPoint, Message, Peer, Thread,
    ThreadTarget, UnknownVariant,
};
pub use signal::{rssi_to_signal_percent, SignalQuality};

use serde::{Deserialize, Serialize};

/// Identifier of the always-present public channel.
pub const PUBLIC_CHANNEL_ID: &str = "public";

/// Well-known secret shared by every node for the public channel.
pub const PUBLIC_CHANNEL_SECRET: &str = "8b3387e9c5cdea6ac9e5edbaa115cd72";

/// Largest outbound text body, in bytes.
pub const MAX_TEXT_BYTES: usize = 160;

/// Role a node announces in its advert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum NodeType {
    /// Advert carried no role.
    #[default]
    Unknown = 0,
    /// Chat client (a person).
    Chat = 1,
    /// Store-and-forward repeater.
    Repeater = 2,
    /// Room server.
    Room = 3,
    /// Telemetry sensor.
    Sensor = 4,
}

impl NodeType {
    /// Returns the numeric code for this node type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts the low nibble of an advert flags byte.
    ///
    /// Unrecognized codes map to [`NodeType::Unknown`].
    pub fn from_u8(code: u8) -> Self {
        match code & 0x0F {
            1 => Self::Chat,
            2 => Self::Repeater,
            3 => Self::Room,
            4 => Self::Sensor,
            _ => Self::Unknown,
        }
    }

    /// Returns the lowercase label for this node type.
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Chat => "chat",
            Self::Repeater => "repeater",
            Self::Room => "room",
            Self::Sensor => "sensor",
        }
    }

    /// Repeaters and room servers relay traffic for others.
    pub fn is_relay(self) -> bool {
        matches!(self, Self::Repeater | Self::Room)
    }
}
