//! Event kinds, payloads and the records consumers read from the log.

use chrono::{DateTime, Utc};
use meshcore_codec::{Control, DecodedPacket, LppReading, RawPacket};
use meshcore_types::{Message, NodeType, Peer};
use serde::{Deserialize, Serialize};

/// Closed set of event kinds in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A node announced itself.
    Advert,
    /// Direct text addressed to this node.
    DirectMessage,
    /// Group text on any channel.
    ChannelMessage,
    Ack,
    /// A returned route to a peer.
    PathUpdate,
    /// Discovery requests and responses.
    Control,
    /// Sensor readings answering one of our telemetry requests.
    Telemetry,
    /// Decoded traffic this node does not act on.
    Packet,
    /// An outbound message was handed to the radio.
    MessageSent,
    DeliveryStatusChanged,
    Connected,
    /// The link dropped; the bridge is reconnecting.
    ConnectionLost,
    ConnectionRestored,
    /// Stopped on request.
    Disconnected,
    /// The adapter reported a non-fatal fault.
    RadioError,
}

impl EventKind {
    /// Wire name, as used in JSON output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Advert => "advert",
            Self::DirectMessage => "direct_message",
            Self::ChannelMessage => "channel_message",
            Self::Ack => "ack",
            Self::PathUpdate => "path_update",
            Self::Control => "control",
            Self::Telemetry => "telemetry",
            Self::Packet => "packet",
            Self::MessageSent => "message_sent",
            Self::DeliveryStatusChanged => "delivery_status_changed",
            Self::Connected => "connected",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionRestored => "connection_restored",
            Self::Disconnected => "disconnected",
            Self::RadioError => "radio_error",
        }
    }

    /// Connection indicator events.
    pub fn is_link(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::ConnectionLost | Self::ConnectionRestored | Self::Disconnected
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "advert" => Ok(Self::Advert),
            "direct_message" => Ok(Self::DirectMessage),
            "channel_message" => Ok(Self::ChannelMessage),
            "ack" => Ok(Self::Ack),
            "path_update" => Ok(Self::PathUpdate),
            "control" => Ok(Self::Control),
            "telemetry" => Ok(Self::Telemetry),
            "packet" => Ok(Self::Packet),
            "message_sent" => Ok(Self::MessageSent),
            "delivery_status_changed" => Ok(Self::DeliveryStatusChanged),
            "connected" => Ok(Self::Connected),
            "connection_lost" => Ok(Self::ConnectionLost),
            "connection_restored" => Ok(Self::ConnectionRestored),
            "disconnected" => Ok(Self::Disconnected),
            "radio_error" => Ok(Self::RadioError),
            _ => Err(ParseEventKindError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown event kind string.
#[derive(Debug, Clone)]
pub struct ParseEventKindError(pub String);

impl std::fmt::Display for ParseEventKindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event kind: {}", self.0)
    }
}

impl std::error::Error for ParseEventKindError {}

/// Reception metadata of the packet behind an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketMeta {
    pub packet_hash: String,
    /// Route label (`flood`, `direct`, ...).
    pub route: String,
    /// Relay hops (short id hex) in travel order.
    pub hops: Vec<String>,
    pub snr: Option<f32>,
    pub rssi: Option<i16>,
    pub received_at: DateTime<Utc>,
}

impl PacketMeta {
    pub fn new(raw: &RawPacket, decoded: &DecodedPacket) -> Self {
        Self {
            packet_hash: decoded.packet_hash.clone(),
            route: decoded.route.label().to_string(),
            hops: decoded.hops.iter().map(ToString::to_string).collect(),
            snr: raw.snr,
            rssi: raw.rssi,
            received_at: raw.received_at,
        }
    }
}

/// The parts of a peer a consumer needs to label an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub stable_id: String,
    pub display_name: String,
    pub short_id: Option<String>,
    pub is_provisional: bool,
}

impl From<&Peer> for PeerRef {
    fn from(peer: &Peer) -> Self {
        Self {
            stable_id: peer.stable_id.clone(),
            display_name: peer.display_name.clone(),
            short_id: peer.short_id.clone(),
            is_provisional: peer.is_provisional,
        }
    }
}

/// What moved a message to its new delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCause {
    /// An acknowledgement carrying the message's ack code arrived.
    Ack,
    /// A repeater rebroadcast our channel message.
    Echo,
    /// Nothing confirmed the message within the send timeout.
    Timeout,
}

/// Structured payload of each event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    // ── Radio traffic ────────────────────────────────────────────────
    /// A node announced itself.
    Advert {
        /// Resolved peer; absent for our own advert and for anonymous ones.
        peer: Option<PeerRef>,
        name: Option<String>,
        node_type: NodeType,
        /// Our own advert, echoed back by a repeater.
        is_self: bool,
        /// The advert created a new peer record.
        created: bool,
        /// A provisional peer received its public key.
        promoted: bool,
        /// Provisional peer folded into `peer`.
        merged_from: Option<String>,
        /// Channel ensured for a room server.
        room_channel: Option<String>,
        packet: PacketMeta,
    },

    /// A direct text addressed to this node.
    DirectMessage {
        message: Message,
        sender: PeerRef,
        /// The same packet arrived before over another path.
        duplicate: bool,
        packet: PacketMeta,
    },

    /// A group text on a channel.
    ChannelMessage {
        message: Message,
        channel_id: String,
        /// Absent when the text named no sender or named us.
        sender: Option<PeerRef>,
        duplicate: bool,
        packet: PacketMeta,
    },

    /// An acknowledgement. `matched` is set when it confirmed one of our
    /// messages.
    Ack {
        code: u32,
        matched: bool,
        packet: PacketMeta,
    },

    /// A returned route to a peer.
    PathUpdate {
        peer: PeerRef,
        hops: Vec<String>,
        packet: PacketMeta,
    },

    /// Discovery traffic.
    Control {
        control: Control,
        responder: Option<PeerRef>,
        packet: PacketMeta,
    },

    /// A telemetry response addressed to this node.
    Telemetry {
        peer: PeerRef,
        /// Echo of the request's tag.
        tag: u32,
        readings: Vec<LppReading>,
        /// Set when the frame was not valid LPP; `readings` is then empty.
        error: Option<String>,
        packet: PacketMeta,
    },

    /// Decoded traffic for another node, or requests we do not answer.
    Packet {
        summary: String,
        packet: PacketMeta,
    },

    // ── Local actions ────────────────────────────────────────────────
    /// An outbound message was handed to the radio.
    MessageSent {
        message: Message,
    },

    /// An outbound message left `pending`, or a late ack confirmed an
    /// unconfirmed one.
    DeliveryStatusChanged {
        message: Message,
        cause: StatusCause,
    },

    // ── Link ─────────────────────────────────────────────────────────
    Connected,

    ConnectionLost {
        reason: String,
    },

    ConnectionRestored {
        /// Reconnect attempts it took.
        attempts: u32,
    },

    Disconnected,

    RadioError {
        message: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Advert { .. } => EventKind::Advert,
            Self::DirectMessage { .. } => EventKind::DirectMessage,
            Self::ChannelMessage { .. } => EventKind::ChannelMessage,
            Self::Ack { .. } => EventKind::Ack,
            Self::PathUpdate { .. } => EventKind::PathUpdate,
            Self::Control { .. } => EventKind::Control,
            Self::Telemetry { .. } => EventKind::Telemetry,
            Self::Packet { .. } => EventKind::Packet,
            Self::MessageSent { .. } => EventKind::MessageSent,
            Self::DeliveryStatusChanged { .. } => EventKind::DeliveryStatusChanged,
            Self::Connected => EventKind::Connected,
            Self::ConnectionLost { .. } => EventKind::ConnectionLost,
            Self::ConnectionRestored { .. } => EventKind::ConnectionRestored,
            Self::Disconnected => EventKind::Disconnected,
            Self::RadioError { .. } => EventKind::RadioError,
        }
    }

    /// The message this event carries, if any.
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::DirectMessage { message, .. }
            | Self::ChannelMessage { message, .. }
            | Self::MessageSent { message }
            | Self::DeliveryStatusChanged { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// One entry of the event log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Strictly increasing, never reused.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: EventPayload,
}

/// A consumer's position in the log: the id of the last event it has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    /// Before the first event.
    pub const START: Cursor = Cursor(0);
}

impl From<&Event> for Cursor {
    fn from(event: &Event) -> Self {
        Cursor(event.id)
    }
}
