//! Typed domain events produced by the decoder.

use meshcore_types::{GeoPoint, NodeType, PublicKey, ShortId};
use serde::{Deserialize, Serialize};

use crate::packet::PayloadType;

/// Closed set of packet kinds the console understands.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Advert(Advert),
    DirectText(DirectText),
    GroupText(GroupText),
    Ack(Ack),
    PathReport(PathReport),
    Control(Control),
    Request(Request),
    Response(Response),
}

impl DomainEvent {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::Advert(_) => PayloadType::Advert,
            Self::DirectText(_) => PayloadType::DirectText,
            Self::GroupText(_) => PayloadType::GroupText,
            Self::Ack(_) => PayloadType::Ack,
            Self::PathReport(_) => PayloadType::Path,
            Self::Control(_) => PayloadType::Control,
            Self::Request(_) => PayloadType::Request,
            Self::Response(_) => PayloadType::Response,
        }
    }

    /// One-line description for the packet history.
    pub fn summary(&self) -> String {
        match self {
            Self::Advert(a) => match (&a.name, &a.public_key) {
                (Some(name), _) => format!("advert {name} ({})", a.node_type.label()),
                (None, Some(key)) => format!("advert {} ({})", key.short_id(), a.node_type.label()),
                (None, None) => format!("advert anonymous ({})", a.node_type.label()),
            },
            Self::DirectText(m) => format!("text {} -> {}", m.src, m.dest),
            Self::GroupText(m) => format!(
                "group text on {:02x} from {}",
                m.channel_hash,
                m.sender_name.as_deref().unwrap_or("?")
            ),
            Self::Ack(a) => format!("ack {:08x}", a.code),
            Self::PathReport(p) => format!("path {} -> {} via {} hops", p.src, p.dest, p.hops.len()),
            Self::Control(c) => match c {
                Control::DiscoverRequest { tag, .. } => format!("discover request {tag:08x}"),
                Control::DiscoverResponse { tag, .. } => format!("discover response {tag:08x}"),
                Control::Other { sub_type, .. } => format!("control {sub_type:02x}"),
            },
            Self::Request(r) => format!("request {} {} -> {}", r.kind.label(), r.src, r.dest),
            Self::Response(r) => format!(
                "response {:08x} {} -> {} ({} bytes)",
                r.tag,
                r.src,
                r.dest,
                r.data.len()
            ),
        }
    }
}

/// Node announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct Advert {
    /// `None` when the node advertised an all-zero key.
    pub public_key: Option<PublicKey>,
    pub timestamp: u32,
    pub node_type: NodeType,
    pub location: Option<GeoPoint>,
    pub feature1: Option<u16>,
    pub feature2: Option<u16>,
    pub name: Option<String>,
}

/// Direct (peer to peer) text message.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectText {
    pub dest: ShortId,
    pub src: ShortId,
    pub timestamp: u32,
    pub flags: u8,
    pub text: String,
}

impl DirectText {
    /// Retransmission counter kept in the upper six flag bits.
    pub fn attempt(&self) -> u8 {
        self.flags >> 2
    }
}

/// Group channel text. The sender is only named inside the text body.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupText {
    pub channel_hash: u8,
    pub timestamp: u32,
    pub flags: u8,
    pub sender_name: Option<String>,
    pub text: String,
}

/// Delivery acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub code: u32,
}

/// Returned route to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathReport {
    pub dest: ShortId,
    pub src: ShortId,
    pub hops: Vec<ShortId>,
}

/// What a request asks the addressed node for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Status,
    KeepAlive,
    /// Sensor readings, answered with a Cayenne LPP frame.
    Telemetry,
    Other(u8),
}

impl RequestKind {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Status => 0x01,
            Self::KeepAlive => 0x02,
            Self::Telemetry => 0x03,
            Self::Other(code) => code,
        }
    }

    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => Self::Status,
            0x02 => Self::KeepAlive,
            0x03 => Self::Telemetry,
            other => Self::Other(other),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::KeepAlive => "keep-alive",
            Self::Telemetry => "telemetry",
            Self::Other(_) => "other",
        }
    }
}

/// Peer-to-peer request. `timestamp` doubles as the tag the response
/// echoes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub dest: ShortId,
    pub src: ShortId,
    pub timestamp: u32,
    pub kind: RequestKind,
    pub data: Vec<u8>,
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub dest: ShortId,
    pub src: ShortId,
    pub tag: u32,
    pub data: Vec<u8>,
}

/// Control-plane packets (node discovery).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "snake_case")]
pub enum Control {
    DiscoverRequest {
        filter: u8,
        tag: u32,
    },
    DiscoverResponse {
        node_type: NodeType,
        snr: f32,
        tag: u32,
        /// Full 32-byte key or an 8-byte prefix.
        #[serde(with = "hex_bytes")]
        key_bytes: Vec<u8>,
    },
    Other {
        sub_type: u8,
        len: usize,
    },
}

impl Control {
    /// The responder's full key, when the response carried one.
    pub fn responder_key(&self) -> Option<PublicKey> {
        match self {
            Self::DiscoverResponse { key_bytes, .. } => {
                PublicKey::from_slice(key_bytes).filter(|k| !k.is_zero())
            }
            _ => None,
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
