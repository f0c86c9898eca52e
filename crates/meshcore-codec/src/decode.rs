//! Raw packet record to domain event.

use std::fmt;

use meshcore_types::{GeoPoint, NodeType, PublicKey, ShortId};
use thiserror::Error;

use crate::event::{
    Ack, Advert, Control, DirectText, DomainEvent, GroupText, PathReport, Request, RequestKind,
    Response,
};
use crate::hash::{checksum, packet_hash};
use crate::packet::{PayloadType, RawPacket, RouteType, MAX_PATH_LEN, MIN_PACKET_LEN};
use crate::reader::Reader;

const ADVERT_FLAG_LOCATION: u8 = 0x10;
const ADVERT_FLAG_FEATURE1: u8 = 0x20;
const ADVERT_FLAG_FEATURE2: u8 = 0x40;
const ADVERT_FLAG_NAME: u8 = 0x80;

pub(crate) const CONTROL_DISCOVER_REQ: u8 = 0x80;
pub(crate) const CONTROL_DISCOVER_RESP: u8 = 0x90;

const SIGNATURE_LEN: usize = 64;
const MAX_SENDER_NAME_LEN: usize = 32;

/// Why a packet could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeReason {
    /// Unsupported version or payload type.
    UnknownKind,
    /// A field ran past the end of the packet.
    Truncated,
    /// The CRC32 trailer does not match the contents.
    ChecksumMismatch,
}

impl DecodeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownKind => "unknown_kind",
            Self::Truncated => "truncated",
            Self::ChecksumMismatch => "checksum_mismatch",
        }
    }
}

impl fmt::Display for DecodeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A packet the codec rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot decode {len}-byte packet: {reason}")]
pub struct DecodeError {
    pub len: usize,
    pub reason: DecodeReason,
}

/// A decoded packet: the domain event plus routing envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub route: RouteType,
    pub transport_codes: Option<[u16; 2]>,
    /// Relay hops in travel order.
    pub hops: Vec<ShortId>,
    pub packet_hash: String,
    pub event: DomainEvent,
}

/// Decodes one packet record.
///
/// Total over all inputs. Reception metadata (SNR, RSSI, time) stays on the
/// record; only `bytes` is inspected.
pub fn decode(raw: &RawPacket) -> Result<DecodedPacket, DecodeError> {
    decode_bytes(&raw.bytes)
}

pub(crate) fn decode_bytes(bytes: &[u8]) -> Result<DecodedPacket, DecodeError> {
    let len = bytes.len();
    let fail = |reason| DecodeError { len, reason };

    if len < MIN_PACKET_LEN {
        return Err(fail(DecodeReason::Truncated));
    }

    let (body, trailer) = bytes.split_at(len - 4);
    let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if checksum(body) != expected {
        return Err(fail(DecodeReason::ChecksumMismatch));
    }

    let mut r = Reader::new(body);
    let header = r.u8().ok_or(fail(DecodeReason::Truncated))?;
    if header >> 6 != 0 {
        return Err(fail(DecodeReason::UnknownKind));
    }
    let route = RouteType::from_bits(header);
    let type_code = (header >> 2) & 0x0F;

    let transport_codes = if route.has_transport_codes() {
        let a = r.u16_le().ok_or(fail(DecodeReason::Truncated))?;
        let b = r.u16_le().ok_or(fail(DecodeReason::Truncated))?;
        Some([a, b])
    } else {
        None
    };

    let path_len = usize::from(r.u8().ok_or(fail(DecodeReason::Truncated))?);
    if path_len > MAX_PATH_LEN {
        return Err(fail(DecodeReason::Truncated));
    }
    let hops = r
        .take(path_len)
        .ok_or(fail(DecodeReason::Truncated))?
        .iter()
        .map(|b| ShortId(*b))
        .collect();

    let payload = r.rest();
    let event = match PayloadType::from_u8(type_code) {
        Some(PayloadType::Advert) => decode_advert(payload).map(DomainEvent::Advert),
        Some(PayloadType::DirectText) => decode_direct_text(payload).map(DomainEvent::DirectText),
        Some(PayloadType::GroupText) => decode_group_text(payload).map(DomainEvent::GroupText),
        Some(PayloadType::Ack) => decode_ack(payload).map(DomainEvent::Ack),
        Some(PayloadType::Path) => decode_path(payload).map(DomainEvent::PathReport),
        Some(PayloadType::Control) => decode_control(payload).map(DomainEvent::Control),
        Some(PayloadType::Request) => decode_request(payload).map(DomainEvent::Request),
        Some(PayloadType::Response) => decode_response(payload).map(DomainEvent::Response),
        _ => return Err(fail(DecodeReason::UnknownKind)),
    }
    .ok_or(fail(DecodeReason::Truncated))?;

    Ok(DecodedPacket {
        route,
        transport_codes,
        hops,
        packet_hash: packet_hash(type_code, payload),
        event,
    })
}

/// UTF-8 with lossy substitution; trailing NUL padding is dropped.
fn decode_text(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn decode_advert(payload: &[u8]) -> Option<Advert> {
    let mut r = Reader::new(payload);
    let key = PublicKey::from_slice(r.take(PublicKey::LEN)?)?;
    let timestamp = r.u32_le()?;
    r.take(SIGNATURE_LEN)?;

    // Appdata is optional; an advert may end right after the signature.
    let flags = if r.remaining() > 0 { r.u8()? } else { 0 };

    let location = if flags & ADVERT_FLAG_LOCATION != 0 {
        let lat = r.i32_le()?;
        let lon = r.i32_le()?;
        (lat != 0 || lon != 0).then(|| GeoPoint {
            latitude: f64::from(lat) / 1e6,
            longitude: f64::from(lon) / 1e6,
        })
    } else {
        None
    };
    let feature1 = if flags & ADVERT_FLAG_FEATURE1 != 0 {
        Some(r.u16_le()?)
    } else {
        None
    };
    let feature2 = if flags & ADVERT_FLAG_FEATURE2 != 0 {
        Some(r.u16_le()?)
    } else {
        None
    };
    let name = if flags & ADVERT_FLAG_NAME != 0 {
        Some(decode_text(r.rest()).trim().to_string()).filter(|n| !n.is_empty())
    } else {
        None
    };

    Some(Advert {
        public_key: (!key.is_zero()).then_some(key),
        timestamp,
        node_type: NodeType::from_u8(flags),
        location,
        feature1,
        feature2,
        name,
    })
}

fn decode_direct_text(payload: &[u8]) -> Option<DirectText> {
    let mut r = Reader::new(payload);
    let dest = ShortId(r.u8()?);
    let src = ShortId(r.u8()?);
    let timestamp = r.u32_le()?;
    let flags = r.u8()?;
    Some(DirectText {
        dest,
        src,
        timestamp,
        flags,
        text: decode_text(r.rest()),
    })
}

fn decode_group_text(payload: &[u8]) -> Option<GroupText> {
    let mut r = Reader::new(payload);
    let channel_hash = r.u8()?;
    let timestamp = r.u32_le()?;
    let flags = r.u8()?;
    let full = decode_text(r.rest());
    let (sender_name, text) = split_sender(&full);
    Some(GroupText {
        channel_hash,
        timestamp,
        flags,
        sender_name,
        text,
    })
}

/// Splits `"Name: body"`. Mention markup such as `@[Bob]` is left in the body.
fn split_sender(full: &str) -> (Option<String>, String) {
    match full.split_once(": ") {
        Some((name, body))
            if !name.trim().is_empty()
                && name.len() <= MAX_SENDER_NAME_LEN
                && !name.contains('\n') =>
        {
            (Some(name.trim().to_string()), body.to_string())
        }
        _ => (None, full.to_string()),
    }
}

fn decode_ack(payload: &[u8]) -> Option<Ack> {
    Reader::new(payload).u32_le().map(|code| Ack { code })
}

fn decode_path(payload: &[u8]) -> Option<PathReport> {
    let mut r = Reader::new(payload);
    let dest = ShortId(r.u8()?);
    let src = ShortId(r.u8()?);
    let path_len = usize::from(r.u8()?);
    let hops = r.take(path_len)?.iter().map(|b| ShortId(*b)).collect();
    Some(PathReport { dest, src, hops })
}

fn decode_request(payload: &[u8]) -> Option<Request> {
    let mut r = Reader::new(payload);
    let dest = ShortId(r.u8()?);
    let src = ShortId(r.u8()?);
    let timestamp = r.u32_le()?;
    let kind = RequestKind::from_u8(r.u8()?);
    Some(Request {
        dest,
        src,
        timestamp,
        kind,
        data: r.rest().to_vec(),
    })
}

fn decode_response(payload: &[u8]) -> Option<Response> {
    let mut r = Reader::new(payload);
    let dest = ShortId(r.u8()?);
    let src = ShortId(r.u8()?);
    let tag = r.u32_le()?;
    Some(Response {
        dest,
        src,
        tag,
        data: r.rest().to_vec(),
    })
}

fn decode_control(payload: &[u8]) -> Option<Control> {
    let mut r = Reader::new(payload);
    let flags = r.u8()?;
    match flags & 0xF0 {
        CONTROL_DISCOVER_REQ => {
            let filter = r.u8()?;
            let tag = r.u32_le()?;
            Some(Control::DiscoverRequest { filter, tag })
        }
        CONTROL_DISCOVER_RESP => {
            let snr = f32::from(r.i8()?) / 4.0;
            let tag = r.u32_le()?;
            let key_bytes = r.rest();
            if key_bytes.len() < 8 {
                return None;
            }
            Some(Control::DiscoverResponse {
                node_type: NodeType::from_u8(flags),
                snr,
                tag,
                key_bytes: key_bytes.to_vec(),
            })
        }
        sub_type => Some(Control::Other {
            sub_type,
            len: payload.len(),
        }),
    }
}
