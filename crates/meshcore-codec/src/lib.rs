//! Packet codec for meshcore radio traffic.
//!
//! Turns the raw packet records handed over by the radio driver into typed
//! [`DomainEvent`]s, and builds packets for transmission and for the
//! synthetic traffic generator.
//!
//! # Wire layout
//!
//! ```text
//! header u8     route (bits 0-1) | payload type (bits 2-5) | version (bits 6-7)
//! [u16, u16]    transport codes, transport routes only
//! path_len u8   followed by one short id per relay hop
//! payload       kind specific
//! crc32 u32 LE  over every preceding byte
//! ```
//!
//! Decoding is pure and total: every byte string yields either an event or
//! a [`DecodeError`], never a panic. The codec performs no identity lookups;
//! it only extracts the identifiers the packet carries.

mod builder;
mod decode;
mod event;
mod hash;
mod lpp;
mod packet;
mod reader;

pub use builder::PacketBuilder;
pub use decode::{decode, DecodeError, DecodeReason, DecodedPacket};
pub use event::{
    Ack, Advert, Control, DirectText, DomainEvent, GroupText, PathReport, Request, RequestKind,
    Response,
};
pub use hash::{ack_code, channel_hash, channel_hash_hex, checksum, packet_hash};
pub use lpp::{decode_lpp, LppError, LppFrame, LppReading, LppSensor, LppValue};
pub use packet::{PayloadType, RawPacket, RouteType, MIN_PACKET_LEN};
