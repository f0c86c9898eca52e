//! Packet encoder.
//!
//! Used for outbound sends and by the synthetic traffic generator, so mock
//! packets travel through exactly the decoder real ones do.

use meshcore_types::PublicKey;

use crate::decode::{CONTROL_DISCOVER_REQ, CONTROL_DISCOVER_RESP};
use crate::event::{Advert, Control, DirectText, GroupText, PathReport, Request, Response};
use crate::hash::checksum;
use crate::packet::{header_byte, PayloadType, RouteType, MAX_PATH_LEN};

/// Builds complete packets (header, path, payload, checksum).
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    route: RouteType,
    transport_codes: Option<[u16; 2]>,
    path: Vec<u8>,
}

impl PacketBuilder {
    /// Flood-routed packet with an empty path.
    pub fn flood() -> Self {
        Self {
            route: RouteType::Flood,
            transport_codes: None,
            path: Vec::new(),
        }
    }

    /// Direct-routed packet along `path` (one short id per hop).
    pub fn direct(path: Vec<u8>) -> Self {
        Self {
            route: RouteType::Direct,
            transport_codes: None,
            path,
        }
    }

    /// Records relay hops, as a repeater would while flooding.
    pub fn with_path(mut self, path: Vec<u8>) -> Self {
        self.path = path;
        self
    }

    /// Switches to the transport variant of the current route.
    pub fn with_transport_codes(mut self, codes: [u16; 2]) -> Self {
        self.route = match self.route {
            RouteType::Direct | RouteType::TransportDirect => RouteType::TransportDirect,
            RouteType::Flood | RouteType::TransportFlood => RouteType::TransportFlood,
        };
        self.transport_codes = Some(codes);
        self
    }

    /// Frames an arbitrary payload. Paths longer than the wire limit are cut.
    pub fn encode(&self, payload_type: u8, payload: &[u8]) -> Vec<u8> {
        let path = &self.path[..self.path.len().min(MAX_PATH_LEN)];
        let mut out = Vec::with_capacity(payload.len() + path.len() + 10);
        out.push(header_byte(self.route, payload_type));
        if self.route.has_transport_codes() {
            let [a, b] = self.transport_codes.unwrap_or_default();
            out.extend_from_slice(&a.to_le_bytes());
            out.extend_from_slice(&b.to_le_bytes());
        }
        out.push(path.len() as u8);
        out.extend_from_slice(path);
        out.extend_from_slice(payload);
        let crc = checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn advert(&self, advert: &Advert) -> Vec<u8> {
        let key = advert.public_key.unwrap_or(PublicKey::from_bytes([0; 32]));
        let mut payload = Vec::with_capacity(128);
        payload.extend_from_slice(key.as_bytes());
        payload.extend_from_slice(&advert.timestamp.to_le_bytes());
        payload.extend_from_slice(&[0u8; 64]);

        let mut flags = advert.node_type.as_u8() & 0x0F;
        if advert.location.is_some() {
            flags |= 0x10;
        }
        if advert.feature1.is_some() {
            flags |= 0x20;
        }
        if advert.feature2.is_some() {
            flags |= 0x40;
        }
        if advert.name.is_some() {
            flags |= 0x80;
        }
        payload.push(flags);

        if let Some(loc) = advert.location {
            payload.extend_from_slice(&((loc.latitude * 1e6).round() as i32).to_le_bytes());
            payload.extend_from_slice(&((loc.longitude * 1e6).round() as i32).to_le_bytes());
        }
        if let Some(f) = advert.feature1 {
            payload.extend_from_slice(&f.to_le_bytes());
        }
        if let Some(f) = advert.feature2 {
            payload.extend_from_slice(&f.to_le_bytes());
        }
        if let Some(name) = &advert.name {
            payload.extend_from_slice(name.as_bytes());
        }
        self.encode(PayloadType::Advert.as_u8(), &payload)
    }

    pub fn direct_text(&self, msg: &DirectText) -> Vec<u8> {
        let mut payload = vec![msg.dest.as_u8(), msg.src.as_u8()];
        payload.extend_from_slice(&msg.timestamp.to_le_bytes());
        payload.push(msg.flags);
        payload.extend_from_slice(msg.text.as_bytes());
        self.encode(PayloadType::DirectText.as_u8(), &payload)
    }

    pub fn group_text(&self, msg: &GroupText) -> Vec<u8> {
        let mut payload = vec![msg.channel_hash];
        payload.extend_from_slice(&msg.timestamp.to_le_bytes());
        payload.push(msg.flags);
        if let Some(name) = &msg.sender_name {
            payload.extend_from_slice(name.as_bytes());
            payload.extend_from_slice(b": ");
        }
        payload.extend_from_slice(msg.text.as_bytes());
        self.encode(PayloadType::GroupText.as_u8(), &payload)
    }

    pub fn ack(&self, code: u32) -> Vec<u8> {
        self.encode(PayloadType::Ack.as_u8(), &code.to_le_bytes())
    }

    pub fn path_report(&self, report: &PathReport) -> Vec<u8> {
        let hops = &report.hops[..report.hops.len().min(MAX_PATH_LEN)];
        let mut payload = vec![report.dest.as_u8(), report.src.as_u8(), hops.len() as u8];
        payload.extend(hops.iter().map(|h| h.as_u8()));
        self.encode(PayloadType::Path.as_u8(), &payload)
    }

    pub fn request(&self, req: &Request) -> Vec<u8> {
        let mut payload = vec![req.dest.as_u8(), req.src.as_u8()];
        payload.extend_from_slice(&req.timestamp.to_le_bytes());
        payload.push(req.kind.as_u8());
        payload.extend_from_slice(&req.data);
        self.encode(PayloadType::Request.as_u8(), &payload)
    }

    pub fn response(&self, resp: &Response) -> Vec<u8> {
        let mut payload = vec![resp.dest.as_u8(), resp.src.as_u8()];
        payload.extend_from_slice(&resp.tag.to_le_bytes());
        payload.extend_from_slice(&resp.data);
        self.encode(PayloadType::Response.as_u8(), &payload)
    }

    pub fn control(&self, control: &Control) -> Vec<u8> {
        let payload = match control {
            Control::DiscoverRequest { filter, tag } => {
                let mut p = vec![CONTROL_DISCOVER_REQ, *filter];
                p.extend_from_slice(&tag.to_le_bytes());
                p
            }
            Control::DiscoverResponse {
                node_type,
                snr,
                tag,
                key_bytes,
            } => {
                let mut p = vec![
                    CONTROL_DISCOVER_RESP | (node_type.as_u8() & 0x0F),
                    ((snr * 4.0).round().clamp(-128.0, 127.0) as i8) as u8,
                ];
                p.extend_from_slice(&tag.to_le_bytes());
                p.extend_from_slice(key_bytes);
                p
            }
            Control::Other { sub_type, len } => {
                let mut p = vec![*sub_type & 0xF0];
                p.resize((*len).max(1), 0);
                p
            }
        };
        self.encode(PayloadType::Control.as_u8(), &payload)
    }
}
