//! Packet record and header enums.

use chrono::{DateTime, Utc};

/// Header byte plus path length plus checksum.
pub const MIN_PACKET_LEN: usize = 6;

/// Largest number of relay hops a packet can record.
pub const MAX_PATH_LEN: usize = 64;

/// A packet as delivered by the radio driver, with reception metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    pub bytes: Vec<u8>,
    pub snr: Option<f32>,
    pub rssi: Option<i16>,
    pub received_at: DateTime<Utc>,
}

impl RawPacket {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            snr: None,
            rssi: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_signal(mut self, snr: f32, rssi: i16) -> Self {
        self.snr = Some(snr);
        self.rssi = Some(rssi);
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Routing mode from the low two header bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouteType {
    TransportFlood = 0,
    Flood = 1,
    Direct = 2,
    TransportDirect = 3,
}

impl RouteType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::TransportFlood,
            1 => Self::Flood,
            2 => Self::Direct,
            _ => Self::TransportDirect,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Transport routes carry two extra 16-bit codes after the header.
    pub fn has_transport_codes(self) -> bool {
        matches!(self, Self::TransportFlood | Self::TransportDirect)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::TransportFlood => "transport_flood",
            Self::Flood => "flood",
            Self::Direct => "direct",
            Self::TransportDirect => "transport_direct",
        }
    }
}

/// Payload type from header bits 2-5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    Request = 0,
    Response = 1,
    DirectText = 2,
    Ack = 3,
    Advert = 4,
    GroupText = 5,
    GroupData = 6,
    AnonRequest = 7,
    Path = 8,
    Trace = 9,
    Multipart = 10,
    Control = 11,
    Raw = 15,
}

impl PayloadType {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::DirectText),
            3 => Some(Self::Ack),
            4 => Some(Self::Advert),
            5 => Some(Self::GroupText),
            6 => Some(Self::GroupData),
            7 => Some(Self::AnonRequest),
            8 => Some(Self::Path),
            9 => Some(Self::Trace),
            10 => Some(Self::Multipart),
            11 => Some(Self::Control),
            15 => Some(Self::Raw),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Request => "REQ",
            Self::Response => "RESPONSE",
            Self::DirectText => "TXT_MSG",
            Self::Ack => "ACK",
            Self::Advert => "ADVERT",
            Self::GroupText => "GRP_TXT",
            Self::GroupData => "GRP_DATA",
            Self::AnonRequest => "ANON_REQ",
            Self::Path => "PATH",
            Self::Trace => "TRACE",
            Self::Multipart => "MULTIPART",
            Self::Control => "CONTROL",
            Self::Raw => "RAW",
        }
    }
}

/// Builds a header byte. Version is always 0.
pub(crate) fn header_byte(route: RouteType, payload_type: u8) -> u8 {
    route.as_u8() | ((payload_type & 0x0F) << 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bits_round_trip() {
        let header = header_byte(RouteType::Direct, PayloadType::GroupText.as_u8());
        assert_eq!(RouteType::from_bits(header), RouteType::Direct);
        assert_eq!((header >> 2) & 0x0F, 5);
        assert_eq!(header >> 6, 0);
    }

    #[test]
    fn transport_routes() {
        assert!(RouteType::TransportFlood.has_transport_codes());
        assert!(RouteType::TransportDirect.has_transport_codes());
        assert!(!RouteType::Flood.has_transport_codes());
    }

    #[test]
    fn unassigned_payload_codes() {
        for code in 12..=14 {
            assert_eq!(PayloadType::from_u8(code), None);
        }
        assert_eq!(PayloadType::from_u8(15), Some(PayloadType::Raw));
    }
}
