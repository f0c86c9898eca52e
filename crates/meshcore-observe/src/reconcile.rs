//! Folds one decoded packet into the store.
//!
//! Runs inside the caller's transaction: either every mutation below lands
//! together with the packet history row, or none do.

use chrono::{DateTime, Utc};
use meshcore_codec::{
    decode_lpp, Advert, Control, DecodedPacket, DirectText, DomainEvent, GroupText, LppValue,
    PathReport, RawPacket, Response,
};
use meshcore_store::messages::{self, InsertOutcome, NewMessage};
use meshcore_store::packets::{self, NewPacket};
use meshcore_store::{channels, threads, Evidence, NodeResolver, SenderIdentifier, StoreError};
use meshcore_types::{DeliveryStatus, Direction, GeoPoint, NodeType, PublicKey};
use rusqlite::Connection;

use crate::event::{EventPayload, PacketMeta, PeerRef, StatusCause};

/// Who "we" are while reconciling.
#[derive(Debug, Clone)]
pub(crate) struct LocalNode {
    pub key: PublicKey,
    pub name: String,
    pub max_packets: u32,
}

pub(crate) fn reconcile_packet(
    conn: &Connection,
    local: &LocalNode,
    raw: &RawPacket,
    decoded: &DecodedPacket,
) -> Result<Vec<EventPayload>, StoreError> {
    let meta = PacketMeta::new(raw, decoded);
    packets::record_packet(
        conn,
        &NewPacket {
            packet_hash: decoded.packet_hash.clone(),
            payload_type: decoded.event.payload_type().as_u8(),
            route_type: decoded.route.as_u8(),
            hops: meta.hops.clone(),
            snr: raw.snr,
            rssi: raw.rssi,
            raw: raw.bytes.clone(),
            summary: decoded.event.summary(),
            received_at: raw.received_at,
        },
        local.max_packets,
    )?;

    let cx = Reconcile {
        conn,
        local,
        raw,
        decoded,
        meta,
    };
    match &decoded.event {
        DomainEvent::Advert(advert) => cx.advert(advert),
        DomainEvent::DirectText(msg) => cx.direct_text(msg),
        DomainEvent::GroupText(msg) => cx.group_text(msg),
        DomainEvent::Ack(ack) => cx.ack(ack.code),
        DomainEvent::PathReport(report) => cx.path_report(report),
        DomainEvent::Control(control) => cx.control(control),
        DomainEvent::Response(resp) => cx.response(resp),
        DomainEvent::Request(_) => cx.overheard(),
    }
}

struct Reconcile<'a> {
    conn: &'a Connection,
    local: &'a LocalNode,
    raw: &'a RawPacket,
    decoded: &'a DecodedPacket,
    meta: PacketMeta,
}

impl Reconcile<'_> {
    fn seen_at(&self) -> DateTime<Utc> {
        self.raw.received_at
    }

    /// Signal readings describe the sender only when nothing relayed the
    /// packet.
    fn evidence(&self) -> Evidence {
        let mut evidence = Evidence::seen(self.seen_at());
        if self.decoded.hops.is_empty() {
            evidence.rssi = self.raw.rssi;
            evidence.snr = self.raw.snr;
        }
        evidence
    }

    fn overheard(self) -> Result<Vec<EventPayload>, StoreError> {
        Ok(vec![EventPayload::Packet {
            summary: self.decoded.event.summary(),
            packet: self.meta,
        }])
    }

    fn advert(self, advert: &Advert) -> Result<Vec<EventPayload>, StoreError> {
        let mut event = EventPayload::Advert {
            peer: None,
            name: advert.name.clone(),
            node_type: advert.node_type,
            is_self: false,
            created: false,
            promoted: false,
            merged_from: None,
            room_channel: None,
            packet: self.meta.clone(),
        };
        let id = match (advert.public_key, &advert.name) {
            (Some(key), _) if key == self.local.key => {
                if let EventPayload::Advert { is_self, .. } = &mut event {
                    *is_self = true;
                }
                return Ok(vec![event]);
            }
            (Some(key), _) => SenderIdentifier::PublicKey(key),
            (None, Some(name)) => SenderIdentifier::Name(name.clone()),
            (None, None) => return Ok(vec![event]),
        };

        let mut evidence = self.evidence();
        evidence.public_key = advert.public_key;
        evidence.display_name = advert.name.clone();
        evidence.node_type = Some(advert.node_type);
        evidence.location = advert
            .location
            .filter(|p| p.latitude != 0.0 || p.longitude != 0.0);
        evidence.path = self.decoded.hops.clone();
        let resolution = NodeResolver::new(self.conn).resolve(&id, &evidence)?;

        let room = if advert.node_type == NodeType::Room {
            let name = advert
                .name
                .as_deref()
                .unwrap_or(&resolution.peer.display_name);
            Some(
                channels::ensure_room_channel(
                    self.conn,
                    name,
                    &resolution.peer.stable_id,
                    self.seen_at(),
                )?
                .channel_id,
            )
        } else {
            None
        };

        if let EventPayload::Advert {
            peer,
            created,
            promoted,
            merged_from,
            room_channel,
            ..
        } = &mut event
        {
            *peer = Some(PeerRef::from(&resolution.peer));
            *created = resolution.created;
            *promoted = resolution.promoted;
            *merged_from = resolution.merged_from;
            *room_channel = room;
        }
        Ok(vec![event])
    }

    fn direct_text(self, msg: &DirectText) -> Result<Vec<EventPayload>, StoreError> {
        if msg.dest != self.local.key.short_id() {
            return self.overheard();
        }
        let resolution =
            NodeResolver::new(self.conn).resolve(&SenderIdentifier::ShortId(msg.src), &self.evidence())?;
        let sender = resolution.peer;
        let thread = threads::ensure_direct_thread(self.conn, &sender.stable_id, self.seen_at())?;
        let outcome = self.insert_inbound(
            thread.id,
            Some(sender.stable_id.clone()),
            Some(sender.display_name.clone()),
            &msg.text,
        )?;
        Ok(vec![EventPayload::DirectMessage {
            duplicate: outcome.is_duplicate(),
            message: outcome.message().clone(),
            sender: PeerRef::from(&sender),
            packet: self.meta,
        }])
    }

    fn group_text(self, msg: &GroupText) -> Result<Vec<EventPayload>, StoreError> {
        let channel = channels::channel_for_hash(self.conn, msg.channel_hash, self.seen_at())?;
        let thread = threads::ensure_channel_thread(self.conn, &channel.channel_id, self.seen_at())?;

        let sender = match msg.sender_name.as_deref() {
            Some(name) if name != self.local.name => {
                let resolution = NodeResolver::new(self.conn)
                    .resolve(&SenderIdentifier::Name(name.to_string()), &self.evidence())?;
                Some(resolution.peer)
            }
            _ => None,
        };
        let outcome = self.insert_inbound(
            thread.id,
            sender.as_ref().map(|p| p.stable_id.clone()),
            msg.sender_name.clone(),
            &msg.text,
        )?;

        let mut events = vec![EventPayload::ChannelMessage {
            duplicate: outcome.is_duplicate(),
            message: outcome.message().clone(),
            channel_id: channel.channel_id,
            sender: sender.as_ref().map(PeerRef::from),
            packet: self.meta.clone(),
        }];
        // A rebroadcast of our own send is the only confirmation a channel
        // message gets.
        if let InsertOutcome::Duplicate(existing) = &outcome {
            if existing.direction == Direction::Outbound {
                if let Some(message) = messages::transition_status(
                    self.conn,
                    &existing.message_id,
                    DeliveryStatus::Delivered,
                    self.seen_at(),
                )? {
                    events.push(EventPayload::DeliveryStatusChanged {
                        message,
                        cause: StatusCause::Echo,
                    });
                }
            }
        }
        Ok(events)
    }

    fn ack(self, code: u32) -> Result<Vec<EventPayload>, StoreError> {
        let delivered = messages::deliver_by_ack(self.conn, code, self.seen_at())?;
        let mut events = vec![EventPayload::Ack {
            code,
            matched: delivered.is_some(),
            packet: self.meta,
        }];
        if let Some(message) = delivered {
            events.push(EventPayload::DeliveryStatusChanged {
                message,
                cause: StatusCause::Ack,
            });
        }
        Ok(events)
    }

    fn path_report(self, report: &PathReport) -> Result<Vec<EventPayload>, StoreError> {
        if report.dest != self.local.key.short_id() {
            return self.overheard();
        }
        let mut evidence = self.evidence();
        evidence.path = report.hops.clone();
        let resolution =
            NodeResolver::new(self.conn).resolve(&SenderIdentifier::ShortId(report.src), &evidence)?;
        Ok(vec![EventPayload::PathUpdate {
            peer: PeerRef::from(&resolution.peer),
            hops: report.hops.iter().map(ToString::to_string).collect(),
            packet: self.meta,
        }])
    }

    fn control(self, control: &Control) -> Result<Vec<EventPayload>, StoreError> {
        let responder = match (control, control.responder_key()) {
            (Control::DiscoverResponse { node_type, .. }, Some(key)) if key != self.local.key => {
                let mut evidence = self.evidence();
                evidence.public_key = Some(key);
                evidence.node_type = Some(*node_type);
                let resolution =
                    NodeResolver::new(self.conn).resolve(&SenderIdentifier::PublicKey(key), &evidence)?;
                Some(PeerRef::from(&resolution.peer))
            }
            _ => None,
        };
        Ok(vec![EventPayload::Control {
            control: control.clone(),
            responder,
            packet: self.meta,
        }])
    }

    fn response(self, resp: &Response) -> Result<Vec<EventPayload>, StoreError> {
        if resp.dest != self.local.key.short_id() {
            return self.overheard();
        }
        let (readings, error) = match decode_lpp(&resp.data) {
            Ok(readings) => (readings, None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };

        let mut evidence = self.evidence();
        evidence.location = readings.iter().find_map(|r| match r.value {
            LppValue::Location {
                latitude,
                longitude,
                ..
            } if latitude != 0.0 || longitude != 0.0 => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        });
        let resolution =
            NodeResolver::new(self.conn).resolve(&SenderIdentifier::ShortId(resp.src), &evidence)?;
        Ok(vec![EventPayload::Telemetry {
            peer: PeerRef::from(&resolution.peer),
            tag: resp.tag,
            readings,
            error,
            packet: self.meta,
        }])
    }

    /// Records an inbound message keyed by packet hash; the first copy
    /// bumps the thread's unread count.
    fn insert_inbound(
        &self,
        thread_id: i64,
        sender_peer_id: Option<String>,
        sender_name: Option<String>,
        text: &str,
    ) -> Result<InsertOutcome, StoreError> {
        let outcome = messages::insert_message(
            self.conn,
            &NewMessage {
                message_id: self.decoded.packet_hash.clone(),
                thread_id,
                direction: Direction::Inbound,
                sender_peer_id,
                sender_name,
                body: text.to_string(),
                delivery_status: DeliveryStatus::Received,
                ack_code: None,
                path_hops: self.meta.hops.clone(),
                snr: self.raw.snr,
                rssi: self.raw.rssi,
                created_at: self.seen_at(),
            },
        )?;
        if !outcome.is_duplicate() {
            threads::add_unread(self.conn, thread_id, 1)?;
        }
        Ok(outcome)
    }
}
