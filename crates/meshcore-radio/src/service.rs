//! The service facade: adapter lifecycle, outbound sends and the
//! non-blocking event drain.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use meshcore_codec::{
    ack_code, decode, Advert, DirectText, GroupText, PacketBuilder, RawPacket, Request, RequestKind,
};
use meshcore_store::messages::{self, NewMessage};
use meshcore_store::{channels, peers, threads, Evidence, NodeResolver, SenderIdentifier, Store, StoreError};
use meshcore_types::{
    Channel, DeliveryStatus, Destination, Direction, GeoPoint, Message, NodeType, Peer, PublicKey,
    ShortId, Thread, MAX_TEXT_BYTES,
};
use serde::Serialize;

use crate::adapter::{AdapterKind, RadioAdapter};
use crate::bridge::{BridgeSettings, EventBridge, SharedAdapter};
use crate::error::{ServiceError, TransportError};
use crate::queue::{BridgeEvent, ConnectionEvent, QueuedEvent};

/// Service behavior that does not depend on the adapter.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Name used as the sender prefix on channel messages and in adverts.
    pub node_name: String,
    /// How long an outbound message may stay pending before it is marked
    /// unconfirmed.
    pub send_timeout: Duration,
    /// Upper bound on waiting for adapter threads during disconnect.
    pub disconnect_settle: Duration,
    /// Position included in adverts; `None` advertises no location.
    pub location: Option<GeoPoint>,
    pub bridge: BridgeSettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            node_name: "meshcore-console".into(),
            send_timeout: Duration::from_secs(30),
            disconnect_settle: Duration::from_secs(2),
            location: None,
            bridge: BridgeSettings::default(),
        }
    }
}

/// Snapshot for connection indicators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub connected: bool,
    /// The link dropped and the supervisor is retrying.
    pub reconnecting: bool,
    pub adapter: AdapterKind,
    pub node_name: String,
    /// This node's public key, hex encoded.
    pub self_key: String,
    /// Events waiting for the next `poll_events`.
    pub queued: usize,
    /// Events shed by the full hand-off queue since startup.
    pub dropped: u64,
}

enum Route {
    Channel {
        channel: Channel,
        hash: u8,
    },
    Direct {
        peer: Option<Peer>,
        key: Option<PublicKey>,
        dest: ShortId,
        path: Vec<u8>,
    },
}

/// Owns the adapter, the bridge and the store handle.
pub struct MeshcoreService {
    store: Store,
    adapter: SharedAdapter,
    bridge: EventBridge,
    settings: ServiceSettings,
    kind: AdapterKind,
    self_key: PublicKey,
    last_request_tag: u32,
}

impl MeshcoreService {
    /// Wraps `adapter` without touching the radio; call
    /// [`connect`](Self::connect) to bring the link up.
    pub fn new(adapter: Box<dyn RadioAdapter>, store: Store, settings: ServiceSettings) -> Self {
        let kind = adapter.kind();
        let self_key = adapter.self_key();
        Self {
            store,
            adapter: Arc::new(Mutex::new(adapter)),
            bridge: EventBridge::new(settings.bridge),
            settings,
            kind,
            self_key,
            last_request_tag: 0,
        }
    }

    fn adapter(&self) -> MutexGuard<'_, Box<dyn RadioAdapter>> {
        self.adapter.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Brings the link up.
    ///
    /// A failed connect is returned, and the bridge keeps retrying in the
    /// background; a later `connection_restored` event reports success.
    pub fn connect(&mut self) -> Result<(), ServiceError> {
        if self.bridge.is_connected() {
            return Ok(());
        }
        let hooks = self.bridge.start(Arc::clone(&self.adapter));
        let result = self.adapter().connect(hooks);
        if let Err(e) = result {
            tracing::warn!(adapter = %self.kind, error = %e, "connect failed, retrying in background");
            self.bridge.report_lost(e.to_string());
            return Err(e.into());
        }
        tracing::info!(adapter = %self.kind, node_name = %self.settings.node_name, "radio connected");
        Ok(())
    }

    /// Stops reconnecting, stops the adapter and waits (bounded) for its
    /// callbacks to settle. Queued events stay available to
    /// [`poll_events`](Self::poll_events).
    pub fn disconnect(&mut self) -> Result<(), ServiceError> {
        let settle = self.settings.disconnect_settle;
        self.bridge.stop(settle);
        let result = self.adapter().disconnect(settle);
        self.bridge
            .push(BridgeEvent::Connection(ConnectionEvent::Disconnected));
        tracing::info!(adapter = %self.kind, "radio disconnected");
        result.map_err(Into::into)
    }

    /// Transmits `text` to `to` and records it as a pending outbound message.
    ///
    /// Nothing is recorded when the adapter refuses the packet.
    pub fn send(&mut self, to: &Destination, text: &str) -> Result<Message, ServiceError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ServiceError::EmptyMessage);
        }
        if text.len() > MAX_TEXT_BYTES {
            return Err(ServiceError::MessageTooLong {
                len: text.len(),
                max: MAX_TEXT_BYTES,
            });
        }

        let route = self.route(to)?;
        let now = Utc::now();
        let timestamp = now.timestamp().clamp(0, i64::from(u32::MAX)) as u32;
        let (bytes, ack) = match &route {
            Route::Channel { hash, .. } => {
                let packet = PacketBuilder::flood().group_text(&GroupText {
                    channel_hash: *hash,
                    timestamp,
                    flags: 0,
                    sender_name: Some(self.settings.node_name.clone()),
                    text: text.to_string(),
                });
                (packet, None)
            }
            Route::Direct { dest, path, .. } => {
                let builder = if path.is_empty() {
                    PacketBuilder::flood()
                } else {
                    PacketBuilder::direct(path.clone())
                };
                let packet = builder.direct_text(&DirectText {
                    dest: *dest,
                    src: self.self_key.short_id(),
                    timestamp,
                    flags: 0,
                    text: text.to_string(),
                });
                (packet, Some(ack_code(timestamp, 0, text, &self.self_key)))
            }
        };
        let packet_hash = decode(&RawPacket::new(bytes.clone()))?.packet_hash;

        self.transmit(&bytes)?;

        let node_name = self.settings.node_name.clone();
        let message = self.store.transaction(|conn| {
            let thread = thread_for_route(conn, &route, now)?;
            let outcome = messages::insert_message(
                conn,
                &NewMessage {
                    message_id: packet_hash.clone(),
                    thread_id: thread.id,
                    direction: Direction::Outbound,
                    sender_peer_id: None,
                    sender_name: Some(node_name),
                    body: text.to_string(),
                    delivery_status: DeliveryStatus::Pending,
                    ack_code: ack,
                    path_hops: Vec::new(),
                    snr: None,
                    rssi: None,
                    created_at: now,
                },
            )?;
            Ok(outcome.message().clone())
        })?;
        tracing::info!(
            to = %to,
            message_id = %message.message_id,
            thread_id = message.thread_id,
            "message sent"
        );
        self.bridge.push(BridgeEvent::MessageSent(message.clone()));
        Ok(message)
    }

    /// Announces this node with a flood advert.
    pub fn send_advert(&mut self) -> Result<(), ServiceError> {
        let packet = PacketBuilder::flood().advert(&Advert {
            public_key: Some(self.self_key),
            timestamp: Utc::now().timestamp().clamp(0, i64::from(u32::MAX)) as u32,
            node_type: NodeType::Chat,
            location: self.settings.location,
            feature1: None,
            feature2: None,
            name: Some(self.settings.node_name.clone()),
        });
        self.transmit(&packet)?;
        tracing::debug!(
            node_name = %self.settings.node_name,
            with_location = self.settings.location.is_some(),
            "advert sent"
        );
        Ok(())
    }

    /// Asks a peer for its sensor readings. Returns the tag the answer
    /// will echo; it arrives later as a telemetry event.
    ///
    /// Channels cannot be asked.
    pub fn request_telemetry(&mut self, to: &Destination) -> Result<u32, ServiceError> {
        let Route::Direct { dest, path, .. } = self.route(to)? else {
            return Err(ServiceError::Unroutable(to.to_string()));
        };
        // Tags must differ even for requests within the same second.
        let now = Utc::now().timestamp().clamp(0, i64::from(u32::MAX)) as u32;
        let tag = now.max(self.last_request_tag.wrapping_add(1));
        let builder = if path.is_empty() {
            PacketBuilder::flood()
        } else {
            PacketBuilder::direct(path)
        };
        let packet = builder.request(&Request {
            dest,
            src: self.self_key.short_id(),
            timestamp: tag,
            kind: RequestKind::Telemetry,
            data: Vec::new(),
        });
        self.transmit(&packet)?;
        self.last_request_tag = tag;
        tracing::info!(to = %to, tag, "telemetry requested");
        Ok(tag)
    }

    /// Stores a channel secret and joins the channel.
    pub fn import_channel(&self, name: &str, secret_hex: &str) -> Result<Channel, ServiceError> {
        let channel = self
            .store
            .transaction(|conn| channels::import_channel(conn, name, secret_hex, Utc::now()))?;
        tracing::info!(channel_id = %channel.channel_id, name = %channel.name, "channel imported");
        Ok(channel)
    }

    /// Deletes a channel with its thread and messages. The public channel
    /// is refused.
    pub fn remove_channel(&self, channel_id: &str) -> Result<usize, ServiceError> {
        let removed = self
            .store
            .transaction(|conn| channels::remove_channel(conn, channel_id))?;
        tracing::info!(channel_id, removed_messages = removed, "channel removed");
        Ok(removed)
    }

    /// Pins or unpins a peer by stable id.
    pub fn set_favorite(&self, stable_id: &str, favorite: bool) -> Result<Peer, ServiceError> {
        let peer = self
            .store
            .transaction(|conn| peers::set_favorite(conn, stable_id, favorite))?;
        tracing::debug!(stable_id, favorite, "favorite updated");
        Ok(peer)
    }

    /// Clears a thread's unread count.
    pub fn mark_thread_read(&self, thread_id: i64) -> Result<Thread, ServiceError> {
        Ok(self.store.transaction(|conn| threads::mark_read(conn, thread_id))?)
    }

    /// Takes everything the adapter and local actions queued, oldest first.
    /// Never blocks on the radio.
    pub fn poll_events(&self) -> Vec<QueuedEvent> {
        self.bridge.queue().drain()
    }

    /// Current link and queue state.
    pub fn status(&self) -> ServiceStatus {
        let queue = self.bridge.queue();
        ServiceStatus {
            connected: self.bridge.is_connected(),
            reconnecting: self.bridge.is_reconnecting(),
            adapter: self.kind,
            node_name: self.settings.node_name.clone(),
            self_key: self.self_key.to_hex(),
            queued: queue.len(),
            dropped: queue.dropped(),
        }
    }

    /// The store this service records into, shared with the event log.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Key the adapter identifies this node with.
    pub fn self_key(&self) -> PublicKey {
        self.self_key
    }

    pub fn node_name(&self) -> &str {
        &self.settings.node_name
    }

    /// How long outbound messages may stay pending.
    pub fn send_timeout(&self) -> Duration {
        self.settings.send_timeout
    }

    /// Hands one packet to the adapter. A failure on a live link is treated
    /// as a loss so the supervisor reconnects with backoff.
    fn transmit(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let result = self.adapter().transmit(packet);
        if let Err(e) = &result {
            if self.bridge.is_connected() {
                tracing::warn!(adapter = %self.kind, error = %e, "transmit failed, reconnecting");
                self.bridge.report_lost(format!("transmit failed: {e}"));
            }
        }
        result
    }

    fn route(&self, to: &Destination) -> Result<Route, ServiceError> {
        match to {
            Destination::Channel(name) => {
                let channel = self
                    .store
                    .read(|conn| channels::find_channel_by_name(conn, name))?
                    .ok_or_else(|| ServiceError::UnknownDestination(to.to_string()))?;
                let hash = channel
                    .channel_hash
                    .as_deref()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| ServiceError::Unroutable(to.to_string()))?;
                Ok(Route::Channel { channel, hash })
            }
            Destination::Key(key) => {
                let peer = self
                    .store
                    .read(|conn| peers::find_by_public_key(conn, key))?
                    .filter(|p| p.merged_into.is_none());
                let path = peer.as_ref().map(path_bytes).unwrap_or_default();
                Ok(Route::Direct {
                    peer,
                    key: Some(*key),
                    dest: key.short_id(),
                    path,
                })
            }
            Destination::Peer(name) => {
                let peer = self
                    .store
                    .read(|conn| match peers::get_peer(conn, name) {
                        Ok(peer) if peer.merged_into.is_none() => Ok(Some(peer)),
                        Ok(_) | Err(StoreError::NotFound(_)) => {
                            Ok(peers::candidates_by_name(conn, name)?.into_iter().next())
                        }
                        Err(e) => Err(e),
                    })?
                    .ok_or_else(|| ServiceError::UnknownDestination(to.to_string()))?;
                let dest = peer
                    .public_key
                    .map(|k| k.short_id())
                    .or_else(|| peer.short_id.as_deref().and_then(|s| s.parse::<ShortId>().ok()))
                    .ok_or_else(|| ServiceError::Unroutable(to.to_string()))?;
                let path = path_bytes(&peer);
                Ok(Route::Direct {
                    key: peer.public_key,
                    peer: Some(peer),
                    dest,
                    path,
                })
            }
        }
    }
}

impl Drop for MeshcoreService {
    fn drop(&mut self) {
        if self.bridge.is_connected() || self.bridge.is_reconnecting() {
            self.bridge.stop(Duration::from_millis(100));
            let _ = self.adapter().disconnect(Duration::from_millis(100));
        }
    }
}

fn path_bytes(peer: &Peer) -> Vec<u8> {
    peer.last_path
        .iter()
        .filter_map(|hop| u8::from_str_radix(hop, 16).ok())
        .collect()
}

fn thread_for_route(
    conn: &rusqlite::Connection,
    route: &Route,
    now: DateTime<Utc>,
) -> Result<Thread, StoreError> {
    match route {
        Route::Channel { channel, .. } => threads::ensure_channel_thread(conn, &channel.channel_id, now),
        Route::Direct { peer: Some(peer), .. } => threads::ensure_direct_thread(conn, &peer.stable_id, now),
        Route::Direct { peer: None, key, dest, .. } => {
            let id = match key {
                Some(key) => SenderIdentifier::PublicKey(*key),
                None => SenderIdentifier::ShortId(*dest),
            };
            let resolution = NodeResolver::new(conn).resolve(&id, &Evidence::seen(now))?;
            threads::ensure_direct_thread(conn, &resolution.peer.stable_id, now)
        }
    }
}
