//! Synthetic radio for development and tests.
//!
//! Produces packets with [`PacketBuilder`] and delivers them through the
//! same `on_packet` hook the hardware adapter uses, so everything downstream
//! runs exactly as it would on a real link. Traffic is timer driven and
//! randomized; content always decodes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use meshcore_codec::{
    ack_code, channel_hash, channel_hash_hex, decode, Advert, DirectText, DomainEvent, GroupText,
    LppFrame, LppSensor, PacketBuilder, PathReport, RawPacket, RequestKind, Response,
};
use meshcore_types::{GeoPoint, NodeType, PublicKey, ShortId, PUBLIC_CHANNEL_SECRET};
use rand::seq::SliceRandom;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::adapter::{AdapterKind, LinkState, RadioAdapter, RadioHooks, Worker};
use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct MockSettings {
    pub node_name: String,
    /// Time between synthetic packets.
    pub interval: Duration,
    /// Delay before an outbound direct message is acknowledged.
    pub ack_delay: Duration,
    /// Advertise the whole roster on connect.
    pub initial_burst: bool,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            node_name: "meshcore-console".into(),
            interval: Duration::from_secs(5),
            ack_delay: Duration::from_millis(1500),
            initial_burst: true,
        }
    }
}

/// A synthetic peer.
#[derive(Debug, Clone, Copy)]
pub struct RosterEntry {
    pub name: &'static str,
    pub node_type: NodeType,
    /// Whether adverts carry the full key.
    pub advertises_key: bool,
    pub latitude: f64,
    pub longitude: f64,
}

impl RosterEntry {
    pub fn key(&self) -> PublicKey {
        derive_key("peer", self.name)
    }

    pub fn short_id(&self) -> ShortId {
        self.key().short_id()
    }
}

pub const ROSTER: [RosterEntry; 7] = [
    RosterEntry {
        name: "Relay Alpha",
        node_type: NodeType::Repeater,
        advertises_key: true,
        latitude: 37.7749,
        longitude: -122.4194,
    },
    RosterEntry {
        name: "Relay-7",
        node_type: NodeType::Repeater,
        advertises_key: false,
        latitude: 37.8044,
        longitude: -122.2712,
    },
    RosterEntry {
        name: "Node Gateway",
        node_type: NodeType::Room,
        advertises_key: true,
        latitude: 37.5485,
        longitude: -122.0590,
    },
    RosterEntry {
        name: "Alice",
        node_type: NodeType::Chat,
        advertises_key: true,
        latitude: 37.7849,
        longitude: -122.4094,
    },
    RosterEntry {
        name: "Bob",
        node_type: NodeType::Chat,
        advertises_key: true,
        latitude: 37.7649,
        longitude: -122.4294,
    },
    RosterEntry {
        name: "Charlie",
        node_type: NodeType::Chat,
        advertises_key: true,
        latitude: 37.8716,
        longitude: -122.2727,
    },
    RosterEntry {
        name: "Diana",
        node_type: NodeType::Chat,
        advertises_key: false,
        latitude: 37.4419,
        longitude: -122.1430,
    },
];

const CHANNEL_LINES: [&str; 6] = [
    "anyone copy on the north ridge?",
    "relay battery at 80%",
    "@[Alice] signal is strong out here",
    "heading to the trailhead, back on in an hour",
    "net check in 5",
    "¿alguien escucha? 📡",
];

const DIRECT_LINES: [&str; 4] = [
    "are you on the mesh?",
    "got your advert, path looks good",
    "meet at the gateway at noon",
    "ping",
];

/// Secret of a channel the console has not imported.
const OPS_SECRET: &[u8] = b"mock-ops-channel";

fn derive_key(role: &str, name: &str) -> PublicKey {
    let digest = Sha256::digest(format!("meshcore-mock:{role}:{name}").as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    PublicKey::from_bytes(bytes)
}

fn now_secs() -> u32 {
    Utc::now().timestamp().clamp(0, i64::from(u32::MAX)) as u32
}

#[derive(Default)]
struct MockState {
    hooks: Option<RadioHooks>,
    /// Packets to deliver later (acks, repeater echoes), unordered.
    scheduled: Vec<(Instant, Vec<u8>)>,
    fail_connects: u32,
    fail_transmits: u32,
    next_advert: usize,
}

struct Shared {
    connected: AtomicBool,
    state: Mutex<MockState>,
    settings: MockSettings,
    self_key: PublicKey,
}

impl Shared {
    fn hooks(&self) -> Option<RadioHooks> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).hooks.clone()
    }

    fn deliver(&self, packet: RawPacket) {
        if !self.connected.load(Ordering::Acquire) {
            return;
        }
        if let Some(hooks) = self.hooks() {
            (hooks.on_packet)(packet);
        }
    }

    fn deliver_bytes(&self, bytes: Vec<u8>) {
        let mut rng = rand::thread_rng();
        let snr = f32::from(rng.gen_range(-20i8..=48)) / 4.0;
        let rssi = rng.gen_range(-110i16..=-45);
        self.deliver(RawPacket::new(bytes).with_signal(snr, rssi));
    }

    fn schedule(&self, at: Instant, bytes: Vec<u8>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.scheduled.push((at, bytes));
    }

    fn take_due(&self, now: Instant) -> Vec<Vec<u8>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (due, later): (Vec<_>, Vec<_>) = state.scheduled.drain(..).partition(|(at, _)| *at <= now);
        state.scheduled = later;
        let mut due = due;
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, bytes)| bytes).collect()
    }

    fn earliest_scheduled(&self) -> Option<Instant> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.scheduled.iter().map(|(at, _)| *at).min()
    }

    fn next_advert_entry(&self) -> RosterEntry {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = ROSTER[state.next_advert % ROSTER.len()];
        state.next_advert = state.next_advert.wrapping_add(1);
        entry
    }

    /// One randomly chosen piece of background traffic.
    fn random_packet(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        match rng.gen_range(0..10) {
            0..=3 => advert_packet(&self.next_advert_entry(), &mut rng),
            4..=6 => channel_packet(&mut rng),
            7..=8 => direct_packet(&self.self_key, &self.settings.node_name, &mut rng),
            _ => path_packet(&self.self_key, &mut rng),
        }
    }
}

fn relay() -> &'static RosterEntry {
    &ROSTER[0]
}

fn advert_packet(entry: &RosterEntry, rng: &mut impl Rng) -> Vec<u8> {
    let advert = Advert {
        public_key: entry.advertises_key.then(|| entry.key()),
        timestamp: now_secs(),
        node_type: entry.node_type,
        location: Some(GeoPoint {
            latitude: entry.latitude + rng.gen_range(-0.001..0.001),
            longitude: entry.longitude + rng.gen_range(-0.001..0.001),
        }),
        feature1: None,
        feature2: None,
        name: Some(entry.name.to_string()),
    };
    let path = if entry.node_type.is_relay() {
        Vec::new()
    } else {
        vec![relay().short_id().as_u8()]
    };
    PacketBuilder::flood().with_path(path).advert(&advert)
}

/// Sensor frame a roster node answers telemetry requests with.
fn telemetry_frame(entry: &RosterEntry, rng: &mut impl Rng) -> Vec<u8> {
    LppFrame::new()
        .scalar(1, LppSensor::Voltage, rng.gen_range(3.6..4.2))
        .scalar(2, LppSensor::Temperature, rng.gen_range(8.0..24.0))
        .scalar(2, LppSensor::Humidity, rng.gen_range(30.0..70.0))
        .gps(3, entry.latitude, entry.longitude, 12.0)
        .into_bytes()
}

fn channel_packet(rng: &mut impl Rng) -> Vec<u8> {
    let chatty: Vec<&RosterEntry> = ROSTER.iter().filter(|e| e.node_type == NodeType::Chat).collect();
    let sender = chatty.choose(rng).copied().unwrap_or(&ROSTER[3]);
    let hash = if rng.gen_bool(0.2) {
        channel_hash(OPS_SECRET)
    } else {
        channel_hash_hex(PUBLIC_CHANNEL_SECRET).unwrap_or_default()
    };
    let text = CHANNEL_LINES.choose(rng).copied().unwrap_or("hello");
    let msg = GroupText {
        channel_hash: hash,
        timestamp: now_secs(),
        flags: 0,
        sender_name: Some(sender.name.to_string()),
        text: text.to_string(),
    };
    PacketBuilder::flood()
        .with_path(vec![relay().short_id().as_u8()])
        .group_text(&msg)
}

fn direct_packet(self_key: &PublicKey, node_name: &str, rng: &mut impl Rng) -> Vec<u8> {
    let chatty: Vec<&RosterEntry> = ROSTER.iter().filter(|e| e.node_type == NodeType::Chat).collect();
    let sender = chatty.choose(rng).copied().unwrap_or(&ROSTER[3]);
    let text = if rng.gen_bool(0.25) {
        format!("@[{node_name}] you there?")
    } else {
        DIRECT_LINES.choose(rng).copied().unwrap_or("ping").to_string()
    };
    let msg = DirectText {
        dest: self_key.short_id(),
        src: sender.short_id(),
        timestamp: now_secs(),
        flags: 0,
        text,
    };
    PacketBuilder::flood()
        .with_path(vec![relay().short_id().as_u8()])
        .direct_text(&msg)
}

fn path_packet(self_key: &PublicKey, rng: &mut impl Rng) -> Vec<u8> {
    let chatty: Vec<&RosterEntry> = ROSTER.iter().filter(|e| e.node_type == NodeType::Chat).collect();
    let src = chatty.choose(rng).copied().unwrap_or(&ROSTER[3]);
    let mut hops = vec![relay().short_id()];
    if rng.gen_bool(0.5) {
        hops.push(ROSTER[2].short_id());
    }
    PacketBuilder::direct(Vec::new()).path_report(&PathReport {
        dest: self_key.short_id(),
        src: src.short_id(),
        hops,
    })
}

enum TimerMsg {
    /// Something was scheduled; recompute the next wakeup.
    Wake,
    Stop,
}

/// The synthetic [`RadioAdapter`].
pub struct MockSession {
    shared: Arc<Shared>,
    timer: Option<(Sender<TimerMsg>, Worker)>,
}

impl MockSession {
    pub fn new(settings: MockSettings) -> Self {
        let self_key = derive_key("self", &settings.node_name);
        Self {
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                state: Mutex::new(MockState::default()),
                settings,
                self_key,
            }),
            timer: None,
        }
    }

    /// Control handle for fault injection and scripted traffic.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn spawn_timer(&mut self) -> Result<(), TransportError> {
        if let Some((_, worker)) = &self.timer {
            if !worker.is_finished() {
                return Ok(());
            }
        }
        let (tx, rx) = unbounded();
        let shared = Arc::clone(&self.shared);
        let worker = Worker::spawn("meshcore-mock", move || run_timer(shared, rx))?;
        self.timer = Some((tx, worker));
        Ok(())
    }
}

fn run_timer(shared: Arc<Shared>, inbox: Receiver<TimerMsg>) {
    let interval = shared.settings.interval.max(Duration::from_millis(10));
    let mut next_traffic = Instant::now() + interval;
    loop {
        let now = Instant::now();
        let wake = shared
            .earliest_scheduled()
            .map_or(next_traffic, |at| at.min(next_traffic));
        match inbox.recv_timeout(wake.saturating_duration_since(now)) {
            Ok(TimerMsg::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(TimerMsg::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        for bytes in shared.take_due(now) {
            shared.deliver_bytes(bytes);
        }
        if now >= next_traffic {
            if shared.connected.load(Ordering::Acquire) {
                let bytes = shared.random_packet();
                shared.deliver_bytes(bytes);
            }
            next_traffic = now + interval;
        }
    }
}

impl RadioAdapter for MockSession {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Mock
    }

    fn connect(&mut self, hooks: RadioHooks) -> Result<(), TransportError> {
        if self.shared.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(TransportError::Simulated("mock link refused".into()));
            }
            state.hooks = Some(hooks.clone());
        }
        self.spawn_timer()?;
        self.shared.connected.store(true, Ordering::Release);
        tracing::info!(node_name = %self.shared.settings.node_name, "mock radio connected");
        (hooks.on_connection_state_change)(LinkState::Up);

        if self.shared.settings.initial_burst {
            let mut rng = rand::thread_rng();
            for entry in &ROSTER {
                self.shared.deliver_bytes(advert_packet(entry, &mut rng));
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, settle: Duration) -> Result<(), TransportError> {
        self.shared.connected.store(false, Ordering::Release);
        if let Some((tx, worker)) = self.timer.take() {
            let _ = tx.send(TimerMsg::Stop);
            worker.join_bounded(settle);
        }
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.hooks = None;
        state.scheduled.clear();
        tracing::info!("mock radio disconnected");
        Ok(())
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.fail_transmits > 0 {
                state.fail_transmits -= 1;
                return Err(TransportError::Simulated("mock transmit failed".into()));
            }
        }
        let decoded = match decode(&RawPacket::new(packet.to_vec())) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(error = %e, "mock radio sent an undecodable packet");
                return Ok(());
            }
        };
        let due = Instant::now() + self.shared.settings.ack_delay;
        let via_relay = PacketBuilder::flood().with_path(vec![relay().short_id().as_u8()]);
        match decoded.event {
            DomainEvent::DirectText(msg) => {
                if ROSTER.iter().any(|e| e.short_id() == msg.dest) {
                    let code = ack_code(msg.timestamp, msg.flags, &msg.text, &self.shared.self_key);
                    self.shared.schedule(due, via_relay.ack(code));
                } else {
                    tracing::debug!(dest = %msg.dest, "no synthetic peer at destination, no ack");
                }
            }
            // A repeater rebroadcast is the only confirmation a channel send gets.
            DomainEvent::GroupText(msg) => self.shared.schedule(due, via_relay.group_text(&msg)),
            DomainEvent::Request(req) if req.kind == RequestKind::Telemetry => {
                let Some(entry) = ROSTER.iter().find(|e| e.short_id() == req.dest) else {
                    tracing::debug!(dest = %req.dest, "no synthetic peer at destination, no telemetry");
                    return Ok(());
                };
                let response = Response {
                    dest: req.src,
                    src: req.dest,
                    tag: req.timestamp,
                    data: telemetry_frame(entry, &mut rand::thread_rng()),
                };
                self.shared.schedule(due, via_relay.response(&response));
            }
            _ => return Ok(()),
        }
        if let Some((tx, _)) = &self.timer {
            let _ = tx.send(TimerMsg::Wake);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn self_key(&self) -> PublicKey {
        self.shared.self_key
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
        if let Some((tx, _)) = self.timer.take() {
            let _ = tx.send(TimerMsg::Stop);
        }
    }
}

/// Drives a [`MockSession`] from outside, after it has been boxed into a
/// service.
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<Shared>,
}

impl MockHandle {
    /// Drops the link as a hardware fault would.
    pub fn simulate_link_loss(&self, reason: &str) {
        if !self.shared.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(hooks) = self.shared.hooks() {
            (hooks.on_connection_state_change)(LinkState::Down {
                reason: reason.to_string(),
            });
        }
    }

    /// Makes the next `n` connects fail.
    pub fn fail_next_connects(&self, n: u32) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fail_connects = n;
    }

    /// Makes the next `n` transmits fail while the link stays up.
    pub fn fail_next_transmits(&self, n: u32) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fail_transmits = n;
    }

    /// Sends an advert for the named roster entry now. Returns `false` for
    /// names not on the roster.
    pub fn emit_advert(&self, name: &str) -> bool {
        let Some(entry) = ROSTER.iter().find(|e| e.name == name) else {
            return false;
        };
        self.shared.deliver_bytes(advert_packet(entry, &mut rand::thread_rng()));
        true
    }

    /// Delivers arbitrary bytes as a received packet.
    pub fn emit_raw(&self, bytes: Vec<u8>) {
        self.shared.deliver_bytes(bytes);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Packets waiting to be delivered (acks, echoes).
    pub fn scheduled(&self) -> usize {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner()).scheduled.len()
    }
}
