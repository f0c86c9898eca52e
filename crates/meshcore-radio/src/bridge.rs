//! Adapter callbacks to queued events, plus the reconnect supervisor.
//!
//! The hooks handed to an adapter run on the adapter's thread. They push onto
//! the [`HandoffQueue`] and, on link loss, poke the supervisor; they never
//! decode, touch storage or wait on a lock the consumer holds for long.
//!
//! The supervisor is a plain thread that waits out the backoff schedule on
//! its signal channel and calls [`RadioAdapter::connect`] until the link is
//! back. Events queued before and during the outage stay queued.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{after, select, unbounded, Receiver, Sender};

use crate::adapter::{LinkState, RadioAdapter, RadioHooks, Worker};
use crate::backoff::Backoff;
use crate::queue::{BridgeEvent, ConnectionEvent, HandoffQueue};

/// The adapter as shared between the service and the reconnect supervisor.
pub type SharedAdapter = Arc<Mutex<Box<dyn RadioAdapter>>>;

/// Queue bound and reconnect schedule.
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    /// Hand-off queue bound; the oldest event is dropped beyond it.
    pub queue_capacity: usize,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay ceiling.
    pub backoff_max: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

enum Signal {
    LinkLost,
    Stop,
}

/// Link flags shared by hooks, supervisor and status readers.
#[derive(Debug, Default)]
struct LinkFlags {
    connected: AtomicBool,
    /// Set between a loss and the next `Up`.
    lost: AtomicBool,
    attempts: AtomicU32,
}

/// Turns adapter callbacks into queued [`BridgeEvent`]s and keeps the link
/// up across losses.
pub struct EventBridge {
    queue: Arc<HandoffQueue>,
    flags: Arc<LinkFlags>,
    settings: BridgeSettings,
    supervisor: Option<(Sender<Signal>, Worker)>,
}

impl EventBridge {
    /// A bridge with an empty queue and no supervisor running.
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            queue: Arc::new(HandoffQueue::new(settings.queue_capacity)),
            flags: Arc::new(LinkFlags::default()),
            settings,
            supervisor: None,
        }
    }

    /// The queue the consumer drains.
    pub fn queue(&self) -> &Arc<HandoffQueue> {
        &self.queue
    }

    /// True between an `Up` and the next loss or stop.
    pub fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::Acquire)
    }

    /// True while the supervisor is trying to bring a lost link back.
    pub fn is_reconnecting(&self) -> bool {
        self.supervisor.is_some() && self.flags.lost.load(Ordering::Acquire)
    }

    /// Starts the supervisor for `adapter` and returns the hooks to register
    /// with it. Restarting replaces a previous supervisor.
    pub fn start(&mut self, adapter: SharedAdapter) -> RadioHooks {
        if self.supervisor.is_some() {
            self.stop(Duration::from_millis(100));
        }
        let (tx, rx) = unbounded();
        let hooks = self.hooks(tx.clone());
        let supervisor_hooks = hooks.clone();
        let flags = Arc::clone(&self.flags);
        let settings = self.settings;
        let worker = Worker::spawn("meshcore-reconnect", move || {
            supervise(rx, adapter, supervisor_hooks, flags, settings)
        });
        match worker {
            Ok(worker) => self.supervisor = Some((tx, worker)),
            Err(e) => tracing::error!(error = %e, "failed to spawn reconnect supervisor"),
        }
        hooks
    }

    /// Reports a link failure the adapter could not report itself (a failed
    /// first connect) and schedules reconnection.
    pub fn report_lost(&self, reason: String) {
        mark_lost(&self.queue, &self.flags, reason);
        if let Some((tx, _)) = &self.supervisor {
            let _ = tx.send(Signal::LinkLost);
        }
    }

    /// Stops the supervisor, waiting at most `settle` for it to exit.
    pub fn stop(&mut self, settle: Duration) {
        if let Some((tx, worker)) = self.supervisor.take() {
            let _ = tx.send(Signal::Stop);
            worker.join_bounded(settle);
        }
        self.flags.connected.store(false, Ordering::Release);
        self.flags.lost.store(false, Ordering::Release);
    }

    /// Records a local event in the same order as adapter traffic.
    pub fn push(&self, event: BridgeEvent) {
        if !self.queue.push(event) {
            tracing::warn!(dropped = self.queue.dropped(), "hand-off queue full, dropped oldest event");
        }
    }

    fn hooks(&self, signal: Sender<Signal>) -> RadioHooks {
        let packets = Arc::clone(&self.queue);
        let links = Arc::clone(&self.queue);
        let errors = Arc::clone(&self.queue);
        let flags = Arc::clone(&self.flags);

        RadioHooks {
            on_packet: Arc::new(move |raw| {
                packets.push(BridgeEvent::Packet(raw));
            }),
            on_connection_state_change: Arc::new(move |state| match state {
                LinkState::Up => {
                    let event = if flags.lost.swap(false, Ordering::AcqRel) {
                        ConnectionEvent::Restored {
                            attempts: flags.attempts.swap(0, Ordering::AcqRel),
                        }
                    } else {
                        ConnectionEvent::Connected
                    };
                    links.push(BridgeEvent::Connection(event));
                    flags.connected.store(true, Ordering::Release);
                }
                LinkState::Down { reason } => {
                    mark_lost(&links, &flags, reason);
                    let _ = signal.send(Signal::LinkLost);
                }
            }),
            on_error: Arc::new(move |err| {
                errors.push(BridgeEvent::RadioError {
                    message: err.to_string(),
                });
            }),
        }
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        if let Some((tx, _)) = self.supervisor.take() {
            let _ = tx.send(Signal::Stop);
        }
    }
}

fn mark_lost(queue: &HandoffQueue, flags: &LinkFlags, reason: String) {
    flags.connected.store(false, Ordering::Release);
    // One loss event per outage.
    if !flags.lost.swap(true, Ordering::AcqRel) {
        queue.push(BridgeEvent::Connection(ConnectionEvent::Lost { reason }));
    }
}

fn supervise(
    rx: Receiver<Signal>,
    adapter: SharedAdapter,
    hooks: RadioHooks,
    flags: Arc<LinkFlags>,
    settings: BridgeSettings,
) {
    let mut backoff = Backoff::new(settings.backoff_base, settings.backoff_max);
    loop {
        match rx.recv() {
            Ok(Signal::LinkLost) => {}
            Ok(Signal::Stop) | Err(_) => return,
        }

        backoff.reset();
        loop {
            if !flags.lost.load(Ordering::Acquire) {
                break;
            }
            let delay = backoff.next_delay();
            select! {
                recv(rx) -> signal => match signal {
                    Ok(Signal::LinkLost) => {}
                    Ok(Signal::Stop) | Err(_) => return,
                },
                recv(after(delay)) -> _ => {}
            }

            let attempt = backoff.attempt();
            flags.attempts.store(attempt, Ordering::Release);
            let result = {
                let mut adapter = adapter.lock().unwrap_or_else(|e| e.into_inner());
                if adapter.is_connected() {
                    // Reconnected underneath us; make sure it is reported.
                    Ok(())
                } else {
                    adapter.connect(hooks.clone())
                }
            };
            match result {
                Ok(()) => {
                    if flags.lost.load(Ordering::Acquire) {
                        (hooks.on_connection_state_change)(LinkState::Up);
                    }
                    tracing::info!(attempt, "radio link restored");
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use meshcore_codec::RawPacket;
    use meshcore_types::PublicKey;
    use std::time::Instant;

    /// Adapter whose connects fail a set number of times.
    struct FlakyAdapter {
        failures_left: u32,
        connected: bool,
        connects: Arc<AtomicU32>,
    }

    impl RadioAdapter for FlakyAdapter {
        fn kind(&self) -> crate::AdapterKind {
            crate::AdapterKind::Mock
        }

        fn connect(&mut self, hooks: RadioHooks) -> Result<(), TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(TransportError::Simulated("no link".into()));
            }
            self.connected = true;
            (hooks.on_connection_state_change)(LinkState::Up);
            Ok(())
        }

        fn disconnect(&mut self, _settle: Duration) -> Result<(), TransportError> {
            self.connected = false;
            Ok(())
        }

        fn transmit(&mut self, _packet: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn self_key(&self) -> PublicKey {
            PublicKey::from_bytes([1; 32])
        }
    }

    fn fast_settings() -> BridgeSettings {
        BridgeSettings {
            queue_capacity: 64,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        }
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn connection_events(bridge: &EventBridge) -> Vec<ConnectionEvent> {
        bridge
            .queue()
            .drain()
            .into_iter()
            .filter_map(|q| match q.event {
                BridgeEvent::Connection(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn loss_triggers_reconnect_and_keeps_queued_events() {
        let connects = Arc::new(AtomicU32::new(0));
        let adapter: SharedAdapter = Arc::new(Mutex::new(Box::new(FlakyAdapter {
            failures_left: 0,
            connected: false,
            connects: Arc::clone(&connects),
        })));
        let mut bridge = EventBridge::new(fast_settings());
        let hooks = bridge.start(Arc::clone(&adapter));
        adapter
            .lock()
            .expect("adapter lock")
            .connect(hooks.clone())
            .expect("first connect");
        assert!(bridge.is_connected());

        (hooks.on_packet)(RawPacket::new(vec![1, 2, 3]));
        adapter
            .lock()
            .expect("adapter lock")
            .disconnect(Duration::ZERO)
            .expect("drop link");
        (hooks.on_connection_state_change)(LinkState::Down {
            reason: "cable pulled".into(),
        });
        assert!(!bridge.is_connected());

        wait_for("reconnect", || bridge.is_connected());
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        let drained = bridge.queue().drain();
        assert!(matches!(drained[0].event, BridgeEvent::Connection(ConnectionEvent::Connected)));
        assert!(matches!(drained[1].event, BridgeEvent::Packet(_)), "pre-loss packet kept");
        assert_eq!(
            drained[2].event,
            BridgeEvent::Connection(ConnectionEvent::Lost {
                reason: "cable pulled".into()
            })
        );
        assert_eq!(
            drained[3].event,
            BridgeEvent::Connection(ConnectionEvent::Restored { attempts: 1 })
        );
        bridge.stop(Duration::from_secs(1));
    }

    #[test]
    fn failed_first_connect_is_retried_until_it_succeeds() {
        let connects = Arc::new(AtomicU32::new(0));
        let adapter: SharedAdapter = Arc::new(Mutex::new(Box::new(FlakyAdapter {
            failures_left: 3,
            connected: false,
            connects: Arc::clone(&connects),
        })));
        let mut bridge = EventBridge::new(fast_settings());
        let hooks = bridge.start(Arc::clone(&adapter));
        let first = adapter.lock().expect("adapter lock").connect(hooks);
        assert!(first.is_err());
        bridge.report_lost("first connect failed".into());
        assert!(bridge.is_reconnecting());

        wait_for("eventual connect", || bridge.is_connected());
        assert_eq!(connects.load(Ordering::SeqCst), 4);
        assert_eq!(
            connection_events(&bridge),
            vec![
                ConnectionEvent::Lost {
                    reason: "first connect failed".into()
                },
                ConnectionEvent::Restored { attempts: 3 },
            ]
        );
        bridge.stop(Duration::from_secs(1));
    }

    #[test]
    fn stop_cuts_a_long_backoff_wait_short() {
        let connects = Arc::new(AtomicU32::new(0));
        let adapter: SharedAdapter = Arc::new(Mutex::new(Box::new(FlakyAdapter {
            failures_left: u32::MAX,
            connected: false,
            connects: Arc::clone(&connects),
        })));
        let mut bridge = EventBridge::new(BridgeSettings {
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(60),
            ..fast_settings()
        });
        bridge.start(adapter);
        bridge.report_lost("gone".into());
        assert!(bridge.is_reconnecting());

        let started = Instant::now();
        bridge.stop(Duration::from_secs(5));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "stop waited {:?}",
            started.elapsed()
        );
        assert_eq!(connects.load(Ordering::SeqCst), 0, "no attempt before the first delay");
        assert!(!bridge.is_reconnecting());
    }

    #[test]
    fn repeated_loss_reports_once_per_outage() {
        let mut bridge = EventBridge::new(fast_settings());
        bridge.report_lost("a".into());
        bridge.report_lost("b".into());
        assert_eq!(
            connection_events(&bridge),
            vec![ConnectionEvent::Lost { reason: "a".into() }]
        );
        bridge.stop(Duration::ZERO);
    }
}
