//! The in-memory event log and the pump that feeds it.
//!
//! [`UiEventStore::pump`] drains the service's hand-off queue into a
//! backlog and processes the backlog in order. Each item is decoded,
//! reconciled in one store transaction and appended. Items that hit a
//! persistence failure stay at the head of the backlog and are retried on
//! later pumps, at most `max_commit_attempts` times. Every write the pump
//! makes waits for the database lock only as long as the pump budget has
//! left, so a lock held elsewhere costs one tick, not a busy timeout.
//!
//! Reads ([`since`](UiEventStore::since) and friends) never touch the
//! database.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use meshcore_codec::decode;
use meshcore_radio::{BridgeEvent, ConnectionEvent, MeshcoreService, QueuedEvent};
use meshcore_store::messages;
use meshcore_store::packets::DEFAULT_MAX_PACKETS;
use serde::Serialize;

use crate::event::{Cursor, Event, EventPayload, StatusCause};
use crate::reconcile::{reconcile_packet, LocalNode};

/// Pump limits and log retention.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Longest a single pump may keep working.
    pub pump_budget: Duration,
    /// Commit attempts per item before it is discarded.
    pub max_commit_attempts: u32,
    /// Events kept in memory.
    pub max_events: usize,
    /// Rows kept in the packet history.
    pub max_packets: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            pump_budget: Duration::from_millis(50),
            max_commit_attempts: 3,
            max_events: 500,
            max_packets: DEFAULT_MAX_PACKETS,
        }
    }
}

/// Counters for the diagnostics view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Events added to the log.
    pub appended: u64,
    /// Undecodable packets plus items that exhausted their commit attempts.
    pub discarded: u64,
    /// Commit attempts that failed and were scheduled again.
    pub retried: u64,
    /// Items left for a later pump because the budget ran out, each
    /// counted once.
    pub deferred: u64,
    /// Events shed by the full hand-off queue.
    pub dropped: u64,
    /// Items waiting in the backlog.
    pub backlog: usize,
}

/// Outcome of one [`UiEventStore::pump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    /// Items taken off the hand-off queue.
    pub drained: usize,
    /// Events added to the log, timeouts included.
    pub appended: usize,
    pub discarded: usize,
    pub retried: usize,
    /// Backlog left over because the budget ran out.
    pub deferred: usize,
}

impl PumpReport {
    /// Nothing happened.
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

struct Pending {
    item: QueuedEvent,
    attempts: u32,
    /// Already counted in `Diagnostics::deferred`.
    deferred: bool,
}

enum Step {
    Append(Vec<EventPayload>),
    Discard,
    Retry,
}

/// Append-only, explicitly owned event log.
pub struct UiEventStore {
    service: MeshcoreService,
    settings: PipelineSettings,
    log: VecDeque<Event>,
    next_id: u64,
    backlog: VecDeque<Pending>,
    diagnostics: Diagnostics,
}

impl UiEventStore {
    /// Wraps `service`; the log starts empty and the first event gets id 1.
    pub fn new(service: MeshcoreService, settings: PipelineSettings) -> Self {
        Self {
            service,
            settings,
            log: VecDeque::new(),
            next_id: 1,
            backlog: VecDeque::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    /// The service, for status and store reads.
    pub fn service(&self) -> &MeshcoreService {
        &self.service
    }

    /// The service, for connect, disconnect and sends.
    pub fn service_mut(&mut self) -> &mut MeshcoreService {
        &mut self.service
    }

    /// Processes queued radio traffic and local actions.
    ///
    /// Returns at once when nothing is queued. Stops starting new items once
    /// `pump_budget` has elapsed; the rest stay queued for the next call.
    pub fn pump(&mut self) -> PumpReport {
        let started = Instant::now();
        let deadline = started
            .checked_add(self.settings.pump_budget)
            .unwrap_or_else(|| started + Duration::from_secs(3600));
        let mut report = PumpReport::default();

        let drained = self.service.poll_events();
        report.drained = drained.len();
        self.backlog.extend(drained.into_iter().map(|item| Pending {
            item,
            attempts: 0,
            deferred: false,
        }));

        let local = LocalNode {
            key: self.service.self_key(),
            name: self.service.node_name().to_string(),
            max_packets: self.settings.max_packets,
        };

        while let Some(pending) = self.backlog.front_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.defer_backlog(&mut report);
                break;
            }
            let max_attempts = self.settings.max_commit_attempts;
            match process(&self.service, &local, pending, max_attempts, remaining) {
                Step::Append(payloads) => {
                    let at = pending.item.queued_at;
                    self.backlog.pop_front();
                    for payload in payloads {
                        self.append(at, payload);
                        report.appended += 1;
                    }
                }
                Step::Discard => {
                    self.backlog.pop_front();
                    self.diagnostics.discarded += 1;
                    report.discarded += 1;
                }
                Step::Retry => {
                    self.diagnostics.retried += 1;
                    report.retried += 1;
                    // Later items wait so the log keeps arrival order.
                    break;
                }
            }
        }

        self.sweep_timeouts(deadline, &mut report);
        self.compact();
        self.diagnostics.dropped = self.service.status().dropped;
        self.diagnostics.backlog = self.backlog.len();
        report
    }

    /// Events after `cursor`, oldest first, and the cursor to pass next time.
    pub fn since(&self, cursor: Cursor) -> (Cursor, Vec<Event>) {
        self.since_limited(cursor, usize::MAX)
    }

    /// Like [`since`](Self::since) but returns at most `limit` events; the
    /// returned cursor points at the last one returned, so paging never
    /// skips.
    pub fn since_limited(&self, cursor: Cursor, limit: usize) -> (Cursor, Vec<Event>) {
        let start = self.log.partition_point(|e| e.id <= cursor.0);
        let events: Vec<Event> = self.log.iter().skip(start).take(limit).cloned().collect();
        let next = events.last().map_or(cursor, Cursor::from);
        (next, events)
    }

    /// The newest `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let skip = self.log.len().saturating_sub(limit);
        self.log.iter().skip(skip).cloned().collect()
    }

    /// Cursor at the newest event.
    pub fn head(&self) -> Cursor {
        Cursor(self.next_id - 1)
    }

    /// Events currently held; compaction keeps this at most `max_events`.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Counters accumulated since construction.
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    fn defer_backlog(&mut self, report: &mut PumpReport) {
        report.deferred = self.backlog.len();
        for pending in self.backlog.iter_mut().filter(|p| !p.deferred) {
            pending.deferred = true;
            self.diagnostics.deferred += 1;
        }
        tracing::debug!(deferred = report.deferred, "pump budget exhausted");
    }

    fn append(&mut self, timestamp: DateTime<Utc>, payload: EventPayload) {
        let event = Event {
            id: self.next_id,
            timestamp,
            kind: payload.kind(),
            payload,
        };
        self.next_id += 1;
        self.diagnostics.appended += 1;
        tracing::trace!(id = event.id, kind = %event.kind, "event appended");
        self.log.push_back(event);
    }

    /// Outbound messages nobody confirmed within the send timeout become
    /// unconfirmed. Only takes the write lock when something has expired,
    /// and only while the budget lasts.
    fn sweep_timeouts(&mut self, deadline: Instant, report: &mut PumpReport) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.service.send_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let cutoff = now - timeout;
        let store = self.service.store();
        match store.read(|conn| messages::has_expired_pending(conn, cutoff)) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(error = %e, "send timeout check failed");
                return;
            }
        }
        let expired = store.transaction_within(remaining, |conn| {
            messages::expire_pending(conn, cutoff, now)
        });
        match expired {
            Ok(expired) => {
                for message in expired {
                    tracing::info!(message_id = %message.message_id, "message unconfirmed");
                    self.append(
                        now,
                        EventPayload::DeliveryStatusChanged {
                            message,
                            cause: StatusCause::Timeout,
                        },
                    );
                    report.appended += 1;
                }
            }
            // Retried on the next pump.
            Err(e) => tracing::warn!(error = %e, "send timeout sweep failed"),
        }
    }

    /// Drops the oldest events beyond `max_events`. Ids are never reused,
    /// so existing cursors stay valid and simply skip what is gone.
    fn compact(&mut self) {
        let max = self.settings.max_events.max(1);
        while self.log.len() > max {
            self.log.pop_front();
        }
    }
}

fn process(
    service: &MeshcoreService,
    local: &LocalNode,
    pending: &mut Pending,
    max_attempts: u32,
    lock_wait: Duration,
) -> Step {
    let raw = match &pending.item.event {
        BridgeEvent::Packet(raw) => raw,
        BridgeEvent::Connection(c) => return Step::Append(vec![connection_payload(c)]),
        BridgeEvent::RadioError { message } => {
            return Step::Append(vec![EventPayload::RadioError {
                message: message.clone(),
            }])
        }
        BridgeEvent::MessageSent(message) => {
            return Step::Append(vec![EventPayload::MessageSent {
                message: message.clone(),
            }])
        }
    };

    let decoded = match decode(raw) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!(reason = e.reason.as_str(), len = e.len, "discarding undecodable packet");
            return Step::Discard;
        }
    };

    match service
        .store()
        .transaction_within(lock_wait, |conn| reconcile_packet(conn, local, raw, &decoded))
    {
        Ok(payloads) => Step::Append(payloads),
        Err(e) => {
            pending.attempts += 1;
            if pending.attempts >= max_attempts {
                tracing::error!(
                    error = %e,
                    attempts = pending.attempts,
                    packet_hash = %decoded.packet_hash,
                    "giving up on packet"
                );
                Step::Discard
            } else {
                tracing::warn!(
                    error = %e,
                    attempts = pending.attempts,
                    transient = e.is_transient(),
                    "commit failed, will retry"
                );
                Step::Retry
            }
        }
    }
}

fn connection_payload(event: &ConnectionEvent) -> EventPayload {
    match event {
        ConnectionEvent::Connected => EventPayload::Connected,
        ConnectionEvent::Lost { reason } => EventPayload::ConnectionLost {
            reason: reason.clone(),
        },
        ConnectionEvent::Restored { attempts } => EventPayload::ConnectionRestored {
            attempts: *attempts,
        },
        ConnectionEvent::Disconnected => EventPayload::Disconnected,
    }
}
