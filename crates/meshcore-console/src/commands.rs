//! Handlers behind the console subcommands.
//!
//! Each handler takes an assembled [`UiEventStore`] (or a bare [`Store`])
//! and writes its results as JSON lines to `out`; logs go through
//! `tracing` and never reach `out`.

use std::future::Future;
use std::io::Write;
use std::time::{Duration, Instant};

use chrono::Utc;
use meshcore_observe::{Cursor, Event, EventPayload, UiEventStore};
use meshcore_radio::ServiceError;
use meshcore_store::{channels, messages, peers, Store, StoreError};
use meshcore_types::{Channel, DeliveryStatus, Destination, Message, Peer};
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::ConsoleError;

/// Pumps after disconnect before giving up on residual events.
const MAX_DRAIN_PUMPS: usize = 32;

fn write_json_line<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> Result<(), ConsoleError> {
    serde_json::to_writer(&mut *out, value)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

/// Writes every event after `cursor` and advances it.
fn emit<W: Write>(pipeline: &UiEventStore, cursor: &mut Cursor, out: &mut W) -> Result<usize, ConsoleError> {
    let (next, events) = pipeline.since(*cursor);
    for event in &events {
        write_json_line(out, event)?;
    }
    *cursor = next;
    Ok(events.len())
}

/// Disconnects and pumps until the queue and backlog are empty.
fn shut_down<W: Write>(
    pipeline: &mut UiEventStore,
    cursor: &mut Cursor,
    out: &mut W,
) -> Result<usize, ConsoleError> {
    if let Err(e) = pipeline.service_mut().disconnect() {
        tracing::warn!(error = %e, "radio disconnect reported an error");
    }
    for _ in 0..MAX_DRAIN_PUMPS {
        let report = pipeline.pump();
        if report.drained == 0 && pipeline.diagnostics().backlog == 0 {
            break;
        }
    }
    emit(pipeline, cursor, out)
}

/// Disconnects after a failed radio operation and hands back its error.
fn abandon(pipeline: &mut UiEventStore, err: ServiceError) -> ConsoleError {
    if let Err(disconnect_err) = pipeline.service_mut().disconnect() {
        tracing::warn!(error = %disconnect_err, "radio disconnect after failed command reported an error");
    }
    err.into()
}

/// Connects, then prints each new event as a JSON line until `duration`
/// elapses or `shutdown` resolves. Returns how many events were printed.
///
/// A refused connect is not fatal: the bridge keeps retrying and the
/// eventual `connection_restored` shows up in the stream.
pub async fn listen<W, F>(
    pipeline: &mut UiEventStore,
    tick: Duration,
    duration: Option<Duration>,
    out: &mut W,
    shutdown: F,
) -> Result<usize, ConsoleError>
where
    W: Write,
    F: Future<Output = ()>,
{
    if let Err(e) = pipeline.service_mut().connect() {
        tracing::warn!(error = %e, "radio not up yet, listening while it reconnects");
    }
    write_json_line(out, &pipeline.service().status())?;

    let mut cursor = Cursor::START;
    let mut printed = 0;
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = pipeline.pump();
                if !report.is_idle() {
                    tracing::debug!(
                        drained = report.drained,
                        appended = report.appended,
                        deferred = report.deferred,
                        "pumped"
                    );
                }
                printed += emit(pipeline, &mut cursor, out)?;
            }
            () = &mut deadline => {
                tracing::info!("listen duration reached");
                break;
            }
            () = &mut shutdown => break,
        }
    }

    printed += shut_down(pipeline, &mut cursor, out)?;
    let diagnostics = pipeline.diagnostics();
    tracing::info!(
        printed,
        appended = diagnostics.appended,
        discarded = diagnostics.discarded,
        dropped = diagnostics.dropped,
        "listen finished"
    );
    Ok(printed)
}

/// Sends `text` to `to` and waits up to `wait` for it to leave `pending`.
/// Returns the message as last recorded.
pub async fn send(
    pipeline: &mut UiEventStore,
    to: &str,
    text: &str,
    wait: Duration,
    tick: Duration,
) -> Result<Message, ConsoleError> {
    let destination = Destination::parse(to).ok_or_else(|| ConsoleError::InvalidTarget(to.to_string()))?;
    pipeline.service_mut().connect()?;
    // Fold in whatever the radio reported on connect so peers named by the
    // destination are known.
    pipeline.pump();

    let sent = match pipeline.service_mut().send(&destination, text) {
        Ok(message) => message,
        Err(e) => return Err(abandon(pipeline, e)),
    };

    let started = Instant::now();
    let mut current = sent.clone();
    while current.delivery_status == DeliveryStatus::Pending && started.elapsed() < wait {
        tokio::time::sleep(tick.min(wait)).await;
        pipeline.pump();
        current = pipeline
            .service()
            .store()
            .read(|conn| messages::get_message(conn, &sent.message_id))?;
    }
    tracing::info!(
        message_id = %current.message_id,
        status = %current.delivery_status,
        waited_ms = started.elapsed().as_millis() as u64,
        "send finished"
    );

    let mut cursor = pipeline.head();
    shut_down(pipeline, &mut cursor, &mut std::io::sink())?;
    Ok(current)
}

/// Connects and floods one advert for this node.
pub fn advert(pipeline: &mut UiEventStore) -> Result<(), ConsoleError> {
    pipeline.service_mut().connect()?;
    let result = pipeline.service_mut().send_advert();
    let mut cursor = pipeline.head();
    shut_down(pipeline, &mut cursor, &mut std::io::sink())?;
    Ok(result?)
}

/// Asks `to` for sensor readings and waits up to `wait` for the answer.
/// Returns the telemetry event, or `None` when nothing came back in time.
pub async fn telemetry(
    pipeline: &mut UiEventStore,
    to: &str,
    wait: Duration,
    tick: Duration,
) -> Result<Option<Event>, ConsoleError> {
    let destination = Destination::parse(to).ok_or_else(|| ConsoleError::InvalidTarget(to.to_string()))?;
    pipeline.service_mut().connect()?;
    pipeline.pump();

    let mut cursor = pipeline.head();
    let tag = match pipeline.service_mut().request_telemetry(&destination) {
        Ok(tag) => tag,
        Err(e) => return Err(abandon(pipeline, e)),
    };

    let started = Instant::now();
    let mut answer = None;
    while answer.is_none() && started.elapsed() < wait {
        tokio::time::sleep(tick.min(wait)).await;
        pipeline.pump();
        let (next, events) = pipeline.since(cursor);
        cursor = next;
        answer = events
            .into_iter()
            .find(|e| matches!(e.payload, EventPayload::Telemetry { tag: answered, .. } if answered == tag));
    }
    tracing::info!(
        tag,
        answered = answer.is_some(),
        waited_ms = started.elapsed().as_millis() as u64,
        "telemetry finished"
    );

    shut_down(pipeline, &mut cursor, &mut std::io::sink())?;
    Ok(answer)
}

/// Pins or unpins a peer named by stable id or display name. A merged
/// record forwards to the peer it was folded into. No radio needed.
pub fn favorite(store: &Store, peer: &str, favorite: bool) -> Result<Peer, ConsoleError> {
    let name = peer.trim().trim_start_matches('@');
    let peer = store.transaction(|conn| {
        let stable_id = match peers::get_peer(conn, name) {
            Ok(found) => found.merged_into.unwrap_or(found.stable_id),
            Err(StoreError::NotFound(_)) => peers::candidates_by_name(conn, name)?
                .into_iter()
                .next()
                .map(|p| p.stable_id)
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?,
            Err(e) => return Err(e),
        };
        peers::set_favorite(conn, &stable_id, favorite)
    })?;
    tracing::info!(stable_id = %peer.stable_id, favorite, "favorite updated");
    Ok(peer)
}

/// Deletes a channel by name with its thread and messages. Returns how
/// many messages went with it. No radio needed.
pub fn remove_channel(store: &Store, name: &str) -> Result<usize, ConsoleError> {
    let (channel_id, removed) = store.transaction(|conn| {
        let channel = channels::find_channel_by_name(conn, name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let removed = channels::remove_channel(conn, &channel.channel_id)?;
        Ok((channel.channel_id, removed))
    })?;
    tracing::info!(%channel_id, removed_messages = removed, "channel removed");
    Ok(removed)
}

/// Stores a channel secret. No radio needed.
pub fn import_channel(store: &Store, name: &str, secret_hex: &str) -> Result<Channel, ConsoleError> {
    let channel = store.transaction(|conn| channels::import_channel(conn, name, secret_hex, Utc::now()))?;
    tracing::info!(channel_id = %channel.channel_id, name = %channel.name, "channel imported");
    Ok(channel)
}

/// Writes `value` to `out` as one JSON line.
pub fn print_json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> Result<(), ConsoleError> {
    write_json_line(out, value)
}
