//! The event log presentation code reads from.
//!
//! [`UiEventStore`] owns the [`MeshcoreService`](meshcore_radio::MeshcoreService)
//! and turns what it queues into an ordered log of [`Event`]s. Every radio
//! packet is decoded, reconciled against the store (peers, channels,
//! threads, messages, packet history) in one transaction, and appended with
//! the next id. Consumers keep a [`Cursor`] each and read incrementally with
//! [`UiEventStore::since`].
//!
//! # Event kinds
//!
//! | Group | Kinds |
//! |-------|-------|
//! | Traffic | `advert`, `direct_message`, `channel_message`, `ack`, `path_update`, `control`, `telemetry`, `packet` |
//! | Local | `message_sent`, `delivery_status_changed` |
//! | Link | `connected`, `connection_lost`, `connection_restored`, `disconnected`, `radio_error` |
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut events = UiEventStore::new(service, PipelineSettings::default());
//! let mut cursor = Cursor::START;
//! loop {
//!     events.pump();
//!     let (next, new_events) = events.since(cursor);
//!     cursor = next;
//!     render(&new_events);
//! }
//! ```

mod event;
mod reconcile;
mod store;

pub use event::{
    Cursor, Event, EventKind, EventPayload, PacketMeta, ParseEventKindError, PeerRef, StatusCause,
};
pub use store::{Diagnostics, PipelineSettings, PumpReport, UiEventStore};
