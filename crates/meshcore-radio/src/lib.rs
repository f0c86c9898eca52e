//! Radio side of the meshcore console.
//!
//! A [`RadioAdapter`] is a source of raw packets and link signals that can
//! also transmit. Two implementations exist: [`HardwareAdapter`] for a LoRa
//! radio behind a driver frame device, and [`MockSession`] for development.
//! One is chosen at startup and boxed; nothing downstream knows which.
//!
//! The [`EventBridge`] turns adapter callbacks into [`BridgeEvent`]s on a
//! bounded [`HandoffQueue`] and reconnects with exponential backoff after a
//! loss. [`MeshcoreService`] owns both and is the only entry point the
//! presentation layer needs: `connect`, `disconnect`, `send` and the
//! non-blocking `poll_events` drain.

mod adapter;
mod backoff;
mod bridge;
mod error;
pub mod hardware;
pub mod mock;
mod queue;
mod service;

pub use adapter::{AdapterKind, LinkState, RadioAdapter, RadioHooks};
pub use backoff::Backoff;
pub use bridge::{BridgeSettings, EventBridge, SharedAdapter};
pub use error::{ServiceError, TransportError};
pub use hardware::{HardwareAdapter, HardwareSettings, RadioParams, RadioPreset};
pub use mock::{MockHandle, MockSession, MockSettings, ROSTER};
pub use queue::{BridgeEvent, ConnectionEvent, HandoffQueue, QueuedEvent};
pub use service::{MeshcoreService, ServiceSettings, ServiceStatus};
