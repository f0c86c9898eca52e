//! Error types for radio adapters and the service facade.

use meshcore_codec::DecodeError;
use meshcore_store::StoreError;
use thiserror::Error;

/// Adapter connect, transmit or link failure.
///
/// Never fatal: the bridge reconnects with backoff after any of these.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("radio i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("radio device {path} unavailable: {reason}")]
    Device { path: String, reason: String },

    #[error("radio is not connected")]
    NotConnected,

    #[error("invalid radio configuration: {0}")]
    Config(String),

    /// Injected by the synthetic adapter.
    #[error("simulated failure: {0}")]
    Simulated(String),
}

/// Errors returned by [`crate::MeshcoreService`] operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("message is empty")]
    EmptyMessage,

    #[error("message is {len} bytes, limit is {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    #[error("destination {0} has no usable address")]
    Unroutable(String),

    /// The encoder produced a packet the decoder rejects.
    #[error("outbound packet is malformed: {0}")]
    Encode(#[from] DecodeError),
}
