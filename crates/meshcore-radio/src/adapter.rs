//! The capability every packet source implements.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use meshcore_codec::RawPacket;
use meshcore_types::{PublicKey, UnknownVariant};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Link transitions reported by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// The link came up (first connect or a reconnect).
    Up,
    /// The link dropped without being asked to.
    Down { reason: String },
}

/// Which implementation is behind a [`RadioAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Synthetic traffic, no radio attached.
    Mock,
    /// LoRa radio behind the driver frame device.
    Hardware,
}

impl AdapterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Hardware => "hardware",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "hardware" => Ok(Self::Hardware),
            other => Err(UnknownVariant {
                kind: "radio mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Callbacks an adapter invokes from its own thread.
///
/// Implementations must be cheap and non-blocking; the bridge's versions
/// only enqueue.
#[derive(Clone)]
pub struct RadioHooks {
    pub on_packet: Arc<dyn Fn(RawPacket) + Send + Sync>,
    pub on_connection_state_change: Arc<dyn Fn(LinkState) + Send + Sync>,
    pub on_error: Arc<dyn Fn(&TransportError) + Send + Sync>,
}

impl fmt::Debug for RadioHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadioHooks").finish_non_exhaustive()
    }
}

/// A source of raw packets and link signals that can also transmit.
///
/// Selected once at startup; nothing downstream branches on which
/// implementation is in use.
pub trait RadioAdapter: Send {
    fn kind(&self) -> AdapterKind;

    /// Brings the link up and starts delivering packets through `hooks`.
    ///
    /// Reports [`LinkState::Up`] through the hooks on success. Calling it on
    /// a connected adapter is a no-op.
    fn connect(&mut self, hooks: RadioHooks) -> Result<(), TransportError>;

    /// Stops producing and waits at most `settle` for in-flight callbacks.
    /// Does not report [`LinkState::Down`].
    fn disconnect(&mut self, settle: Duration) -> Result<(), TransportError>;

    /// Sends one complete packet.
    fn transmit(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// This node's public key.
    fn self_key(&self) -> PublicKey;
}

/// A named background thread that reports its own exit.
///
/// The thread owns the sending half of `done`; the channel disconnects when
/// the thread returns or unwinds, which is what [`Worker::join_bounded`]
/// waits for.
pub(crate) struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::Builder::new().name(name.into()).spawn(move || {
            let _done = done_tx;
            body();
        })?;
        Ok(Self { name, handle, done })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Joins the thread, giving up after `settle`.
    ///
    /// Returns `false` when the thread was still running and has been left
    /// to finish on its own.
    pub(crate) fn join_bounded(self, settle: Duration) -> bool {
        match self.done.recv_timeout(settle) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    thread = self.name,
                    settle_ms = settle.as_millis() as u64,
                    "thread did not settle, detaching"
                );
                return false;
            }
        }
        if self.handle.join().is_err() {
            tracing::error!(thread = self.name, "thread panicked");
        }
        true
    }
}
