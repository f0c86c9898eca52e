//! Adapter for a LoRa radio driven through a frame device.
//!
//! The physical layer (SPI, GPIO, modulation) belongs to the driver behind
//! `device_path`. This adapter checks that the expected devices exist, sends
//! the driver one init frame with the radio parameters and bring-up flags,
//! then reads frames on a dedicated thread.
//!
//! ```text
//! frame   kind u8 | len u16 LE | body[len]
//! 0x01 RX   snr i8 (quarter dB) | rssi i16 LE | packet
//! 0x02 TX   packet
//! 0x03 INIT frequency u32 | bandwidth u32 | sf u8 | cr u8 | tx_power i8 |
//!           preamble u16 | flags u8 (bit 0 DIO2 RF switch, bit 1 DIO3 TCXO)
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshcore_codec::RawPacket;
use meshcore_types::{PublicKey, UnknownVariant};
use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterKind, LinkState, RadioAdapter, RadioHooks, Worker};
use crate::error::TransportError;

pub const FRAME_RX: u8 = 0x01;
pub const FRAME_TX: u8 = 0x02;
pub const FRAME_INIT: u8 = 0x03;

const INIT_FLAG_DIO2_RF: u8 = 0x01;
const INIT_FLAG_DIO3_TCXO: u8 = 0x02;

/// LoRa modulation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioParams {
    /// Hz.
    pub frequency: u32,
    /// Hz.
    pub bandwidth: u32,
    pub spreading_factor: u8,
    pub coding_rate: u8,
    /// dBm.
    pub tx_power: i8,
    pub preamble_length: u16,
}

/// Named parameter sets used by public meshcore networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioPreset {
    MeshcoreUs,
    MeshcoreEu,
}

impl RadioPreset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MeshcoreUs => "meshcore-us",
            Self::MeshcoreEu => "meshcore-eu",
        }
    }

    pub fn params(self) -> RadioParams {
        match self {
            Self::MeshcoreUs => RadioParams {
                frequency: 910_525_000,
                bandwidth: 62_500,
                spreading_factor: 7,
                coding_rate: 5,
                tx_power: 22,
                preamble_length: 17,
            },
            Self::MeshcoreEu => RadioParams {
                frequency: 869_525_000,
                bandwidth: 250_000,
                spreading_factor: 11,
                coding_rate: 5,
                tx_power: 14,
                preamble_length: 17,
            },
        }
    }
}

impl FromStr for RadioPreset {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "meshcore-us" | "us" => Ok(Self::MeshcoreUs),
            "meshcore-eu" | "eu" => Ok(Self::MeshcoreEu),
            other => Err(UnknownVariant {
                kind: "radio preset",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HardwareSettings {
    /// Frame device exposed by the radio driver.
    pub device_path: PathBuf,
    pub spi_device: PathBuf,
    pub gpio_chip: PathBuf,
    pub radio: RadioParams,
    /// DIO2 drives the RF switch.
    pub use_dio2_rf: bool,
    /// DIO3 powers the TCXO.
    pub use_dio3_tcxo: bool,
    pub identity: PublicKey,
}

impl HardwareSettings {
    fn init_body(&self) -> Vec<u8> {
        let r = &self.radio;
        let mut body = Vec::with_capacity(14);
        body.extend_from_slice(&r.frequency.to_le_bytes());
        body.extend_from_slice(&r.bandwidth.to_le_bytes());
        body.push(r.spreading_factor);
        body.push(r.coding_rate);
        body.push(r.tx_power as u8);
        body.extend_from_slice(&r.preamble_length.to_le_bytes());
        let mut flags = 0;
        if self.use_dio2_rf {
            flags |= INIT_FLAG_DIO2_RF;
        }
        if self.use_dio3_tcxo {
            flags |= INIT_FLAG_DIO3_TCXO;
        }
        body.push(flags);
        body
    }
}

/// One driver frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub body: Vec<u8>,
}

pub fn encode_frame(kind: u8, body: &[u8]) -> io::Result<Vec<u8>> {
    let len = u16::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame body too large"))?;
    let mut out = Vec::with_capacity(body.len() + 3);
    out.push(kind);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Reads one frame. `Ok(None)` on a clean end of stream.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Option<Frame>> {
    let mut header = [0u8; 3];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    let len = usize::from(u16::from_le_bytes([header[1], header[2]]));
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(Frame {
        kind: header[0],
        body,
    }))
}

/// Body of an RX frame to a packet record.
pub fn parse_rx(body: &[u8]) -> Option<RawPacket> {
    if body.len() < 3 {
        return None;
    }
    let snr = f32::from(body[0] as i8) / 4.0;
    let rssi = i16::from_le_bytes([body[1], body[2]]);
    Some(RawPacket::new(body[3..].to_vec()).with_signal(snr, rssi))
}

fn device_error(path: &Path, reason: impl ToString) -> TransportError {
    TransportError::Device {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

pub struct HardwareAdapter {
    settings: HardwareSettings,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    writer: Option<File>,
    poller: Option<Worker>,
    /// Kept to report a link that dies on write.
    hooks: Option<RadioHooks>,
}

impl HardwareAdapter {
    pub fn new(settings: HardwareSettings) -> Self {
        Self {
            settings,
            connected: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            writer: None,
            poller: None,
            hooks: None,
        }
    }

    /// Checks that the devices the driver needs are present.
    pub fn check_devices(&self) -> Result<(), TransportError> {
        for path in [&self.settings.spi_device, &self.settings.gpio_chip] {
            if !path.exists() {
                return Err(device_error(path, "not found"));
            }
        }
        Ok(())
    }

    /// Tears down a link that failed under us and reports it once.
    fn drop_link(&mut self, reason: String) {
        self.stop.store(true, Ordering::Release);
        self.writer = None;
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::warn!(reason = %reason, "radio link lost");
            if let Some(hooks) = &self.hooks {
                (hooks.on_connection_state_change)(LinkState::Down { reason });
            }
        }
    }
}

fn poll(
    mut reader: BufReader<File>,
    hooks: RadioHooks,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) {
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let reason = match read_frame(&mut reader) {
            Ok(Some(frame)) if frame.kind == FRAME_RX => {
                match parse_rx(&frame.body) {
                    Some(raw) => (hooks.on_packet)(raw),
                    None => (hooks.on_error)(&TransportError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "short rx frame",
                    ))),
                }
                continue;
            }
            Ok(Some(frame)) => {
                tracing::trace!(kind = frame.kind, len = frame.body.len(), "ignoring driver frame");
                continue;
            }
            Ok(None) => "radio device closed".to_string(),
            Err(e) => {
                let err = TransportError::Io(e);
                let reason = err.to_string();
                if !stop.load(Ordering::Acquire) {
                    (hooks.on_error)(&err);
                }
                reason
            }
        };
        if !stop.load(Ordering::Acquire) {
            connected.store(false, Ordering::Release);
            tracing::warn!(reason = %reason, "radio link lost");
            (hooks.on_connection_state_change)(LinkState::Down { reason });
        }
        return;
    }
}

impl RadioAdapter for HardwareAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Hardware
    }

    fn connect(&mut self, hooks: RadioHooks) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(worker) = self.poller.take() {
            worker.join_bounded(Duration::from_millis(100));
        }
        self.check_devices()?;
        let device = &self.settings.device_path;
        let reader = File::open(device).map_err(|e| device_error(device, e))?;
        let mut writer = OpenOptions::new()
            .append(true)
            .open(device)
            .map_err(|e| device_error(device, e))?;
        writer.write_all(&encode_frame(FRAME_INIT, &self.settings.init_body())?)?;
        writer.flush()?;

        let stop = Arc::new(AtomicBool::new(false));
        self.stop = Arc::clone(&stop);
        self.writer = Some(writer);
        self.connected.store(true, Ordering::Release);
        tracing::info!(
            device = %device.display(),
            frequency = self.settings.radio.frequency,
            spreading_factor = self.settings.radio.spreading_factor,
            use_dio2_rf = self.settings.use_dio2_rf,
            use_dio3_tcxo = self.settings.use_dio3_tcxo,
            "radio initialised"
        );
        (hooks.on_connection_state_change)(LinkState::Up);
        self.hooks = Some(hooks.clone());

        let connected = Arc::clone(&self.connected);
        let worker = Worker::spawn("meshcore-radio-poll", move || {
            poll(BufReader::new(reader), hooks, connected, stop)
        });
        match worker {
            Ok(worker) => {
                self.poller = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::Release);
                self.writer = None;
                Err(e.into())
            }
        }
    }

    fn disconnect(&mut self, settle: Duration) -> Result<(), TransportError> {
        self.stop.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.writer = None;
        self.hooks = None;
        if let Some(worker) = self.poller.take() {
            // A read blocked on the device only returns with the next frame.
            worker.join_bounded(settle);
        }
        Ok(())
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let frame = encode_frame(FRAME_TX, packet)?;
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;
        let written = writer.write_all(&frame).and_then(|()| writer.flush());
        if let Err(e) = written {
            let err = TransportError::Io(e);
            self.drop_link(format!("transmit failed: {err}"));
            return Err(err);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn self_key(&self) -> PublicKey {
        self.settings.identity
    }
}

impl Drop for HardwareAdapter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
