//! Cayenne Low Power Payload, the sensor format carried in telemetry
//! responses.
//!
//! A frame is a run of `channel u8 | type u8 | value` records. Values are
//! big-endian fixed point; each type fixes its width and scale, so an
//! unknown type ends decoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sensor types this codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LppSensor {
    DigitalInput,
    DigitalOutput,
    AnalogInput,
    AnalogOutput,
    Generic,
    Illuminance,
    Presence,
    Temperature,
    Humidity,
    Accelerometer,
    Barometer,
    Voltage,
    Current,
    Frequency,
    Percentage,
    Altitude,
    Concentration,
    Power,
    Distance,
    Energy,
    Direction,
    Gyrometer,
    Gps,
}

/// Shape of one sensor's value on the wire.
#[derive(Clone, Copy)]
enum Layout {
    /// Single value: width in bytes, signedness, divisor.
    Scalar(usize, bool, f64),
    /// Three signed 16-bit axes sharing a divisor.
    Triple(f64),
    /// Three signed 24-bit fields: latitude, longitude, altitude.
    Gps,
}

impl LppSensor {
    pub fn type_id(self) -> u8 {
        match self {
            Self::DigitalInput => 0,
            Self::DigitalOutput => 1,
            Self::AnalogInput => 2,
            Self::AnalogOutput => 3,
            Self::Generic => 100,
            Self::Illuminance => 101,
            Self::Presence => 102,
            Self::Temperature => 103,
            Self::Humidity => 104,
            Self::Accelerometer => 113,
            Self::Barometer => 115,
            Self::Voltage => 116,
            Self::Current => 117,
            Self::Frequency => 118,
            Self::Percentage => 120,
            Self::Altitude => 121,
            Self::Concentration => 125,
            Self::Power => 128,
            Self::Distance => 130,
            Self::Energy => 131,
            Self::Direction => 132,
            Self::Gyrometer => 134,
            Self::Gps => 136,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::DigitalInput,
            1 => Self::DigitalOutput,
            2 => Self::AnalogInput,
            3 => Self::AnalogOutput,
            100 => Self::Generic,
            101 => Self::Illuminance,
            102 => Self::Presence,
            103 => Self::Temperature,
            104 => Self::Humidity,
            113 => Self::Accelerometer,
            115 => Self::Barometer,
            116 => Self::Voltage,
            117 => Self::Current,
            118 => Self::Frequency,
            120 => Self::Percentage,
            121 => Self::Altitude,
            125 => Self::Concentration,
            128 => Self::Power,
            130 => Self::Distance,
            131 => Self::Energy,
            132 => Self::Direction,
            134 => Self::Gyrometer,
            136 => Self::Gps,
            _ => return None,
        })
    }

    fn layout(self) -> Layout {
        match self {
            Self::DigitalInput | Self::DigitalOutput | Self::Presence | Self::Percentage => {
                Layout::Scalar(1, false, 1.0)
            }
            Self::AnalogInput | Self::AnalogOutput => Layout::Scalar(2, true, 100.0),
            Self::Generic | Self::Frequency => Layout::Scalar(4, false, 1.0),
            Self::Illuminance | Self::Concentration | Self::Power | Self::Direction => {
                Layout::Scalar(2, false, 1.0)
            }
            Self::Temperature => Layout::Scalar(2, true, 10.0),
            Self::Humidity => Layout::Scalar(1, false, 2.0),
            Self::Barometer => Layout::Scalar(2, false, 10.0),
            Self::Voltage => Layout::Scalar(2, false, 100.0),
            Self::Current => Layout::Scalar(2, false, 1000.0),
            Self::Altitude => Layout::Scalar(2, true, 1.0),
            Self::Distance | Self::Energy => Layout::Scalar(4, false, 1000.0),
            Self::Accelerometer => Layout::Triple(1000.0),
            Self::Gyrometer => Layout::Triple(100.0),
            Self::Gps => Layout::Gps,
        }
    }

    /// Bytes the value occupies after the type byte.
    pub fn value_len(self) -> usize {
        match self.layout() {
            Layout::Scalar(width, ..) => width,
            Layout::Triple(_) => 6,
            Layout::Gps => 9,
        }
    }
}

/// A decoded sensor value in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum LppValue {
    Scalar { value: f64 },
    Vector { x: f64, y: f64, z: f64 },
    Location { latitude: f64, longitude: f64, altitude: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LppReading {
    pub channel: u8,
    pub sensor: LppSensor,
    #[serde(flatten)]
    pub value: LppValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LppError {
    #[error("unknown sensor type {type_id} at offset {offset}")]
    UnknownType { type_id: u8, offset: usize },
    #[error("record at offset {offset} runs past the end of the frame")]
    Truncated { offset: usize },
}

/// Big-endian integer of `width` bytes, sign-extended when `signed`.
fn read_int(bytes: &[u8], signed: bool) -> i64 {
    let raw = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    let bits = bytes.len() * 8;
    if signed && bits < 64 && raw & (1 << (bits - 1)) != 0 {
        (raw | (!0u64 << bits)) as i64
    } else {
        raw as i64
    }
}

fn write_int(out: &mut Vec<u8>, value: i64, width: usize) {
    let bytes = value.to_be_bytes();
    out.extend_from_slice(&bytes[bytes.len() - width..]);
}

/// Decodes a whole frame. An empty frame yields no readings.
pub fn decode_lpp(bytes: &[u8]) -> Result<Vec<LppReading>, LppError> {
    let mut readings = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let header = bytes
            .get(offset..offset + 2)
            .ok_or(LppError::Truncated { offset })?;
        let (channel, type_id) = (header[0], header[1]);
        let sensor =
            LppSensor::from_type_id(type_id).ok_or(LppError::UnknownType { type_id, offset })?;
        let start = offset + 2;
        let data = bytes
            .get(start..start + sensor.value_len())
            .ok_or(LppError::Truncated { offset })?;

        let value = match sensor.layout() {
            Layout::Scalar(_, signed, divisor) => LppValue::Scalar {
                value: read_int(data, signed) as f64 / divisor,
            },
            Layout::Triple(divisor) => LppValue::Vector {
                x: read_int(&data[0..2], true) as f64 / divisor,
                y: read_int(&data[2..4], true) as f64 / divisor,
                z: read_int(&data[4..6], true) as f64 / divisor,
            },
            Layout::Gps => LppValue::Location {
                latitude: read_int(&data[0..3], true) as f64 / 10_000.0,
                longitude: read_int(&data[3..6], true) as f64 / 10_000.0,
                altitude: read_int(&data[6..9], true) as f64 / 100.0,
            },
        };
        readings.push(LppReading {
            channel,
            sensor,
            value,
        });
        offset = start + sensor.value_len();
    }
    Ok(readings)
}

/// Builds an LPP frame one record at a time.
///
/// Values are rounded to the sensor's resolution and saturate at the
/// field's range.
#[derive(Debug, Clone, Default)]
pub struct LppFrame {
    bytes: Vec<u8>,
}

impl LppFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a single-valued sensor. Vector and GPS sensors are ignored
    /// here; use [`LppFrame::vector`] and [`LppFrame::gps`].
    pub fn scalar(mut self, channel: u8, sensor: LppSensor, value: f64) -> Self {
        if let Layout::Scalar(width, signed, divisor) = sensor.layout() {
            self.bytes.extend_from_slice(&[channel, sensor.type_id()]);
            write_int(&mut self.bytes, clamp(value * divisor, width * 8, signed), width);
        }
        self
    }

    pub fn vector(mut self, channel: u8, sensor: LppSensor, x: f64, y: f64, z: f64) -> Self {
        if let Layout::Triple(divisor) = sensor.layout() {
            self.bytes.extend_from_slice(&[channel, sensor.type_id()]);
            for axis in [x, y, z] {
                write_int(&mut self.bytes, clamp(axis * divisor, 16, true), 2);
            }
        }
        self
    }

    pub fn gps(mut self, channel: u8, latitude: f64, longitude: f64, altitude: f64) -> Self {
        self.bytes.extend_from_slice(&[channel, LppSensor::Gps.type_id()]);
        write_int(&mut self.bytes, clamp(latitude * 10_000.0, 24, true), 3);
        write_int(&mut self.bytes, clamp(longitude * 10_000.0, 24, true), 3);
        write_int(&mut self.bytes, clamp(altitude * 100.0, 24, true), 3);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

fn clamp(scaled: f64, bits: usize, signed: bool) -> i64 {
    let (lo, hi) = if signed {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    } else {
        (0, ((1u64 << bits) - 1) as i64)
    };
    (scaled.round() as i64).clamp(lo, hi)
}
