//! Reception quality helpers.

use serde::{Deserialize, Serialize};

/// Maps RSSI (dBm) onto 0-100 %, linear between -120 and -40 dBm.
pub fn rssi_to_signal_percent(rssi: i16) -> u8 {
    let pct = (i32::from(rssi) + 120) * 100 / 80;
    pct.clamp(0, 100) as u8
}

/// Coarse link quality derived from SNR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
}

impl SignalQuality {
    pub fn from_snr(snr: f32) -> Self {
        if snr >= 10.0 {
            Self::Excellent
        } else if snr >= 5.0 {
            Self::Good
        } else if snr >= 0.0 {
            Self::Fair
        } else if snr >= -5.0 {
            Self::Poor
        } else {
            Self::Bad
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rssi_is_clamped() {
        assert_eq!(rssi_to_signal_percent(-130), 0);
        assert_eq!(rssi_to_signal_percent(-120), 0);
        assert_eq!(rssi_to_signal_percent(-80), 50);
        assert_eq!(rssi_to_signal_percent(-40), 100);
        assert_eq!(rssi_to_signal_percent(-10), 100);
    }

    #[test]
    fn snr_thresholds() {
        assert_eq!(SignalQuality::from_snr(12.0), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_snr(5.0), SignalQuality::Good);
        assert_eq!(SignalQuality::from_snr(0.5), SignalQuality::Fair);
        assert_eq!(SignalQuality::from_snr(-5.0), SignalQuality::Poor);
        assert_eq!(SignalQuality::from_snr(-9.0), SignalQuality::Bad);
    }
}
