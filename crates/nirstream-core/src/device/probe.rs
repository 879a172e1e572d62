//! Probe calibration and the device sync command

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Calibration of the probe currently attached to the instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    /// Probe name
    pub name: String,
    /// LED drive intensities, one per channel
    pub intensities: Vec<u32>,
    /// Detector gain
    pub gain: u32,
    /// Detector pre-amplifier gain
    pub pre_gain: u32,
    /// Rate the probe is recorded at, in Hz
    pub sampling_rate: u32,
}

impl Probe {
    /// Command syncing the instrument with this calibration:
    /// `<intensity_1,...,intensity_n>,<preGain>,<gain>`
    pub fn sync_command(&self) -> String {
        let mut parts: Vec<String> = self.intensities.iter().map(|i| i.to_string()).collect();
        parts.push(self.pre_gain.to_string());
        parts.push(self.gain.to_string());
        parts.join(",")
    }
}

/// Source of the active probe calibration
pub trait CalibrationStore: Send + Sync {
    /// The probe selected for recording, if any
    fn current_probe(&self) -> Option<Probe>;
}

/// Calibration store holding a single, replaceable probe
#[derive(Debug, Default)]
pub struct StaticCalibration {
    probe: RwLock<Option<Probe>>,
}

impl StaticCalibration {
    pub fn new(probe: Option<Probe>) -> Self {
        Self {
            probe: RwLock::new(probe),
        }
    }

    /// Replace the active probe
    pub fn set_probe(&self, probe: Option<Probe>) {
        if let Ok(mut current) = self.probe.write() {
            *current = probe;
        }
    }
}

impl CalibrationStore for StaticCalibration {
    fn current_probe(&self) -> Option<Probe> {
        self.probe.read().ok().and_then(|p| p.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> Probe {
        Probe {
            name: "Adult".to_string(),
            intensities: vec![12, 30, 44, 50, 61],
            gain: 3,
            pre_gain: 1,
            sampling_rate: 100,
        }
    }

    #[test]
    fn test_sync_command_format() {
        assert_eq!(probe().sync_command(), "12,30,44,50,61,1,3");
    }

    #[test]
    fn test_static_calibration_swap() {
        let store = StaticCalibration::new(None);
        assert!(store.current_probe().is_none());
        store.set_probe(Some(probe()));
        assert_eq!(store.current_probe().unwrap().gain, 3);
    }
}
