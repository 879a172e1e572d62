//! Events pushed to the local display
//!
//! The display channel is one-way and unacknowledged: the session never
//! waits on it and a closed receiver is ignored.

use super::SessionState;
use crate::dsp::calculation::HaemoValues;
use serde::Serialize;

/// A derived sample with its timestamp
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatedPoint {
    pub time_stamp: f64,
    #[serde(flatten)]
    pub values: HaemoValues,
}

/// Named events for the local display, one variant per channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "channel", content = "payload", rename_all = "kebab-case")]
pub enum DisplayEvent {
    /// Calculated batch at recording rate
    Data(Vec<CalculatedPoint>),
    /// Low-pass smoothed copy of the same batch
    Filtered(Vec<CalculatedPoint>),
    /// Mean TOI over the last averaging window
    Toi(f64),
    /// Averaged raw cells shown while calibrating a probe
    Calibration(Vec<f64>),
    /// Firmware log line
    Log(String),
    StateChanged(SessionState),
    Error(String),
}

impl DisplayEvent {
    /// Channel name as seen by display consumers
    pub fn channel(&self) -> &'static str {
        match self {
            DisplayEvent::Data(_) => "device:data",
            DisplayEvent::Filtered(_) => "device:filtered",
            DisplayEvent::Toi(_) => "device:TOI",
            DisplayEvent::Calibration(_) => "device:calibration",
            DisplayEvent::Log(_) => "log:message",
            DisplayEvent::StateChanged(_) => "record:state",
            DisplayEvent::Error(_) => "device:error",
        }
    }
}
