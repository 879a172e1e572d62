//! Instrument model
//!
//! - Instrument connection contract ([`Instrument`])
//! - Probe calibration and the sync command ([`probe`])
//! - Binary telemetry decoding into the shared buffer ([`parser`], [`buffer`])
//! - Hardware-free instrument for demos and tests ([`simulated`])

pub mod buffer;
pub mod parser;
pub mod probe;
pub mod simulated;

use crossbeam_channel::Receiver;
use std::time::Duration;
use thiserror::Error;

/// One raw telemetry chunk as delivered by the instrument
pub type Chunk = Vec<u8>;

/// Errors reported by an instrument
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device not started")]
    NotStarted,

    #[error("Command channel is not connected")]
    InputNotConnected,

    #[error("Failed to open device: {0}")]
    Open(String),

    #[error("Failed to send command: {0}")]
    Command(String),
}

/// Static description of an instrument
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Raw sampling rate in Hz
    pub sampling_rate: u32,
    /// Rates the probe may be recorded at
    pub supported_sampling_rates: Vec<u32>,
    /// Samples per telemetry chunk
    pub batch_size: usize,
    /// Integer cells per sample
    pub elements_per_point: usize,
    /// Delay between opening the device and connecting its command channel
    pub startup_delay: Duration,
}

impl DeviceInfo {
    /// Size of one parsed batch in integer cells
    pub fn batch_cells(&self) -> usize {
        self.batch_size * self.elements_per_point
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "NIRS V5".to_string(),
            sampling_rate: crate::DEFAULT_SAMPLING_RATE,
            supported_sampling_rates: vec![100, 50, 25, 20, 10, 5, 2, 1],
            batch_size: crate::DEFAULT_BATCH_SIZE,
            elements_per_point: crate::DEFAULT_ELEMENTS_PER_POINT,
            startup_delay: Duration::from_millis(500),
        }
    }
}

/// Connection to a physical (or simulated) oximeter
///
/// The session controller drives an instrument through
/// `start -> connect_input -> send_command ... -> close_input -> stop`.
/// Telemetry arrives on the receiver returned by [`Instrument::start`];
/// dropping that receiver detaches the session from the stream.
pub trait Instrument: Send {
    /// Static device description
    fn info(&self) -> DeviceInfo;

    /// Power the device and begin streaming telemetry chunks
    fn start(&mut self) -> Result<Receiver<Chunk>, DeviceError>;

    /// Open the command channel, valid after [`DeviceInfo::startup_delay`]
    fn connect_input(&mut self) -> Result<(), DeviceError>;

    /// Send a text command over the command channel
    fn send_command(&mut self, message: &str) -> Result<(), DeviceError>;

    /// Close the command channel
    fn close_input(&mut self);

    /// Stop streaming and power the device down
    fn stop(&mut self);

    /// Free-text log lines emitted by the device firmware, if it has any
    fn log_stream(&mut self) -> Option<Receiver<String>> {
        None
    }
}
