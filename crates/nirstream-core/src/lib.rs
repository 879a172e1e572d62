//! Nirstream Core - NIRS acquisition pipeline
//!
//! This library owns everything between the oximeter and the application's
//! storage and display layers: the instrument session lifecycle, telemetry
//! parsing, timestamping, down-sampling, haemoglobin calculation and the
//! display smoothing filter.

pub mod device;
pub mod dsp;
pub mod error;
pub mod session;
pub mod storage;
pub mod timer;

pub use device::simulated::SimulatedInstrument;
pub use dsp::{
    calculation::CalculationEngine, downsampler::DownSampler, filter::LowPassFilter,
    timestamp::TimestampGenerator,
};
pub use error::NirsError;
pub use session::{SessionHandle, SessionState};
pub use storage::{memory::MemoryStore, RecordingRow, RecordingStore};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Date this crate was built, injected by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default raw sampling rate of the instrument in Hz
pub const DEFAULT_SAMPLING_RATE: u32 = 100;

/// Samples delivered by the instrument per telemetry chunk
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Integer cells per sample: five LED readings, the dark reading and a counter
pub const DEFAULT_ELEMENTS_PER_POINT: usize = 7;
