//! Nirstream - NIRS acquisition and export
//!
//! This library re-exports the acquisition pipeline from `nirstream-core`
//! and the export server from `nirstream-server`, and adds the persistent
//! application configuration and logging setup shared by the binaries.

pub mod config;
pub mod logging;

pub use nirstream_core::{device, dsp, session, storage, timer};
pub use nirstream_server as export;

pub use config::AppConfig;
pub use nirstream_core::{
    CalculationEngine, DownSampler, LowPassFilter, MemoryStore, NirsError, RecordingRow,
    RecordingStore, SessionHandle, SessionState, SimulatedInstrument, TimestampGenerator,
};
pub use nirstream_core::{
    DEFAULT_BATCH_SIZE, DEFAULT_ELEMENTS_PER_POINT, DEFAULT_SAMPLING_RATE, VERSION,
};
