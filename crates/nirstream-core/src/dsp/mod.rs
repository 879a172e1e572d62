//! Signal processing primitives
//!
//! - Batch time axis ([`timestamp`])
//! - Block-averaging rate reduction ([`downsampler`])
//! - Haemoglobin and TOI derivation ([`calculation`])
//! - Display smoothing ([`filter`])

pub mod calculation;
pub mod downsampler;
pub mod filter;
pub mod timestamp;
