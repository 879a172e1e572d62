//! Error types shared across the acquisition pipeline

use thiserror::Error;

use crate::device::DeviceError;
use crate::storage::StoreError;

/// Errors raised while configuring or running a device session
#[derive(Error, Debug)]
pub enum NirsError {
    /// Session cannot start with the given settings. Raised before any device I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal invariant of the processing chain was broken
    #[error("Consistency fault: {0}")]
    ConsistencyFault(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Command not valid in the session's current state
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Failed to spawn thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl NirsError {
    /// True for errors that abort the session rather than a single chunk
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NirsError::Parse(_) | NirsError::InvalidState(_))
    }
}
