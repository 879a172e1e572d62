//! Persistence contract for recorded samples
//!
//! The relational schema lives outside this crate. The pipeline only needs
//! the calls in [`RecordingStore`]; [`memory::MemoryStore`] implements them
//! for tests, demos and remote replay of a live session.

pub mod memory;
pub mod writer;

use crate::dsp::calculation::HaemoValues;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the persistence layer
///
/// The backend's own message is carried through unchanged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{0}")]
    Query(String),
}

/// One persisted sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRow {
    pub recording_id: u64,
    /// Milliseconds since the start of the recording
    pub time_stamp: f64,
    #[serde(flatten)]
    pub values: HaemoValues,
    /// Raw integer cells of the sample (averaged when down-sampled)
    pub raw: Vec<i32>,
    /// True while an event marker was active
    pub event: bool,
}

/// Storage calls consumed by the session and the export server
pub trait RecordingStore: Send + Sync {
    /// Append rows in order
    fn insert_batch(&self, rows: &[RecordingRow]) -> Result<(), StoreError>;

    /// Rows with `start <= time_stamp <= end`, oldest first
    fn query_interval(
        &self,
        recording_id: u64,
        start: f64,
        end: f64,
    ) -> Result<Vec<RecordingRow>, StoreError>;

    /// Rows recorded while an event marker was active, oldest first
    fn query_recent_events(&self, recording_id: u64) -> Result<Vec<RecordingRow>, StoreError>;

    /// Up to `limit` rows starting at row `offset`, oldest first
    fn query_from(
        &self,
        recording_id: u64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RecordingRow>, StoreError>;

    /// Timestamp of the newest row, `None` for an empty recording
    fn last_timestamp(&self, recording_id: u64) -> Result<Option<f64>, StoreError>;
}
