//! Deterministic time axis for telemetry batches
//!
//! Timestamps are derived from the sample count, never from the wall clock,
//! so a recording replays with the exact spacing it was captured with.

/// Per-recording time axis
///
/// Rows inside one batch are stamped `timestamp() + i * time_delta()`.
/// After the batch has been routed, [`advance`](Self::advance) moves the
/// base forward by one full batch.
///
/// # Example
/// ```
/// use nirstream_core::dsp::timestamp::TimestampGenerator;
///
/// let mut ts = TimestampGenerator::new(10, 100, None);
/// assert_eq!(ts.stamp(3), 30.0);
/// ts.advance();
/// assert_eq!(ts.timestamp(), 100.0);
/// ```
#[derive(Debug, Clone)]
pub struct TimestampGenerator {
    batch_size: usize,
    ms_per_sample: f64,
    /// Base stamp of the batch currently being processed
    current: f64,
    /// Samples stamped since construction
    sample_count: u64,
}

impl TimestampGenerator {
    /// Create a time axis
    ///
    /// # Arguments
    /// * `batch_size` - Rows per batch
    /// * `sampling_rate` - Rate of the rows being stamped, in Hz
    /// * `resume_from` - Last persisted timestamp when continuing a recording.
    ///   The first stamp is then one sampling interval after it.
    pub fn new(batch_size: usize, sampling_rate: u32, resume_from: Option<f64>) -> Self {
        let ms_per_sample = 1000.0 / sampling_rate.max(1) as f64;
        let current = match resume_from {
            Some(last) => last + ms_per_sample,
            None => 0.0,
        };

        Self {
            batch_size,
            ms_per_sample,
            current,
            sample_count: 0,
        }
    }

    /// Base stamp of the current batch
    pub fn timestamp(&self) -> f64 {
        self.current
    }

    /// Spacing between consecutive rows in milliseconds
    pub fn time_delta(&self) -> f64 {
        self.ms_per_sample
    }

    /// Stamp for row `index` of the current batch
    pub fn stamp(&self, index: usize) -> f64 {
        self.current + index as f64 * self.ms_per_sample
    }

    /// Stamp of the last row of the current batch
    pub fn last_timestamp(&self) -> f64 {
        self.stamp(self.batch_size.saturating_sub(1))
    }

    /// Move the base forward by one batch duration
    pub fn advance(&mut self) {
        self.current += self.batch_size as f64 * self.ms_per_sample;
        self.sample_count += self.batch_size as u64;
    }

    /// Number of rows covered by completed batches
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}
