//! Block-averaging down-sampler
//!
//! Every run of `factor` consecutive samples is averaged into one output
//! sample, per channel. After `factor` input batches the outputs fill exactly
//! one batch, which becomes ready for [`DownSampler::take_output`].

use crate::error::NirsError;

/// One averaged batch, row-major `[point][channel]`
pub type DownSampledBlock = Vec<Vec<f64>>;

/// Down-sampler for fixed-shape telemetry batches
#[derive(Debug, Clone)]
pub struct DownSampler {
    factor: usize,
    batch_size: usize,
    elements_per_point: usize,
    /// Running per-channel sums of the current group
    accumulator: Vec<f64>,
    /// Samples summed into `accumulator`
    group_len: usize,
    /// Averaged points of the block being built
    pending: DownSampledBlock,
    /// Input batches consumed since the last output
    batches_since_output: usize,
    ready: Vec<DownSampledBlock>,
}

impl DownSampler {
    /// Create a down-sampler reducing the rate by `factor`
    ///
    /// # Arguments
    /// * `factor` - Input batches (and consecutive samples) per output; at least 1
    /// * `batch_size` - Points per input batch
    /// * `elements_per_point` - Integer cells per point
    pub fn new(factor: usize, batch_size: usize, elements_per_point: usize) -> Self {
        let factor = factor.max(1);
        Self {
            factor,
            batch_size,
            elements_per_point,
            accumulator: vec![0.0; elements_per_point],
            group_len: 0,
            pending: Vec::with_capacity(batch_size),
            batches_since_output: 0,
            ready: Vec::new(),
        }
    }

    /// Create a down-sampler from a raw and a target rate
    ///
    /// Fails with [`NirsError::Configuration`] when the raw rate is not a
    /// whole multiple of the target.
    pub fn from_rates(
        raw_rate: u32,
        target_rate: u32,
        batch_size: usize,
        elements_per_point: usize,
    ) -> Result<Self, NirsError> {
        let factor = down_sample_factor(raw_rate, target_rate)?;
        Ok(Self::new(factor, batch_size, elements_per_point))
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Feed one raw batch of `batch_size * elements_per_point` cells
    pub fn down_sample(&mut self, batch: &[i32]) {
        let width = self.elements_per_point;
        for point in batch.chunks_exact(width).take(self.batch_size) {
            for (sum, &cell) in self.accumulator.iter_mut().zip(point) {
                *sum += cell as f64;
            }
            self.group_len += 1;

            if self.group_len == self.factor {
                let n = self.factor as f64;
                self.pending
                    .push(self.accumulator.iter().map(|sum| sum / n).collect());
                self.accumulator.iter_mut().for_each(|sum| *sum = 0.0);
                self.group_len = 0;
            }
        }

        self.batches_since_output += 1;
        if self.batches_since_output == self.factor {
            self.ready.push(std::mem::take(&mut self.pending));
            self.pending = Vec::with_capacity(self.batch_size);
            self.batches_since_output = 0;
        }
    }

    /// True when at least one averaged block is waiting
    pub fn is_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Number of blocks waiting
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Drain all ready blocks
    pub fn take_output(&mut self) -> Vec<DownSampledBlock> {
        std::mem::take(&mut self.ready)
    }

    /// Take the single block produced by the last input batch
    ///
    /// Returns `Ok(None)` when nothing is ready yet. More than one ready block
    /// means batches were fed without being drained, which is reported as a
    /// [`NirsError::ConsistencyFault`].
    pub fn take_single(&mut self) -> Result<Option<DownSampledBlock>, NirsError> {
        match self.ready.len() {
            0 => Ok(None),
            1 => Ok(self.ready.pop()),
            n => Err(NirsError::ConsistencyFault(format!(
                "down-sampler produced {} blocks in a single tick",
                n
            ))),
        }
    }

    /// Drop all partial and ready state
    pub fn reset(&mut self) {
        self.accumulator.iter_mut().for_each(|sum| *sum = 0.0);
        self.group_len = 0;
        self.pending.clear();
        self.batches_since_output = 0;
        self.ready.clear();
    }
}

/// Whole-number reduction factor between two rates
pub fn down_sample_factor(raw_rate: u32, target_rate: u32) -> Result<usize, NirsError> {
    if target_rate == 0 || raw_rate == 0 {
        return Err(NirsError::Configuration(format!(
            "invalid sampling rates {} Hz -> {} Hz",
            raw_rate, target_rate
        )));
    }
    if raw_rate % target_rate != 0 {
        return Err(NirsError::Configuration(format!(
            "incorrect down sampling factor {}",
            raw_rate as f64 / target_rate as f64
        )));
    }
    Ok((raw_rate / target_rate) as usize)
}
