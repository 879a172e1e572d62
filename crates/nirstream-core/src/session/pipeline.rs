//! Per-chunk processing chain of a running session
//!
//! ```text
//! chunk -> parser -> shared buffer -+-> full rate ----------+-> calculation -> timestamps
//!                                   +-> down-sampler -------+        |
//!                                   +-> calibration average -> display    +-> filters
//!                                                                         +-> persistence / display / TOI
//! ```

use super::events::{CalculatedPoint, DisplayEvent};
use super::worker::CalcWorker;
use crate::device::buffer::{shared_buffer, BufferReader, BufferWriter};
use crate::device::parser::parse_chunk;
use crate::dsp::calculation::{CalculationEngine, HaemoValues, RollingAverage};
use crate::dsp::downsampler::{DownSampledBlock, DownSampler};
use crate::dsp::filter::LowPassFilter;
use crate::dsp::timestamp::TimestampGenerator;
use crate::error::NirsError;
use crate::storage::writer::WriterHandle;
use crate::storage::RecordingRow;
use tokio::sync::mpsc::UnboundedSender;

/// Raw cells shown on the calibration chart
const CALIBRATION_CELLS: usize = 6;

/// Shape of the telemetry handled by a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchShape {
    pub batch_size: usize,
    pub elements_per_point: usize,
}

enum Calculation {
    Inline(CalculationEngine),
    Worker(CalcWorker),
}

/// Recording branch: full rate or down-sampled
enum Reduction {
    FullRate,
    DownSampled(DownSampler),
}

struct RecordingStage {
    recording_id: u64,
    reduction: Reduction,
    calculation: Calculation,
    timestamps: TimestampGenerator,
    /// One filter per derived channel: O2Hb, HHb, THb, TOI
    filters: [LowPassFilter; 4],
    toi_average: RollingAverage,
    persistence: WriterHandle,
}

enum Mode {
    Recording(Box<RecordingStage>),
    Calibration(DownSampler),
}

/// Settings for a recording pipeline
pub struct RecordingSetup {
    pub recording_id: u64,
    /// Raw rate divided by target rate, 1 for full rate
    pub factor: usize,
    /// Rate of the rows produced, in Hz
    pub target_rate: u32,
    pub timestamps: TimestampGenerator,
    pub filter_cutoff_hz: f64,
    pub parallel_calculation: bool,
    pub persistence: WriterHandle,
}

/// Processing chain owned by one session
pub struct Pipeline {
    shape: BatchShape,
    writer: BufferWriter,
    reader: BufferReader,
    scratch: Vec<i32>,
    mode: Mode,
    display: UnboundedSender<DisplayEvent>,
    event_active: bool,
    batches: u64,
}

impl Pipeline {
    /// Build a recording pipeline
    pub fn recording(
        shape: BatchShape,
        setup: RecordingSetup,
        display: UnboundedSender<DisplayEvent>,
    ) -> Result<Self, NirsError> {
        let (writer, reader) = shared_buffer(shape.batch_size * shape.elements_per_point);
        let engine = CalculationEngine::new(shape.elements_per_point);

        let reduction = if setup.factor > 1 {
            Reduction::DownSampled(DownSampler::new(
                setup.factor,
                shape.batch_size,
                shape.elements_per_point,
            ))
        } else {
            Reduction::FullRate
        };

        // The worker reads the shared buffer, which only holds full-rate batches
        let calculation = match (&reduction, setup.parallel_calculation) {
            (Reduction::FullRate, true) => Calculation::Worker(
                CalcWorker::spawn(reader.clone(), engine, shape.batch_size)?,
            ),
            _ => Calculation::Inline(engine),
        };

        let rate = setup.target_rate as f64;
        let filter = LowPassFilter::new(setup.filter_cutoff_hz, rate);
        let stage = RecordingStage {
            recording_id: setup.recording_id,
            reduction,
            calculation,
            timestamps: setup.timestamps,
            filters: [filter.clone(), filter.clone(), filter.clone(), filter],
            toi_average: RollingAverage::new((setup.target_rate / 5).max(1) as usize),
            persistence: setup.persistence,
        };

        Ok(Self::with_mode(shape, writer, reader, Mode::Recording(Box::new(stage)), display))
    }

    /// Build a display-only pipeline averaging `block_batches` batches at a time
    pub fn calibration(
        shape: BatchShape,
        block_batches: usize,
        display: UnboundedSender<DisplayEvent>,
    ) -> Self {
        let (writer, reader) = shared_buffer(shape.batch_size * shape.elements_per_point);
        let sampler = DownSampler::new(block_batches, shape.batch_size, shape.elements_per_point);
        Self::with_mode(shape, writer, reader, Mode::Calibration(sampler), display)
    }

    fn with_mode(
        shape: BatchShape,
        writer: BufferWriter,
        reader: BufferReader,
        mode: Mode,
        display: UnboundedSender<DisplayEvent>,
    ) -> Self {
        Self {
            shape,
            scratch: Vec::with_capacity(writer.len()),
            writer,
            reader,
            mode,
            display,
            event_active: false,
            batches: 0,
        }
    }

    /// Mark following rows as recorded during an event
    pub fn set_event_active(&mut self, active: bool) {
        self.event_active = active;
    }

    /// Chunks processed so far
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Process one telemetry chunk to completion
    pub fn process_chunk(&mut self, chunk: &[u8]) -> Result<(), NirsError> {
        parse_chunk(chunk, &mut self.writer)?;
        self.batches += 1;

        match &mut self.mode {
            Mode::Calibration(sampler) => {
                self.reader.read_into(&mut self.scratch);
                sampler.down_sample(&self.scratch);
                if let Some(block) = sampler.take_single()? {
                    if !block.is_empty() {
                        let cells = block_mean(&block, CALIBRATION_CELLS);
                        self.emit(DisplayEvent::Calibration(cells));
                    }
                }
                Ok(())
            }
            Mode::Recording(stage) => {
                let shape = self.shape;
                match &mut stage.reduction {
                    Reduction::FullRate => {
                        let values = match &mut stage.calculation {
                            Calculation::Worker(worker) => {
                                worker.dispatch()?;
                                self.reader.read_into(&mut self.scratch);
                                worker.collect()?
                            }
                            Calculation::Inline(engine) => {
                                self.reader.read_into(&mut self.scratch);
                                engine.process_raw_batch(&self.scratch, shape.batch_size)
                            }
                        };
                        let raw: Vec<Vec<i32>> = self
                            .scratch
                            .chunks_exact(shape.elements_per_point)
                            .map(|p| p.to_vec())
                            .collect();
                        let events = stage.route(&values, raw, self.event_active);
                        self.emit_all(events);
                    }
                    Reduction::DownSampled(sampler) => {
                        self.reader.read_into(&mut self.scratch);
                        sampler.down_sample(&self.scratch);
                        if let Some(block) = sampler.take_single()? {
                            let values = match &mut stage.calculation {
                                Calculation::Inline(engine) => engine.process_block(&block),
                                Calculation::Worker(_) => {
                                    return Err(NirsError::ConsistencyFault(
                                        "worker calculation on a down-sampled block".into(),
                                    ))
                                }
                            };
                            let raw = block
                                .iter()
                                .map(|p| p.iter().map(|c| c.round() as i32).collect())
                                .collect();
                            let events = stage.route(&values, raw, self.event_active);
                            self.emit_all(events);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Flush persistence and hand back the time axis for a later resume
    pub fn finish(self) -> Option<TimestampGenerator> {
        match self.mode {
            Mode::Recording(stage) => {
                let RecordingStage {
                    timestamps,
                    mut persistence,
                    ..
                } = *stage;
                persistence.finish();
                Some(timestamps)
            }
            Mode::Calibration(_) => None,
        }
    }

    fn emit(&self, event: DisplayEvent) {
        let _ = self.display.send(event);
    }

    fn emit_all(&self, events: Vec<DisplayEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

impl RecordingStage {
    /// Stamp, filter and fan out one batch of derived values
    fn route(
        &mut self,
        values: &[HaemoValues],
        raw: Vec<Vec<i32>>,
        event_active: bool,
    ) -> Vec<DisplayEvent> {
        let mut rows = Vec::with_capacity(values.len());
        let mut calculated = Vec::with_capacity(values.len());
        let mut filtered = Vec::with_capacity(values.len());
        let mut toi_means = Vec::new();

        for (i, (v, raw)) in values.iter().zip(raw).enumerate() {
            let time_stamp = self.timestamps.stamp(i);

            calculated.push(CalculatedPoint {
                time_stamp,
                values: *v,
            });
            filtered.push(CalculatedPoint {
                time_stamp,
                values: HaemoValues {
                    o2hb: self.filters[0].single_step(v.o2hb),
                    hhb: self.filters[1].single_step(v.hhb),
                    thb: self.filters[2].single_step(v.thb),
                    toi: self.filters[3].single_step(v.toi),
                },
            });
            rows.push(RecordingRow {
                recording_id: self.recording_id,
                time_stamp,
                values: *v,
                raw,
                event: event_active,
            });
            if let Some(mean) = self.toi_average.push(v.toi) {
                toi_means.push(mean);
            }
        }

        self.persistence.submit(rows);
        self.timestamps.advance();

        let mut events = vec![
            DisplayEvent::Data(calculated),
            DisplayEvent::Filtered(filtered),
        ];
        events.extend(toi_means.into_iter().map(DisplayEvent::Toi));
        events
    }
}

/// Per-channel mean over every point of a block, first `cells` channels only
fn block_mean(block: &DownSampledBlock, cells: usize) -> Vec<f64> {
    let n = block.len().max(1) as f64;
    let width = block.first().map_or(0, |p| p.len()).min(cells);
    (0..width)
        .map(|c| block.iter().map(|p| p[c]).sum::<f64>() / n)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::parser::encode_chunk;
    use tokio::sync::mpsc::unbounded_channel;

    const SHAPE: BatchShape = BatchShape {
        batch_size: 10,
        elements_per_point: 7,
    };

    fn flat_chunk(value: i32) -> Vec<u8> {
        let cells: Vec<i32> = (0..SHAPE.batch_size)
            .flat_map(|_| [value, value, value, value, value, value, 0])
            .collect();
        encode_chunk(&cells)
    }

    #[test]
    fn test_calibration_point_averages_every_batch() {
        let (tx, mut rx) = unbounded_channel();
        let mut pipeline = Pipeline::calibration(SHAPE, 10, tx);

        for n in 1..=10 {
            pipeline.process_chunk(&flat_chunk(n * 100)).unwrap();
        }

        match rx.try_recv() {
            Ok(DisplayEvent::Calibration(cells)) => {
                assert_eq!(cells, vec![550.0; CALIBRATION_CELLS]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_calibration_waits_for_full_block() {
        let (tx, mut rx) = unbounded_channel();
        let mut pipeline = Pipeline::calibration(SHAPE, 10, tx);
        for _ in 0..9 {
            pipeline.process_chunk(&flat_chunk(100)).unwrap();
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(pipeline.batches(), 9);
    }

    #[test]
    fn test_block_mean_limits_cells() {
        let block = vec![vec![1.0, 2.0, 3.0], vec![3.0, 4.0, 5.0]];
        assert_eq!(block_mean(&block, 2), vec![2.0, 3.0]);
    }
}
