//! E2E tests for the signal path
//!
//! Down-sampling averages, timestamp continuity, filter convergence and the
//! haemoglobin calculation on simulated telemetry.

use approx::assert_relative_eq;
use nirstream::device::buffer::shared_buffer;
use nirstream::device::parser::{encode_chunk, parse_chunk};
use nirstream::device::simulated::synth_point;
use nirstream::dsp::downsampler::down_sample_factor;
use nirstream::{CalculationEngine, DownSampler, LowPassFilter, NirsError, TimestampGenerator};

#[test]
fn test_down_sample_100_to_25_averages_four_samples() {
    let factor = down_sample_factor(100, 25).unwrap();
    assert_eq!(factor, 4);

    // One cell per point, one point per batch
    let mut sampler = DownSampler::new(factor, 1, 1);
    for value in [10, 20, 30, 40] {
        assert!(!sampler.is_ready());
        sampler.down_sample(&[value]);
    }
    let block = sampler.take_single().unwrap().unwrap();
    assert_relative_eq!(block[0][0], 25.0);
    assert!(sampler.take_single().unwrap().is_none());
}

#[test]
fn test_non_whole_factor_is_configuration_error() {
    assert!(matches!(
        down_sample_factor(100, 30),
        Err(NirsError::Configuration(_))
    ));
}

#[test]
fn test_resumed_time_axis_continues() {
    let mut first = TimestampGenerator::new(10, 100, None);
    let mut last = 0.0;
    for _ in 0..5 {
        for i in 0..10 {
            let ts = first.stamp(i);
            assert!(ts >= last);
            last = ts;
        }
        first.advance();
    }

    let resumed = TimestampGenerator::new(10, 100, Some(last));
    assert_relative_eq!(resumed.stamp(0), last + 10.0);
}

#[test]
fn test_filter_converges_on_constant_input() {
    let mut filter = LowPassFilter::new(1.0, 100.0);
    let mut out = 0.0;
    for _ in 0..2_000 {
        out = filter.single_step(42.0);
    }
    assert_relative_eq!(out, 42.0, epsilon = 1e-9);
}

#[test]
fn test_simulated_telemetry_through_parser_and_engine() {
    let elements = nirstream::DEFAULT_ELEMENTS_PER_POINT;
    let batch_size = nirstream::DEFAULT_BATCH_SIZE;
    let mut cells = vec![0i32; batch_size * elements];
    for (n, point) in cells.chunks_exact_mut(elements).enumerate() {
        synth_point(n as u64, 100, point);
    }

    let (mut writer, reader) = shared_buffer(cells.len());
    parse_chunk(&encode_chunk(&cells), &mut writer).unwrap();
    assert_eq!(reader.snapshot(), cells);

    let mut engine = CalculationEngine::new(elements);
    let values = engine.process_raw_batch(&reader.snapshot(), batch_size);
    assert_eq!(values.len(), batch_size);
    // The first sample is the reference
    assert_relative_eq!(values[0].o2hb, 0.0);
    assert_relative_eq!(values[0].thb, values[0].o2hb + values[0].hhb);
    assert!(values.iter().all(|v| (0.0..=100.0).contains(&v.toi)));
}
