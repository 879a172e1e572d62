//! Standalone export server for E2E testing
//!
//! Fills an in-memory store with a synthetic recording and serves it. No
//! instrument is required; clients connect and send `start` to play it.

use nirstream_core::device::simulated::synth_point;
use nirstream_core::dsp::calculation::CalculationEngine;
use nirstream_core::dsp::timestamp::TimestampGenerator;
use nirstream_core::storage::{RecordingRow, RecordingStore};
use nirstream_core::{MemoryStore, DEFAULT_ELEMENTS_PER_POINT, DEFAULT_SAMPLING_RATE};
use nirstream_server::{ExportConfig, ExportServer};
use std::sync::Arc;

const RECORDING_ID: u64 = 1;

fn synthetic_recording(store: &MemoryStore, seconds: u64) -> anyhow::Result<()> {
    let rate = DEFAULT_SAMPLING_RATE;
    let batch = 25;
    let mut engine = CalculationEngine::new(DEFAULT_ELEMENTS_PER_POINT);
    let mut timestamps = TimestampGenerator::new(batch, rate, None);
    let mut point = vec![0i32; DEFAULT_ELEMENTS_PER_POINT];
    let mut n = 0u64;

    for _ in 0..(seconds * rate as u64 / batch as u64) {
        let mut rows = Vec::with_capacity(batch);
        for i in 0..batch {
            synth_point(n, rate, &mut point);
            n += 1;
            let cells: Vec<f64> = point.iter().map(|&c| c as f64).collect();
            rows.push(RecordingRow {
                recording_id: RECORDING_ID,
                time_stamp: timestamps.stamp(i),
                values: engine.process_point(&cells),
                raw: point.clone(),
                event: false,
            });
        }
        store.insert_batch(&rows)?;
        timestamps.advance();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nirstream=debug".parse()?),
        )
        .init();

    let mut config = ExportConfig::default();
    if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
        config.ports = vec![port];
    }
    let seconds = std::env::var("DEMO_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60u64);

    let store = Arc::new(MemoryStore::new());
    synthetic_recording(&store, seconds)?;
    tracing::info!(rows = store.row_count(RECORDING_ID), "Synthetic recording ready");

    let server = ExportServer::start(config, store, None).await?;
    server.state().select_recording(RECORDING_ID);
    tracing::info!(port = server.port(), "Export server starting");

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}
