//! Hardware-free oximeter
//!
//! Produces V5-shaped telemetry: five LED readings riding on a cardiac pulse
//! and a slow oxygenation drift, a dark reading, and a sample counter.
//!
//! Two modes:
//! - [`SimulationMode::Paced`]: a generator thread emits one chunk per batch
//!   period on a drift-free schedule.
//! - [`SimulationMode::Manual`]: nothing is generated; chunks are pushed
//!   through [`SimulatorControl::push_chunk`].

use super::parser::encode_chunk;
use super::{Chunk, DeviceError, DeviceInfo, Instrument};
use crate::timer::Pacer;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Chunks buffered between the generator and the session
const CHUNK_QUEUE_DEPTH: usize = 64;

/// Resting LED intensities in counts, dark-corrected
const LED_BASELINE: [f64; 5] = [18_000.0, 21_000.0, 24_000.0, 27_000.0, 25_000.0];

/// Ambient reading in counts
const DARK_LEVEL: i32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationMode {
    Paced,
    Manual,
}

#[derive(Debug, Default)]
struct SimShared {
    commands: Mutex<Vec<String>>,
    manual_tx: Mutex<Option<Sender<Chunk>>>,
    streaming: AtomicBool,
    input_open: AtomicBool,
    starts: AtomicUsize,
}

/// Observer and driver for a [`SimulatedInstrument`] owned by a session
#[derive(Debug, Clone)]
pub struct SimulatorControl {
    shared: Arc<SimShared>,
}

impl SimulatorControl {
    /// Commands received over the command channel, oldest first
    pub fn commands(&self) -> Vec<String> {
        self.shared
            .commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Push a chunk in manual mode. Returns false when nobody is listening.
    pub fn push_chunk(&self, chunk: Chunk) -> bool {
        let guard = match self.shared.manual_tx.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match guard.as_ref() {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }

    /// True between `start` and `stop`
    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    pub fn is_input_open(&self) -> bool {
        self.shared.input_open.load(Ordering::Acquire)
    }

    /// Number of times the device was started
    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::Relaxed)
    }
}

/// Simulated V5 oximeter
pub struct SimulatedInstrument {
    info: DeviceInfo,
    mode: SimulationMode,
    shared: Arc<SimShared>,
    stop_flag: Arc<AtomicBool>,
    generator: Option<std::thread::JoinHandle<()>>,
    log_tx: Option<Sender<String>>,
    log_rx: Option<Receiver<String>>,
}

impl SimulatedInstrument {
    /// Create a simulator and the control handle observing it
    pub fn new(info: DeviceInfo, mode: SimulationMode) -> (Self, SimulatorControl) {
        let shared = Arc::new(SimShared::default());
        let control = SimulatorControl {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                info,
                mode,
                shared,
                stop_flag: Arc::new(AtomicBool::new(false)),
                generator: None,
                log_tx: None,
                log_rx: None,
            },
            control,
        )
    }

    /// Paced simulator with the default V5 shape
    pub fn paced() -> (Self, SimulatorControl) {
        Self::new(DeviceInfo::default(), SimulationMode::Paced)
    }

    /// Manual simulator with the default V5 shape and no startup delay
    pub fn manual() -> (Self, SimulatorControl) {
        let info = DeviceInfo {
            startup_delay: Duration::ZERO,
            ..DeviceInfo::default()
        };
        Self::new(info, SimulationMode::Manual)
    }

    fn log(&self, line: String) {
        if let Some(tx) = &self.log_tx {
            let _ = tx.send(line);
        }
    }

    fn spawn_generator(&mut self, tx: Sender<Chunk>) -> Result<(), DeviceError> {
        let info = self.info.clone();
        let stop_flag = Arc::clone(&self.stop_flag);
        let batch_period =
            Duration::from_secs_f64(info.batch_size as f64 / info.sampling_rate.max(1) as f64);

        let handle = std::thread::Builder::new()
            .name("nirs-simulator".into())
            .spawn(move || {
                let mut pacer = Pacer::new(batch_period);
                let mut cells = vec![0i32; info.batch_cells()];
                let mut sample = 0u64;

                while !stop_flag.load(Ordering::Acquire) {
                    pacer.wait_blocking();
                    for point in cells.chunks_exact_mut(info.elements_per_point) {
                        synth_point(sample, info.sampling_rate, point);
                        sample += 1;
                    }
                    match tx.send_timeout(encode_chunk(&cells), batch_period) {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(_)) => {
                            tracing::warn!(sample, "Simulator queue full, chunk dropped");
                        }
                        Err(SendTimeoutError::Disconnected(_)) => break,
                    }
                }
                tracing::debug!(samples = sample, "Simulator generator exited");
            })
            .map_err(|e| DeviceError::Open(e.to_string()))?;

        self.generator = Some(handle);
        Ok(())
    }
}

impl Instrument for SimulatedInstrument {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn start(&mut self) -> Result<Receiver<Chunk>, DeviceError> {
        self.stop();

        let (tx, rx) = crossbeam_channel::bounded(CHUNK_QUEUE_DEPTH);
        let (log_tx, log_rx) = crossbeam_channel::unbounded();
        self.log_tx = Some(log_tx);
        self.log_rx = Some(log_rx);
        self.stop_flag.store(false, Ordering::Release);

        match self.mode {
            SimulationMode::Paced => self.spawn_generator(tx)?,
            SimulationMode::Manual => {
                if let Ok(mut manual) = self.shared.manual_tx.lock() {
                    *manual = Some(tx);
                }
            }
        }

        self.shared.streaming.store(true, Ordering::Release);
        self.shared.starts.fetch_add(1, Ordering::Relaxed);
        self.log(format!("{} started at {} Hz", self.info.name, self.info.sampling_rate));
        tracing::info!(device = %self.info.name, mode = ?self.mode, "Simulated instrument started");
        Ok(rx)
    }

    fn connect_input(&mut self) -> Result<(), DeviceError> {
        if !self.shared.streaming.load(Ordering::Acquire) {
            return Err(DeviceError::NotStarted);
        }
        self.shared.input_open.store(true, Ordering::Release);
        self.log("command channel open".to_string());
        Ok(())
    }

    fn send_command(&mut self, message: &str) -> Result<(), DeviceError> {
        if !self.shared.input_open.load(Ordering::Acquire) {
            return Err(DeviceError::InputNotConnected);
        }
        self.shared
            .commands
            .lock()
            .map_err(|_| DeviceError::Command("command log poisoned".to_string()))?
            .push(message.to_string());
        self.log(format!("received {}", message));
        Ok(())
    }

    fn close_input(&mut self) {
        self.shared.input_open.store(false, Ordering::Release);
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Ok(mut manual) = self.shared.manual_tx.lock() {
            *manual = None;
        }
        if let Some(handle) = self.generator.take() {
            let _ = handle.join();
        }
        self.log_tx = None;
        if self.shared.streaming.swap(false, Ordering::AcqRel) {
            tracing::info!(device = %self.info.name, "Simulated instrument stopped");
        }
    }

    fn log_stream(&mut self) -> Option<Receiver<String>> {
        self.log_rx.take()
    }
}

impl Drop for SimulatedInstrument {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fill one V5 point for sample number `n`
pub fn synth_point(n: u64, sampling_rate: u32, point: &mut [i32]) {
    let t = n as f64 / sampling_rate.max(1) as f64;
    let pulse = (2.0 * PI * 1.2 * t).sin();
    let drift = (2.0 * PI * 0.02 * t).sin();

    for (i, cell) in point.iter_mut().take(LED_BASELINE.len()).enumerate() {
        // Short wavelengths brighten as oxygenation rises, long ones dim
        let oxy_sign = if i < 2 { 1.0 } else { -1.0 };
        let level = LED_BASELINE[i] * (1.0 + 0.004 * pulse + 0.01 * oxy_sign * drift);
        *cell = level as i32 + DARK_LEVEL;
    }
    if let Some(dark) = point.get_mut(5) {
        *dark = DARK_LEVEL;
    }
    if let Some(counter) = point.get_mut(6) {
        *counter = (n & 0xFFFF) as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synth_point_layout() {
        let mut point = [0i32; 7];
        synth_point(3, 100, &mut point);
        assert_eq!(point[5], DARK_LEVEL);
        assert_eq!(point[6], 3);
        assert!(point[1] > DARK_LEVEL);
    }

    #[test]
    fn test_manual_push_reaches_receiver() {
        let (mut sim, control) = SimulatedInstrument::manual();
        assert!(!control.push_chunk(vec![0; 4]));
        let rx = sim.start().unwrap();
        assert!(control.push_chunk(vec![1, 2, 3, 4]));
        assert_eq!(rx.recv().unwrap(), vec![1, 2, 3, 4]);
        sim.stop();
        assert!(!control.push_chunk(vec![0; 4]));
    }

    #[test]
    fn test_commands_need_open_input() {
        let (mut sim, control) = SimulatedInstrument::manual();
        let _rx = sim.start().unwrap();
        assert!(matches!(
            sim.send_command("1,2"),
            Err(DeviceError::InputNotConnected)
        ));
        sim.connect_input().unwrap();
        sim.send_command("1,2").unwrap();
        assert_eq!(control.commands(), vec!["1,2".to_string()]);
    }

    #[test]
    fn test_paced_generator_emits_whole_batches() {
        let info = DeviceInfo {
            batch_size: 5,
            sampling_rate: 500,
            ..DeviceInfo::default()
        };
        let (mut sim, _control) = SimulatedInstrument::new(info.clone(), SimulationMode::Paced);
        let rx = sim.start().unwrap();
        let chunk = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(chunk.len(), info.batch_cells() * 4);
        sim.stop();
    }
}
