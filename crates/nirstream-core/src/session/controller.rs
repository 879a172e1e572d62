//! Session state machine
//!
//! `idle -> recording -> paused -> continuing -> recording -> idle`, plus
//! `idle -> calibrating -> idle`. Every transition runs on the session
//! thread; the controller never blocks on the display channel.

use super::events::DisplayEvent;
use super::pipeline::{BatchShape, Pipeline, RecordingSetup};
use super::power::PowerBlock;
use super::{SessionOptions, SessionState, SessionStatus};
use crate::device::probe::{CalibrationStore, Probe};
use crate::device::{Chunk, DeviceInfo, Instrument};
use crate::dsp::downsampler::down_sample_factor;
use crate::dsp::timestamp::TimestampGenerator;
use crate::error::NirsError;
use crate::storage::writer::PersistenceWriter;
use crate::storage::RecordingStore;
use crossbeam_channel::Receiver;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

/// Batches averaged into one calibration display point
pub const CALIBRATION_BLOCK_BATCHES: usize = 10;

/// Recording parameters kept while paused
struct PausedRecording {
    recording_id: u64,
    probe: Probe,
    factor: usize,
    timestamps: TimestampGenerator,
}

/// Sync command waiting for the instrument's startup delay
struct PendingSync {
    due: Instant,
    command: String,
}

/// Drives one instrument through its recording lifecycle
pub struct SessionController {
    instrument: Box<dyn Instrument>,
    calibration: Arc<dyn CalibrationStore>,
    store: Arc<dyn RecordingStore>,
    display: UnboundedSender<DisplayEvent>,
    options: SessionOptions,

    state: SessionState,
    recording_id: Option<u64>,
    /// Probe and factor of the active recording, for pause
    active: Option<(Probe, usize)>,
    paused: Option<PausedRecording>,
    pipeline: Option<Pipeline>,
    chunks: Option<Receiver<Chunk>>,
    logs: Option<Receiver<String>>,
    pending_sync: Option<PendingSync>,
    power: Option<PowerBlock>,
    events: BTreeSet<String>,
}

impl SessionController {
    pub fn new(
        instrument: Box<dyn Instrument>,
        calibration: Arc<dyn CalibrationStore>,
        store: Arc<dyn RecordingStore>,
        display: UnboundedSender<DisplayEvent>,
        options: SessionOptions,
    ) -> Self {
        Self {
            instrument,
            calibration,
            store,
            display,
            options,
            state: SessionState::Idle,
            recording_id: None,
            active: None,
            paused: None,
            pipeline: None,
            chunks: None,
            logs: None,
            pending_sync: None,
            power: None,
            events: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Telemetry receiver while the instrument is streaming
    pub fn chunk_receiver(&self) -> Option<&Receiver<Chunk>> {
        self.chunks.as_ref()
    }

    /// Firmware log receiver while the instrument is open
    pub fn log_receiver(&self) -> Option<&Receiver<String>> {
        self.logs.as_ref()
    }

    /// When the pending sync command is due
    pub fn sync_deadline(&self) -> Option<Instant> {
        self.pending_sync.as_ref().map(|p| p.due)
    }

    pub fn status(&self) -> SessionStatus {
        let info = self.instrument.info();
        SessionStatus {
            state: self.state,
            device: info.name,
            sampling_rate: info.sampling_rate,
            recording_id: self.recording_id,
            target_rate: self.active.as_ref().map(|(probe, _)| probe.sampling_rate),
            batches: self.pipeline.as_ref().map(|p| p.batches()).unwrap_or(0),
            active_events: self.events.iter().cloned().collect(),
            power_block: self.power.as_ref().map(|p| p.id()),
        }
    }

    /// Start recording `recording_id`
    ///
    /// With `resume`, timestamps continue from the recording's last
    /// persisted row. All validation happens before the device is touched.
    pub fn start_recording(&mut self, recording_id: u64, resume: bool) -> Result<(), NirsError> {
        let probe = self.calibration.current_probe().ok_or_else(|| {
            NirsError::Configuration("no active probe calibration".to_string())
        })?;
        let info = self.instrument.info();
        let factor = down_sample_factor(info.sampling_rate, probe.sampling_rate)?;
        let resume_from = if resume {
            self.store.last_timestamp(recording_id)?
        } else {
            None
        };

        self.teardown();
        let timestamps = TimestampGenerator::new(info.batch_size, probe.sampling_rate, resume_from);

        tracing::info!(
            recording_id,
            raw_rate = info.sampling_rate,
            target_rate = probe.sampling_rate,
            factor,
            resume_from,
            "Starting recording"
        );
        if let Err(e) = self.open_recording(&info, recording_id, probe, factor, timestamps) {
            self.set_state(SessionState::Idle);
            return Err(e);
        }
        self.set_state(SessionState::Recording);
        Ok(())
    }

    /// Stream averaged raw cells for probe calibration, with no persistence
    pub fn start_calibration(&mut self, probe: Probe) -> Result<(), NirsError> {
        let info = self.instrument.info();
        self.teardown();

        let pipeline = Pipeline::calibration(
            shape_of(&info),
            CALIBRATION_BLOCK_BATCHES,
            self.display.clone(),
        );
        tracing::info!(probe = %probe.name, "Starting calibration stream");
        if let Err(e) = self.open_stream(&info, &probe, pipeline) {
            self.set_state(SessionState::Idle);
            return Err(e);
        }
        self.set_state(SessionState::Calibrating);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), NirsError> {
        if !matches!(
            self.state,
            SessionState::Recording | SessionState::Continuing
        ) {
            return Err(NirsError::InvalidState(format!(
                "cannot pause while {:?}",
                self.state
            )));
        }

        let timestamps = self.detach();
        let recording_id = self.recording_id;
        let active = self.active.take();
        if let (Some(recording_id), Some((probe, factor)), Some(timestamps)) =
            (recording_id, active, timestamps)
        {
            self.paused = Some(PausedRecording {
                recording_id,
                probe,
                factor,
                timestamps,
            });
        }
        tracing::info!(?recording_id, "Recording paused");
        self.set_state(SessionState::Paused);
        Ok(())
    }

    /// Reopen the instrument for the paused recording
    ///
    /// The time axis carries on from the pause. Filters, down-sampler and
    /// calculation reference start fresh.
    pub fn continue_recording(&mut self) -> Result<(), NirsError> {
        let paused = self.paused.take().ok_or_else(|| {
            NirsError::InvalidState(format!("cannot continue while {:?}", self.state))
        })?;
        let info = self.instrument.info();

        tracing::info!(recording_id = paused.recording_id, "Continuing recording");
        let PausedRecording {
            recording_id,
            probe,
            factor,
            timestamps,
        } = paused;
        if let Err(e) = self.open_recording(&info, recording_id, probe, factor, timestamps) {
            self.set_state(SessionState::Idle);
            return Err(e);
        }
        self.set_state(SessionState::Continuing);
        Ok(())
    }

    /// Stop whatever the session is doing and return to idle
    pub fn stop(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        self.teardown();
        tracing::info!("Session stopped");
        self.set_state(SessionState::Idle);
    }

    /// Mark or unmark a named event on the rows that follow
    pub fn toggle_event(&mut self, name: String, active: bool) {
        if active {
            self.events.insert(name);
        } else {
            self.events.remove(&name);
        }
        let any = !self.events.is_empty();
        if let Some(pipeline) = self.pipeline.as_mut() {
            pipeline.set_event_active(any);
        }
    }

    pub fn on_chunk(&mut self, chunk: &[u8]) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            return;
        };
        match pipeline.process_chunk(chunk) {
            Ok(()) => {
                if self.state == SessionState::Continuing {
                    self.set_state(SessionState::Recording);
                }
            }
            Err(e) if !e.is_fatal() => {
                tracing::warn!(error = %e, "Dropped telemetry chunk");
            }
            Err(e) => self.fail(e),
        }
    }

    /// The instrument closed its telemetry stream without being asked to
    pub fn on_stream_closed(&mut self) {
        self.chunks = None;
        if self.state != SessionState::Idle {
            self.fail(NirsError::Device(crate::device::DeviceError::Open(
                "telemetry stream closed".to_string(),
            )));
        }
    }

    pub fn on_log(&mut self, line: String) {
        tracing::debug!(device_log = %line);
        if self.state == SessionState::Calibrating {
            self.emit(DisplayEvent::Log(line));
        }
    }

    pub fn on_log_closed(&mut self) {
        self.logs = None;
    }

    /// Connect the command channel and send the sync command
    pub fn on_sync_due(&mut self) {
        let Some(pending) = self.pending_sync.take() else {
            return;
        };
        let result = self
            .instrument
            .connect_input()
            .and_then(|()| self.instrument.send_command(&pending.command));
        match result {
            Ok(()) => tracing::info!(command = %pending.command, "Instrument synchronised"),
            Err(e) => self.fail(e.into()),
        }
    }

    /// Release every device resource, leaving state untouched
    pub fn teardown(&mut self) {
        self.detach();
        self.active = None;
        self.paused = None;
        self.recording_id = None;
    }

    fn open_recording(
        &mut self,
        info: &DeviceInfo,
        recording_id: u64,
        probe: Probe,
        factor: usize,
        timestamps: TimestampGenerator,
    ) -> Result<(), NirsError> {
        let persistence =
            PersistenceWriter::new(Arc::clone(&self.store), Some(self.display.clone())).spawn()?;
        let mut pipeline = Pipeline::recording(
            shape_of(info),
            RecordingSetup {
                recording_id,
                factor,
                target_rate: probe.sampling_rate,
                timestamps,
                filter_cutoff_hz: self.options.filter_cutoff_hz,
                parallel_calculation: self.options.parallel_calculation,
                persistence,
            },
            self.display.clone(),
        )?;
        pipeline.set_event_active(!self.events.is_empty());

        self.open_stream(info, &probe, pipeline)?;
        self.recording_id = Some(recording_id);
        self.active = Some((probe, factor));
        Ok(())
    }

    fn open_stream(
        &mut self,
        info: &DeviceInfo,
        probe: &Probe,
        pipeline: Pipeline,
    ) -> Result<(), NirsError> {
        let chunks = self.instrument.start()?;
        self.logs = self.instrument.log_stream();
        self.chunks = Some(chunks);
        self.pipeline = Some(pipeline);
        self.pending_sync = Some(PendingSync {
            due: Instant::now() + info.startup_delay,
            command: probe.sync_command(),
        });
        self.power = Some(PowerBlock::acquire());
        Ok(())
    }

    /// Detach from the instrument and flush persistence
    fn detach(&mut self) -> Option<TimestampGenerator> {
        self.chunks = None;
        self.pending_sync = None;
        self.instrument.close_input();
        self.instrument.stop();
        self.logs = None;
        self.power = None;
        self.pipeline.take().and_then(Pipeline::finish)
    }

    fn fail(&mut self, error: NirsError) {
        tracing::error!(error = %error, state = ?self.state, "Session failed");
        self.teardown();
        self.emit(DisplayEvent::Error(error.to_string()));
        self.set_state(SessionState::Idle);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "Session state changed");
            self.state = state;
            self.emit(DisplayEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: DisplayEvent) {
        let _ = self.display.send(event);
    }
}

fn shape_of(info: &DeviceInfo) -> BatchShape {
    BatchShape {
        batch_size: info.batch_size,
        elements_per_point: info.elements_per_point,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::probe::StaticCalibration;
    use crate::device::simulated::{SimulatedInstrument, SimulatorControl};
    use crate::storage::memory::MemoryStore;
    use crate::storage::{RecordingRow, StoreError};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn probe(rate: u32) -> Probe {
        Probe {
            name: "Adult".to_string(),
            intensities: vec![10, 20, 30, 40, 50],
            gain: 3,
            pre_gain: 1,
            sampling_rate: rate,
        }
    }

    fn controller(
        probe: Option<Probe>,
    ) -> (
        SessionController,
        SimulatorControl,
        UnboundedReceiver<DisplayEvent>,
    ) {
        controller_with_store(probe, Arc::new(MemoryStore::new()))
    }

    fn controller_with_store(
        probe: Option<Probe>,
        store: Arc<dyn RecordingStore>,
    ) -> (
        SessionController,
        SimulatorControl,
        UnboundedReceiver<DisplayEvent>,
    ) {
        let (instrument, control) = SimulatedInstrument::manual();
        let (tx, rx) = unbounded_channel();
        let controller = SessionController::new(
            Box::new(instrument),
            Arc::new(StaticCalibration::new(probe)),
            store,
            tx,
            SessionOptions::default(),
        );
        (controller, control, rx)
    }

    /// Store whose resume lookup always fails
    #[derive(Default)]
    struct BrokenResumeStore {
        inner: MemoryStore,
    }

    impl RecordingStore for BrokenResumeStore {
        fn insert_batch(&self, rows: &[RecordingRow]) -> Result<(), StoreError> {
            self.inner.insert_batch(rows)
        }

        fn query_interval(
            &self,
            recording_id: u64,
            start: f64,
            end: f64,
        ) -> Result<Vec<RecordingRow>, StoreError> {
            self.inner.query_interval(recording_id, start, end)
        }

        fn query_recent_events(&self, recording_id: u64) -> Result<Vec<RecordingRow>, StoreError> {
            self.inner.query_recent_events(recording_id)
        }

        fn query_from(
            &self,
            recording_id: u64,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<RecordingRow>, StoreError> {
            self.inner.query_from(recording_id, offset, limit)
        }

        fn last_timestamp(&self, _recording_id: u64) -> Result<Option<f64>, StoreError> {
            Err(StoreError::Query("disk I/O error".to_string()))
        }
    }

    #[test]
    fn test_missing_probe_fails_before_device_io() {
        let (mut c, control, _rx) = controller(None);
        assert!(matches!(
            c.start_recording(1, false),
            Err(NirsError::Configuration(_))
        ));
        assert_eq!(control.start_count(), 0);
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn test_fractional_factor_fails_before_device_io() {
        let (mut c, control, _rx) = controller(Some(probe(30)));
        assert!(matches!(
            c.start_recording(1, false),
            Err(NirsError::Configuration(_))
        ));
        assert_eq!(control.start_count(), 0);
    }

    #[test]
    fn test_sync_command_sent_when_due() {
        let (mut c, control, _rx) = controller(Some(probe(100)));
        c.start_recording(1, false).unwrap();
        assert!(c.sync_deadline().is_some());
        c.on_sync_due();
        assert_eq!(control.commands(), vec!["10,20,30,40,50,1,3".to_string()]);
        assert!(c.sync_deadline().is_none());
    }

    #[test]
    fn test_pause_releases_device_and_continue_reopens() {
        let (mut c, control, _rx) = controller(Some(probe(100)));
        c.start_recording(1, false).unwrap();
        assert!(c.status().power_block.is_some());

        c.pause().unwrap();
        assert_eq!(c.state(), SessionState::Paused);
        assert!(c.chunk_receiver().is_none());
        assert!(!control.is_streaming());
        assert!(c.status().power_block.is_none());

        c.continue_recording().unwrap();
        assert_eq!(c.state(), SessionState::Continuing);
        assert!(control.is_streaming());
        assert_eq!(control.start_count(), 2);
    }

    #[test]
    fn test_failed_resume_keeps_running_session() {
        let (mut c, control, _rx) =
            controller_with_store(Some(probe(100)), Arc::new(BrokenResumeStore::default()));
        c.start_recording(1, false).unwrap();

        let result = c.start_recording(1, true);
        assert!(matches!(result, Err(NirsError::Storage(_))));
        // The lookup fails before the running recording is torn down
        assert_eq!(c.state(), SessionState::Recording);
        assert!(control.is_streaming());
        assert!(c.chunk_receiver().is_some());
        assert_eq!(c.status().recording_id, Some(1));
        c.stop();
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn test_failed_resume_from_pause_keeps_paused_recording() {
        let (mut c, control, _rx) =
            controller_with_store(Some(probe(100)), Arc::new(BrokenResumeStore::default()));
        c.start_recording(1, false).unwrap();
        c.pause().unwrap();

        assert!(c.start_recording(2, true).is_err());
        assert_eq!(c.state(), SessionState::Paused);
        assert!(!control.is_streaming());
        c.continue_recording().unwrap();
        assert_eq!(c.state(), SessionState::Continuing);
    }

    #[test]
    fn test_pause_while_idle_is_rejected() {
        let (mut c, _control, _rx) = controller(Some(probe(100)));
        assert!(matches!(c.pause(), Err(NirsError::InvalidState(_))));
        assert!(matches!(
            c.continue_recording(),
            Err(NirsError::InvalidState(_))
        ));
    }

    #[test]
    fn test_fatal_chunk_error_returns_to_idle() {
        let (mut c, _control, mut rx) = controller(Some(probe(100)));
        c.start_recording(1, false).unwrap();
        c.on_stream_closed();
        assert_eq!(c.state(), SessionState::Idle);

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, DisplayEvent::Error(_)) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }
}
