//! Device session
//!
//! A session owns one instrument and runs on a dedicated thread. Chunks,
//! firmware log lines, the startup-delay timer and control commands are
//! multiplexed with `crossbeam_channel::select!` and each is handled to
//! completion before the next is looked at.
//!
//! [`SessionHandle`] is the async front end: every call sends a command
//! carrying a oneshot reply and awaits it.

pub mod controller;
pub mod events;
pub mod pipeline;
pub mod power;
pub mod worker;

use crate::device::probe::{CalibrationStore, Probe};
use crate::device::Instrument;
use crate::storage::RecordingStore;
use controller::SessionController;
use crossbeam_channel::{at, never, select, Sender};
use events::DisplayEvent;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

/// Lifecycle state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Recording,
    Paused,
    /// Reopened after a pause, waiting for the first chunk
    Continuing,
    /// Display-only stream used while calibrating a probe
    Calibrating,
}

/// Tunables of the processing chain
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Run the calculation engine on its own thread (full-rate path only)
    pub parallel_calculation: bool,
    /// Cutoff of the display smoothing filter in Hz
    pub filter_cutoff_hz: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            parallel_calculation: false,
            filter_cutoff_hz: crate::dsp::filter::DEFAULT_CUTOFF_HZ,
        }
    }
}

/// Session status snapshot (safe to send between threads)
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub device: String,
    pub sampling_rate: u32,
    pub recording_id: Option<u64>,
    pub target_rate: Option<u32>,
    /// Chunks processed by the current pipeline
    pub batches: u64,
    pub active_events: Vec<String>,
    pub power_block: Option<u64>,
}

/// Commands sent to the session thread
pub enum SessionCommand {
    StartRecording {
        recording_id: u64,
        resume: bool,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    StartCalibration {
        probe: Probe,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Pause {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Continue {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    ToggleEvent {
        name: String,
        active: bool,
    },
    GetStatus {
        reply: oneshot::Sender<SessionStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to communicate with the session thread
#[derive(Clone)]
pub struct SessionHandle {
    tx: Sender<SessionCommand>,
}

impl SessionHandle {
    /// Spawn a session for `instrument` on a dedicated thread
    pub fn spawn(
        instrument: Box<dyn Instrument>,
        calibration: Arc<dyn CalibrationStore>,
        store: Arc<dyn RecordingStore>,
        display: UnboundedSender<DisplayEvent>,
        options: SessionOptions,
    ) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<SessionCommand>();

        std::thread::Builder::new()
            .name("nirs-session".into())
            .spawn(move || {
                let mut controller =
                    SessionController::new(instrument, calibration, store, display, options);

                loop {
                    let chunks = controller.chunk_receiver().cloned().unwrap_or_else(never);
                    let logs = controller.log_receiver().cloned().unwrap_or_else(never);
                    let sync = controller.sync_deadline().map(at).unwrap_or_else(never);

                    select! {
                        recv(rx) -> msg => match msg {
                            Ok(SessionCommand::Shutdown { reply }) => {
                                controller.stop();
                                let _ = reply.send(());
                                break;
                            }
                            Ok(cmd) => handle_command(&mut controller, cmd),
                            Err(_) => {
                                controller.stop();
                                break;
                            }
                        },
                        recv(chunks) -> msg => match msg {
                            Ok(chunk) => controller.on_chunk(&chunk),
                            Err(_) => controller.on_stream_closed(),
                        },
                        recv(logs) -> msg => match msg {
                            Ok(line) => controller.on_log(line),
                            Err(_) => controller.on_log_closed(),
                        },
                        recv(sync) -> _ => controller.on_sync_due(),
                    }
                }
                tracing::debug!("Session thread exiting");
            })?;

        Ok(Self { tx })
    }

    fn send(&self, cmd: SessionCommand) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("Session thread died"))
    }

    /// Start recording, optionally resuming an existing recording's time axis
    pub async fn start_recording(&self, recording_id: u64, resume: bool) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::StartRecording {
            recording_id,
            resume,
            reply,
        })?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Session thread died"))?
    }

    pub async fn start_calibration(&self, probe: Probe) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::StartCalibration { probe, reply })?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Session thread died"))?
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Pause { reply })?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Session thread died"))?
    }

    /// Resume a paused recording
    pub async fn continue_recording(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Continue { reply })?;
        rx.await
            .map_err(|_| anyhow::anyhow!("Session thread died"))?
    }

    /// Stop the session. Returns once the instrument is detached and
    /// persistence is flushed.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Stop { reply })?;
        rx.await.map_err(|_| anyhow::anyhow!("Session thread died"))
    }

    pub fn toggle_event(&self, name: impl Into<String>, active: bool) -> anyhow::Result<()> {
        self.send(SessionCommand::ToggleEvent {
            name: name.into(),
            active,
        })
    }

    pub async fn get_status(&self) -> anyhow::Result<SessionStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::GetStatus { reply })?;
        rx.await.map_err(|_| anyhow::anyhow!("Session thread died"))
    }

    /// Stop the session and end its thread
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Shutdown { reply })?;
        rx.await.map_err(|_| anyhow::anyhow!("Session thread died"))
    }
}

fn handle_command(controller: &mut SessionController, cmd: SessionCommand) {
    match cmd {
        SessionCommand::StartRecording {
            recording_id,
            resume,
            reply,
        } => {
            let _ = reply.send(
                controller
                    .start_recording(recording_id, resume)
                    .map_err(Into::into),
            );
        }
        SessionCommand::StartCalibration { probe, reply } => {
            let _ = reply.send(controller.start_calibration(probe).map_err(Into::into));
        }
        SessionCommand::Pause { reply } => {
            let _ = reply.send(controller.pause().map_err(Into::into));
        }
        SessionCommand::Continue { reply } => {
            let _ = reply.send(controller.continue_recording().map_err(Into::into));
        }
        SessionCommand::Stop { reply } => {
            controller.stop();
            let _ = reply.send(());
        }
        SessionCommand::ToggleEvent { name, active } => {
            controller.toggle_event(name, active);
        }
        SessionCommand::GetStatus { reply } => {
            let _ = reply.send(controller.status());
        }
        SessionCommand::Shutdown { reply } => {
            controller.stop();
            let _ = reply.send(());
        }
    }
}
