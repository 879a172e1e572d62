//! Playback of a stored recording to every attached client
//!
//! One cursor per server. Each `start` bumps the cursor's run id and spawns
//! an emission loop bound to that id; a loop whose id no longer matches, or
//! that finds the cursor not streaming, ends on its next tick.
//!
//! A recording selected with [`AppState::follow_recording`] is still being
//! written: reaching its last row only waits for more. Playback of a finished
//! recording stops and rewinds at the end.

use crate::{lock, AppState, Encoding, OutputShape, ServerEvent};
use nirstream_core::storage::RecordingRow;
use nirstream_core::timer::Pacer;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Playback commands, sent to clients as plain text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    Start,
    Pause,
    Stop,
    GetProtocolVersion,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Stop => "stop",
            Command::GetProtocolVersion => "get-protocol-version",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "start" => Some(Command::Start),
            "pause" => Some(Command::Pause),
            "stop" => Some(Command::Stop),
            "get-protocol-version" => Some(Command::GetProtocolVersion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Streaming,
    Paused,
    Stopped,
}

/// Position of the shared playback
#[derive(Debug)]
pub struct StreamCursor {
    pub recording_id: Option<u64>,
    pub current_index: usize,
    pub state: PlaybackState,
    /// Rows are still being appended to the recording
    pub live: bool,
    run_id: u64,
}

impl Default for StreamCursor {
    fn default() -> Self {
        Self {
            recording_id: None,
            current_index: 0,
            state: PlaybackState::Stopped,
            live: false,
            run_id: 0,
        }
    }
}

impl StreamCursor {
    /// Begin a new run and return its id
    fn begin(&mut self) -> u64 {
        self.run_id += 1;
        self.state = PlaybackState::Streaming;
        self.run_id
    }

    fn is_current(&self, run_id: u64) -> bool {
        self.run_id == run_id && self.state == PlaybackState::Streaming
    }
}

/// Outcome of one emission tick
#[derive(Debug, PartialEq)]
enum Tick {
    Frame(String),
    /// Caught up with a live recording, nothing to send yet
    Waiting,
    Done,
}

/// Format rows as one data frame
pub fn format_frame(rows: &[RecordingRow], encoding: Encoding) -> String {
    let points: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| match encoding {
            Encoding::Json => json!({
                "timeStamp": row.time_stamp,
                "O2Hb": row.values.o2hb,
                "HHb": row.values.hhb,
                "THb": row.values.thb,
                "TOI": row.values.toi,
                "HbDiff": 0,
                "PI": 0,
                "SCORx": 0,
                "SCPRx": 0,
            }),
            Encoding::Delimited => serde_json::Value::String(format!(
                "[{},{},{},{},{},0,0,0,0]",
                row.time_stamp, row.values.o2hb, row.values.hhb, row.values.thb, row.values.toi
            )),
        })
        .collect();
    serde_json::Value::Array(points).to_string()
}

impl AppState {
    /// Start or resume playback. Requires at least one client and a
    /// selected recording.
    pub fn start_stream(&self) -> Result<(), crate::ServerError> {
        if lock(&self.roster).is_empty() {
            return Err(crate::ServerError::NoClients);
        }
        let run_id = {
            let mut cursor = lock(&self.cursor);
            if cursor.recording_id.is_none() {
                return Err(crate::ServerError::NoRecording);
            }
            if cursor.state == PlaybackState::Streaming {
                return Ok(());
            }
            cursor.begin()
        };

        self.send_command(Command::Start);
        tracing::info!(run_id, "Export stream started");
        tokio::spawn(emission_loop(self.clone(), run_id));
        self.publish_status();
        Ok(())
    }

    /// Pause playback, keeping the position
    pub fn pause_stream(&self) {
        lock(&self.cursor).state = PlaybackState::Paused;
        self.send_command(Command::Pause);
        self.publish_status();
    }

    /// Stop playback and rewind
    pub fn stop_stream(&self) {
        {
            let mut cursor = lock(&self.cursor);
            cursor.state = PlaybackState::Stopped;
            cursor.current_index = 0;
        }
        self.send_command(Command::Stop);
        self.publish_status();
    }

    /// Stop the emission loop without notifying clients
    pub(crate) fn halt_stream(&self) {
        let mut cursor = lock(&self.cursor);
        if cursor.state == PlaybackState::Streaming {
            tracing::info!("Last export client left, halting stream");
        }
        cursor.state = PlaybackState::Stopped;
    }

    /// Choose a finished recording to play back, rewinding the cursor
    pub fn select_recording(&self, recording_id: u64) {
        self.point_cursor(recording_id, false);
    }

    /// Choose a recording that is still being written
    pub fn follow_recording(&self, recording_id: u64) {
        self.point_cursor(recording_id, true);
    }

    /// Mark the selected recording as complete; playback ends at its last row
    pub fn finish_recording(&self) {
        lock(&self.cursor).live = false;
    }

    fn point_cursor(&self, recording_id: u64, live: bool) {
        let mut cursor = lock(&self.cursor);
        cursor.recording_id = Some(recording_id);
        cursor.current_index = 0;
        cursor.state = PlaybackState::Stopped;
        cursor.live = live;
    }

    pub fn playback(&self) -> PlaybackState {
        lock(&self.cursor).state
    }

    /// Next tick of run `run_id`
    fn next_frame(&self, run_id: u64) -> Tick {
        let batch_size = self.config.output_shape.batch_size();
        let mut cursor = lock(&self.cursor);
        if !cursor.is_current(run_id) {
            return Tick::Done;
        }
        let Some(recording_id) = cursor.recording_id else {
            return Tick::Done;
        };

        match self
            .store
            .query_from(recording_id, cursor.current_index, batch_size)
        {
            Ok(rows) if rows.is_empty() && cursor.live => Tick::Waiting,
            Ok(rows) if rows.is_empty() => {
                tracing::info!(recording_id, "End of recording reached");
                cursor.state = PlaybackState::Stopped;
                cursor.current_index = 0;
                drop(cursor);
                self.send_command(Command::Stop);
                self.publish_status();
                Tick::Done
            }
            Ok(rows) => {
                cursor.current_index += rows.len();
                Tick::Frame(format_frame(&rows, self.config.encoding))
            }
            Err(e) => {
                tracing::error!(error = %e, recording_id, "Export query failed");
                cursor.state = PlaybackState::Stopped;
                drop(cursor);
                self.notify(ServerEvent::Error(e.to_string()));
                Tick::Done
            }
        }
    }
}

impl OutputShape {
    /// Points per frame
    pub fn batch_size(&self) -> usize {
        match self {
            OutputShape::Batch => 25,
            OutputShape::SinglePoint => 1,
        }
    }
}

/// Push one frame per `tick_interval x batch_size`, on a fixed time grid
///
/// A frame already formatted when `pause` or `stop` lands is still sent.
async fn emission_loop(state: AppState, run_id: u64) {
    let period = state.config.tick_interval() * state.config.output_shape.batch_size() as u32;
    let mut pacer = Pacer::new(period);
    let mut frames = 0u64;

    loop {
        let deadline = pacer.next_deadline();
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;

        match state.next_frame(run_id) {
            Tick::Frame(frame) => {
                let _ = state.ws_tx.send(frame);
                frames += 1;
            }
            Tick::Waiting => {}
            Tick::Done => break,
        }
    }
    tracing::debug!(run_id, frames, "Emission loop finished");
}
