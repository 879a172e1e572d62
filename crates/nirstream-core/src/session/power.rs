//! Idle-prevention lock held while the instrument is streaming
//!
//! On Windows the session thread asks the OS to keep the system awake while
//! still allowing the display to turn off. Elsewhere the block only marks
//! the interval in the logs.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// RAII power block. Must be dropped on the thread that acquired it.
#[derive(Debug)]
pub struct PowerBlock {
    id: u64,
    acquired_at: DateTime<Utc>,
}

impl PowerBlock {
    pub fn acquire() -> Self {
        let id = NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed);
        platform::keep_awake(true);
        tracing::debug!(id, "Power block acquired");
        Self {
            id,
            acquired_at: Utc::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

impl Drop for PowerBlock {
    fn drop(&mut self) {
        platform::keep_awake(false);
        let held = Utc::now() - self.acquired_at;
        tracing::debug!(id = self.id, held_secs = held.num_seconds(), "Power block released");
    }
}

#[cfg(windows)]
mod platform {
    use windows_sys::Win32::System::Power::{
        SetThreadExecutionState, ES_CONTINUOUS, ES_SYSTEM_REQUIRED,
    };

    pub fn keep_awake(enabled: bool) {
        let flags = if enabled {
            ES_CONTINUOUS | ES_SYSTEM_REQUIRED
        } else {
            ES_CONTINUOUS
        };
        // SAFETY: only updates the calling thread's execution state flags
        let previous = unsafe { SetThreadExecutionState(flags) };
        if previous == 0 {
            tracing::warn!("SetThreadExecutionState failed");
        }
    }
}

#[cfg(not(windows))]
mod platform {
    pub fn keep_awake(_enabled: bool) {}
}
