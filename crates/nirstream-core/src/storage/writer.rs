//! Background persistence of recorded batches
//!
//! Batches are queued from the session thread and inserted by a dedicated
//! writer thread in arrival order, so storage latency never stalls the
//! display path.

use super::{RecordingRow, RecordingStore};
use crate::session::events::DisplayEvent;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Handle returned by [`PersistenceWriter::spawn`]
///
/// Dropping the handle flushes every queued batch before returning.
pub struct WriterHandle {
    tx: Option<Sender<Vec<RecordingRow>>>,
    rows_written: Arc<AtomicU64>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WriterHandle {
    /// Queue a batch for insertion
    pub fn submit(&self, rows: Vec<RecordingRow>) {
        if rows.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx {
            if tx.send(rows).is_err() {
                tracing::error!("Persistence writer is gone, batch dropped");
            }
        }
    }

    /// Rows successfully inserted so far
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    /// Close the queue and wait until every batch has been inserted
    pub fn finish(&mut self) {
        self.tx = None;
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Writer thread factory
pub struct PersistenceWriter {
    store: Arc<dyn RecordingStore>,
    errors: Option<UnboundedSender<DisplayEvent>>,
}

impl PersistenceWriter {
    /// Create a writer for `store`, reporting insert failures on `errors`
    pub fn new(
        store: Arc<dyn RecordingStore>,
        errors: Option<UnboundedSender<DisplayEvent>>,
    ) -> Self {
        Self { store, errors }
    }

    /// Spawn the writer thread
    pub fn spawn(self) -> std::io::Result<WriterHandle> {
        let (tx, rx) = crossbeam_channel::unbounded::<Vec<RecordingRow>>();
        let rows_written = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&rows_written);

        let thread = std::thread::Builder::new()
            .name("nirs-persistence".into())
            .spawn(move || self.write_loop(rx, counter))?;

        Ok(WriterHandle {
            tx: Some(tx),
            rows_written,
            thread: Some(thread),
        })
    }

    fn write_loop(self, rx: Receiver<Vec<RecordingRow>>, counter: Arc<AtomicU64>) {
        for rows in rx.iter() {
            match self.store.insert_batch(&rows) {
                Ok(()) => {
                    counter.fetch_add(rows.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!(error = %e, rows = rows.len(), "Failed to persist batch");
                    if let Some(errors) = &self.errors {
                        let _ = errors.send(DisplayEvent::Error(e.to_string()));
                    }
                }
            }
        }
        tracing::debug!(
            rows = counter.load(Ordering::Relaxed),
            "Persistence writer drained"
        );
    }
}
