//! Optional calculation thread
//!
//! The worker reads the parser's shared buffer directly. The session sends a
//! request after each parse and collects the result before it admits the
//! next chunk, so the buffer is never rewritten while the worker reads it.

use crate::device::buffer::BufferReader;
use crate::dsp::calculation::{CalculationEngine, HaemoValues};
use crate::error::NirsError;
use crossbeam_channel::{Receiver, Sender};

/// Handle to the calculation thread
pub struct CalcWorker {
    request_tx: Option<Sender<()>>,
    result_rx: Receiver<Vec<HaemoValues>>,
    in_flight: bool,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CalcWorker {
    /// Spawn a worker computing over `reader`
    pub fn spawn(
        reader: BufferReader,
        mut engine: CalculationEngine,
        batch_size: usize,
    ) -> std::io::Result<Self> {
        let (request_tx, request_rx) = crossbeam_channel::bounded::<()>(1);
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        let thread = std::thread::Builder::new()
            .name("nirs-calc".into())
            .spawn(move || {
                let mut cells = Vec::with_capacity(reader.len());
                for () in request_rx.iter() {
                    reader.read_into(&mut cells);
                    let values = engine.process_raw_batch(&cells, batch_size);
                    if result_tx.send(values).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            request_tx: Some(request_tx),
            result_rx,
            in_flight: false,
            thread: Some(thread),
        })
    }

    /// Ask the worker to process the buffer's current contents
    pub fn dispatch(&mut self) -> Result<(), NirsError> {
        if self.in_flight {
            return Err(NirsError::ConsistencyFault(
                "calculation requested before the previous batch was collected".into(),
            ));
        }
        let tx = self
            .request_tx
            .as_ref()
            .ok_or_else(|| NirsError::ConsistencyFault("calculation worker closed".into()))?;
        tx.send(())
            .map_err(|_| NirsError::ConsistencyFault("calculation worker died".into()))?;
        self.in_flight = true;
        Ok(())
    }

    /// Wait for the result of the last dispatch
    pub fn collect(&mut self) -> Result<Vec<HaemoValues>, NirsError> {
        if !self.in_flight {
            return Err(NirsError::ConsistencyFault(
                "no calculation in flight".into(),
            ));
        }
        self.in_flight = false;
        self.result_rx
            .recv()
            .map_err(|_| NirsError::ConsistencyFault("calculation worker died".into()))
    }
}

impl Drop for CalcWorker {
    fn drop(&mut self) {
        self.request_tx = None;
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
