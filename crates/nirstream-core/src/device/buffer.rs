//! Fixed-size integer buffer shared between the parser and its consumers
//!
//! Exactly one [`BufferWriter`] exists per buffer and it is handed to the
//! parser only. Readers may live on other threads; the session guarantees a
//! chunk is fully consumed before the writer touches the buffer again, and
//! the channel hand-off between threads provides the happens-before edge.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Create a zeroed buffer of `len` cells and its single write capability
pub fn shared_buffer(len: usize) -> (BufferWriter, BufferReader) {
    let cells: Arc<[AtomicI32]> = (0..len).map(|_| AtomicI32::new(0)).collect();
    (
        BufferWriter {
            cells: Arc::clone(&cells),
        },
        BufferReader { cells },
    )
}

/// Write capability for a shared buffer. Not `Clone`.
#[derive(Debug)]
pub struct BufferWriter {
    cells: Arc<[AtomicI32]>,
}

impl BufferWriter {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Overwrite one cell
    pub fn set(&mut self, index: usize, value: i32) {
        self.cells[index].store(value, Ordering::Relaxed);
    }

    /// Reader bound to the same cells
    pub fn reader(&self) -> BufferReader {
        BufferReader {
            cells: Arc::clone(&self.cells),
        }
    }
}

/// Read access to a shared buffer
#[derive(Debug, Clone)]
pub struct BufferReader {
    cells: Arc<[AtomicI32]>,
}

impl BufferReader {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, index: usize) -> i32 {
        self.cells[index].load(Ordering::Relaxed)
    }

    /// Copy the buffer into `out`, reusing its allocation
    pub fn read_into(&self, out: &mut Vec<i32>) {
        out.clear();
        out.extend(self.cells.iter().map(|c| c.load(Ordering::Relaxed)));
    }

    /// Owned copy of the buffer contents
    pub fn snapshot(&self) -> Vec<i32> {
        let mut out = Vec::with_capacity(self.cells.len());
        self.read_into(&mut out);
        out
    }
}
