//! Telemetry chunk decoding
//!
//! ## Chunk Format
//!
//! A chunk is one batch: `batch_size * elements_per_point` signed 32-bit
//! little-endian integers, row-major `[point][cell]`. Anything else is
//! rejected without touching the shared buffer.

use super::buffer::BufferWriter;
use crate::error::NirsError;

const CELL_BYTES: usize = std::mem::size_of::<i32>();

/// Decode a chunk into the shared buffer
///
/// Returns the number of cells written.
pub fn parse_chunk(chunk: &[u8], buffer: &mut BufferWriter) -> Result<usize, NirsError> {
    let expected = buffer.len() * CELL_BYTES;
    if chunk.len() != expected {
        return Err(NirsError::Parse(format!(
            "chunk of {} bytes, expected {}",
            chunk.len(),
            expected
        )));
    }

    for (index, bytes) in chunk.chunks_exact(CELL_BYTES).enumerate() {
        let value = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        buffer.set(index, value);
    }

    Ok(buffer.len())
}

/// Encode integer cells in the instrument's wire format
pub fn encode_chunk(cells: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(cells.len() * CELL_BYTES);
    for cell in cells {
        out.extend_from_slice(&cell.to_le_bytes());
    }
    out
}
