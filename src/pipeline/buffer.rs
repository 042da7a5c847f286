//! Single-slot frame mailbox over the region's frame area

use std::ptr;
use std::sync::Arc;

use super::error::{PipelineError, Result};
use super::region::SharedRegion;

/// Holds at most one encoded page image at a time.
///
/// Frames are always written from offset 0 and carry no framing of their own:
/// the length travels in the `FRAME_READY` notice. Access is serialized by the
/// ack handshake, never by this type.
pub struct SharedFrameBuffer {
    region: Arc<SharedRegion>,
    capacity: usize,
}

impl SharedFrameBuffer {
    #[must_use]
    pub fn new(region: Arc<SharedRegion>) -> Self {
        let capacity = region.frame_capacity();
        Self { region, capacity }
    }

    /// Frame area size in bytes
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copies `bytes` into the slot, overwriting the previous frame.
    ///
    /// Returns the frame length as it goes on the wire. Fails with
    /// [`PipelineError::BufferOverflow`] instead of writing past the end.
    pub fn write(&mut self, bytes: &[u8]) -> Result<u32> {
        let len = bytes.len();
        let wire_len = u32::try_from(len).map_err(|_| PipelineError::BufferOverflow {
            len,
            capacity: self.capacity,
        })?;
        if len > self.capacity {
            return Err(PipelineError::BufferOverflow {
                len,
                capacity: self.capacity,
            });
        }

        // SAFETY: len <= capacity, and the frame area spans capacity bytes.
        // The consumer does not read until it sees the matching notice.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.region.frame_ptr(), len);
        }

        Ok(wire_len)
    }

    /// Returns an owned copy of the first `len` bytes of the slot.
    pub fn copy_out(&self, len: usize) -> Result<Vec<u8>> {
        if len > self.capacity {
            return Err(PipelineError::protocol(format!(
                "announced frame of {len} bytes exceeds buffer capacity of {} bytes",
                self.capacity
            )));
        }

        let mut out = vec![0u8; len];
        // SAFETY: len <= capacity; the worker is blocked awaiting our reply,
        // so the slot is not written while we copy.
        unsafe {
            ptr::copy_nonoverlapping(self.region.frame_ptr(), out.as_mut_ptr(), len);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for SharedFrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFrameBuffer")
            .field("region", &self.region.name())
            .field("capacity", &self.capacity)
            .finish()
    }
}
