//! Pending-data buffer for the unpaired phase of a pipe

use bytes::Bytes;

/// Ordered, append-only buffer of byte chunks.
///
/// Supports exactly two operations: append and drain-all. Chunks come back
/// out in arrival order, once; after the drain the buffer is empty and is
/// never touched again by the pipe.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    chunks: Vec<Bytes>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        self.chunks.push(chunk);
    }

    pub fn drain(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.chunks)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
