//! A thread-safe free-list of reusable byte buffers.
//!
//! Allocating an 8 MiB directory-entry buffer per frame (or a body buffer
//! per extracted file) would dominate the fast path, so buffers are borrowed
//! from a shared pool and handed back once the work unit is done.

use std::sync::Mutex;

/// A process-local pool of `Vec<u8>` buffers sharing one initial capacity.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    /// Creates an empty pool whose buffers are allocated with `capacity`
    /// bytes on first use.
    pub fn new(capacity: usize) -> Self {
        BufferPool { buffers: Mutex::new(Vec::new()), capacity }
    }

    /// Borrows a zero-length buffer, allocating one if the pool is empty.
    pub fn get(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity))
    }

    /// Returns a buffer to the pool. Contents are cleared; capacity is kept.
    pub fn put(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.buffers.lock().unwrap().push(buffer);
    }
}
