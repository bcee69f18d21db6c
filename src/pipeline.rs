//! Fixed-capacity circular byte buffer used for per-channel TX/RX queues.
//!
//! Head and tail count modulo twice the capacity: the number of buffered
//! bytes is `tail - head` in that ring, and the byte index is the position
//! modulo the capacity. This keeps the whole capacity usable without a
//! separate "full" flag.
//!
//! The consumer is the only writer of `head`, the producer the only writer of
//! `tail`. Size queries are lock-free; byte copies run under the pipeline
//! lock so that `init`/`reset`/`destroy` never race a copy.
//!
//! # Example
//!
//! ```
//! use stp_link::pipeline::Pipeline;
//!
//! let pl = Pipeline::with_capacity(8);
//! pl.add_data(b"hello").unwrap();
//! assert_eq!(pl.get_data_size(), 5);
//!
//! let mut out = [0u8; 5];
//! pl.get_data(&mut out).unwrap();
//! assert_eq!(&out, b"hello");
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

/// Precondition failures of the unchecked-style `add_data`/`get_data` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Not enough free space for the whole write.
    #[error("pipeline has {available} bytes free, {requested} requested")]
    InsufficientSpace { requested: usize, available: usize },

    /// Not enough buffered bytes for the whole read.
    #[error("pipeline holds {available} bytes, {requested} requested")]
    InsufficientData { requested: usize, available: usize },
}

/// Circular byte buffer with atomic positions.
#[derive(Debug)]
pub struct Pipeline {
    buffer: Mutex<Box<[u8]>>,
    capacity: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
}

impl Pipeline {
    /// Create an uninitialized pipeline (capacity 0).
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Box::default()),
            capacity: AtomicU32::new(0),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    /// Create a pipeline with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let pl = Self::new();
        pl.init(capacity);
        pl
    }

    /// (Re)allocate the storage and empty the pipeline.
    pub fn init(&self, capacity: usize) {
        let mut buffer = self.buffer.lock();
        if buffer.len() != capacity {
            *buffer = vec![0u8; capacity].into_boxed_slice();
        }
        self.capacity.store(capacity as u32, Ordering::Release);
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
    }

    /// Release the storage. The pipeline reports capacity 0 afterwards.
    pub fn destroy(&self) {
        let mut buffer = self.buffer.lock();
        *buffer = Box::default();
        self.capacity.store(0, Ordering::Release);
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
    }

    /// Drop all buffered bytes, keeping the storage.
    pub fn reset(&self) {
        let _buffer = self.buffer.lock();
        self.head.store(0, Ordering::Release);
        self.tail.store(0, Ordering::Release);
    }

    /// Fixed capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire) as usize
    }

    /// Number of buffered bytes.
    #[inline]
    pub fn get_data_size(&self) -> usize {
        let capacity = self.capacity() as u64;
        if capacity == 0 {
            return 0;
        }
        // Head first: a concurrent producer can only make the snapshot grow.
        let head = self.head.load(Ordering::Acquire) as u64;
        let tail = self.tail.load(Ordering::Acquire) as u64;
        ((tail + 2 * capacity - head) % (2 * capacity)).min(capacity) as usize
    }

    /// Free bytes.
    #[inline]
    pub fn get_available_space(&self) -> usize {
        self.capacity() - self.get_data_size()
    }

    /// Whether the pipeline holds no data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.get_data_size() == 0
    }

    /// Fill ratio, 0–100.
    pub fn get_percentage_filled(&self) -> u32 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0;
        }
        (self.get_data_size() * 100 / capacity) as u32
    }

    /// Append all of `data`. Fails without copying if it does not fit.
    pub fn add_data(&self, data: &[u8]) -> Result<(), PipelineError> {
        let mut buffer = self.buffer.lock();
        let available = self.get_available_space();
        if data.len() > available {
            return Err(PipelineError::InsufficientSpace {
                requested: data.len(),
                available,
            });
        }
        self.copy_in(&mut buffer, data);
        Ok(())
    }

    /// Append as much of `data` as fits. Returns the number of bytes copied.
    pub fn add_data_nb(&self, data: &[u8]) -> usize {
        let mut buffer = self.buffer.lock();
        let n = data.len().min(self.get_available_space());
        self.copy_in(&mut buffer, &data[..n]);
        n
    }

    /// Fill `out` completely. Fails without consuming if not enough data.
    pub fn get_data(&self, out: &mut [u8]) -> Result<(), PipelineError> {
        let buffer = self.buffer.lock();
        let available = self.get_data_size();
        if out.len() > available {
            return Err(PipelineError::InsufficientData {
                requested: out.len(),
                available,
            });
        }
        self.copy_out(&buffer, out);
        Ok(())
    }

    /// Read up to `out.len()` bytes. Returns the number of bytes copied.
    pub fn get_data_nb(&self, out: &mut [u8]) -> usize {
        let buffer = self.buffer.lock();
        let n = out.len().min(self.get_data_size());
        self.copy_out(&buffer, &mut out[..n]);
        n
    }

    fn copy_in(&self, buffer: &mut [u8], data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let capacity = buffer.len();
        let tail = self.tail.load(Ordering::Acquire);
        let pos = tail as usize % capacity;

        let first = data.len().min(capacity - pos);
        buffer[pos..pos + first].copy_from_slice(&data[..first]);
        buffer[..data.len() - first].copy_from_slice(&data[first..]);

        self.tail
            .store(advance(tail, data.len(), capacity), Ordering::Release);
    }

    fn copy_out(&self, buffer: &[u8], out: &mut [u8]) {
        if out.is_empty() {
            return;
        }
        let capacity = buffer.len();
        let head = self.head.load(Ordering::Acquire);
        let pos = head as usize % capacity;

        let first = out.len().min(capacity - pos);
        let rest = out.len() - first;
        out[..first].copy_from_slice(&buffer[pos..pos + first]);
        out[first..].copy_from_slice(&buffer[..rest]);

        self.head
            .store(advance(head, out.len(), capacity), Ordering::Release);
    }
}

/// Move a position `n` bytes forward in the `2 * capacity` ring.
#[inline]
fn advance(pos: u32, n: usize, capacity: usize) -> u32 {
    ((pos as u64 + n as u64) % (2 * capacity as u64)) as u32
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
