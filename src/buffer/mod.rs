//! Buffer provider contract and the move-only buffer handle.
//!
//! The connection never allocates message memory itself. Every buffer it
//! writes a request into or reads a reply into comes from a
//! [`BufferProvider`], so memory can be pooled across messages and across
//! connections. A [`PooledBuffer`] goes back to the pool it came from when it
//! is released or dropped; since it cannot be cloned, double release is
//! impossible.

mod pool;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::{Result, WireError};

pub use pool::{PoolConfig, PoolStats, PowerOfTwoBufferPool};

/// Largest buffer a provider hands out unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Source of byte buffers.
///
/// Implementations must support concurrent `get_buffer` calls from
/// independent connections without the caller holding any lock.
pub trait BufferProvider: Send + Sync + fmt::Debug {
    /// Obtain an empty buffer with capacity for at least `min_size` bytes.
    ///
    /// The returned buffer has length 0. Its spare capacity may hold bytes
    /// from a previous user; write before reading.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Allocation` if the memory cannot be obtained.
    fn get_buffer(&self, min_size: usize) -> Result<PooledBuffer>;
}

/// Destination for buffers coming back from callers.
pub trait BufferRecycler: Send + Sync {
    /// Take back a buffer. Called at most once per handed-out buffer.
    fn recycle(&self, buf: Vec<u8>);
}

/// An owned byte buffer obtained from a [`BufferProvider`].
pub struct PooledBuffer {
    data: Vec<u8>,
    home: Option<Arc<dyn BufferRecycler>>,
}

impl PooledBuffer {
    /// Wrap a buffer that belongs to no pool.
    pub fn unpooled(data: Vec<u8>) -> Self {
        Self { data, home: None }
    }

    /// Wrap a buffer that returns to `home` on release.
    pub fn pooled(data: Vec<u8>, home: Arc<dyn BufferRecycler>) -> Self {
        Self {
            data,
            home: Some(home),
        }
    }

    /// Copy `bytes` into a fresh unpooled buffer.
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Self::unpooled(bytes.to_vec())
    }

    /// Mutable access to the backing vector (implements `bytes::BufMut`).
    #[inline]
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Append bytes.
    #[inline]
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Set the length to `len`, zero-filling any new bytes.
    #[inline]
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Detach from the pool and return the bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.home = None;
        std::mem::take(&mut self.data)
    }

    /// Return the buffer to its provider.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.recycle(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

/// Provider that allocates a fresh buffer on every request.
#[derive(Debug, Clone)]
pub struct SimpleBufferProvider {
    max_buffer_size: usize,
}

impl SimpleBufferProvider {
    pub fn new() -> Self {
        Self::with_max_buffer_size(DEFAULT_MAX_BUFFER_SIZE)
    }

    pub fn with_max_buffer_size(max_buffer_size: usize) -> Self {
        Self { max_buffer_size }
    }
}

impl Default for SimpleBufferProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferProvider for SimpleBufferProvider {
    fn get_buffer(&self, min_size: usize) -> Result<PooledBuffer> {
        allocate(min_size, self.max_buffer_size).map(PooledBuffer::unpooled)
    }
}

/// Fallible allocation shared by the providers.
pub(crate) fn allocate(capacity: usize, max_buffer_size: usize) -> Result<Vec<u8>> {
    if capacity > max_buffer_size {
        return Err(WireError::Allocation {
            requested: capacity,
        });
    }
    let mut data = Vec::new();
    data.try_reserve_exact(capacity)
        .map_err(|_| WireError::Allocation {
            requested: capacity,
        })?;
    Ok(data)
}
