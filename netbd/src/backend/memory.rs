//! In-memory backend.

use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::Backend;
use crate::error::BackendResult;

/// A fixed-size byte region held in memory.
///
/// Contents are lost when the last reference is dropped. One instance can be
/// exposed through several exports and sessions at once.
pub struct MemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl MemoryBackend {
    pub fn new(size_bytes: usize) -> Self {
        Self::from_vec(vec![0u8; size_bytes])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Clamp `[offset, offset + len)` to the region.
    fn span(len: usize, region: usize, offset: u64) -> (usize, usize) {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(region);
        let n = len.min(region - start);
        (start, n)
    }
}

impl fmt::Display for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory backend, size={}", self.data.read().len())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        let data = self.data.read();
        let (start, n) = Self::span(buf.len(), data.len(), offset);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> BackendResult<usize> {
        let mut data = self.data.write();
        let (start, n) = Self::span(buf.len(), data.len(), offset);
        data[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    async fn size(&self) -> BackendResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    async fn sync(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, length: u64) -> BackendResult<()> {
        let mut data = self.data.write();
        let len = usize::try_from(length).unwrap_or(usize::MAX);
        let (start, n) = Self::span(len, data.len(), offset);
        data[start..start + n].fill(0);
        Ok(())
    }
}
