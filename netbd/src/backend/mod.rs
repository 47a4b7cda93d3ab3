//! Storage backends.
//!
//! [`Backend`] is the contract every storage engine behind an export has to
//! satisfy. The NBD server only ever talks to this trait; the concrete
//! engines here ([`MemoryBackend`], [`FileBackend`]) are reference
//! implementations used by the daemon and tests.
//!
//! Backends may be shared by several exports and sessions at once, so they
//! must synchronize internally. A single session never issues overlapping
//! operations.

#[cfg(unix)]
mod file;
mod memory;

use std::fmt::Display;

use async_trait::async_trait;

use crate::error::{BackendError, BackendResult};

#[cfg(unix)]
pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Chunk size used by the default `write_zeroes` implementation.
const ZERO_CHUNK_BYTES: usize = 1024 * 1024;

/// Random-access block storage.
///
/// `Display` provides a human-readable identity used in logs.
#[async_trait]
pub trait Backend: Display + Send + Sync {
    /// Read into `buf` starting at `offset`. Returns the number of bytes read,
    /// which is less than `buf.len()` only at the end of the region or on a
    /// short read.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize>;

    /// Write `buf` starting at `offset`. Returns the number of bytes written.
    async fn write_at(&self, buf: &[u8], offset: u64) -> BackendResult<usize>;

    /// Size of the region in bytes.
    async fn size(&self) -> BackendResult<u64>;

    /// Make previously written data durable.
    async fn sync(&self) -> BackendResult<()>;

    /// Discard a byte range. The default keeps the data, which satisfies the
    /// protocol since trimmed content is unspecified.
    async fn trim(&self, _offset: u64, _length: u64) -> BackendResult<()> {
        Ok(())
    }

    /// Write zeroes over a byte range.
    async fn write_zeroes(&self, offset: u64, length: u64) -> BackendResult<()> {
        let zeroes = vec![0u8; (length as usize).min(ZERO_CHUNK_BYTES)];
        let mut pos = offset;
        let end = offset + length;

        while pos < end {
            let chunk = ((end - pos) as usize).min(zeroes.len());
            let written = self.write_at(&zeroes[..chunk], pos).await?;
            if written != chunk {
                return Err(BackendError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short write: {} of {} bytes at offset {}", written, chunk, pos),
                )));
            }
            pos += chunk as u64;
        }
        Ok(())
    }
}
