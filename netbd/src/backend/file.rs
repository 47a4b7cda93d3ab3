//! File-backed backend.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::Backend;
use crate::error::{BackendError, BackendResult};

/// A region stored in a regular file.
///
/// Positional I/O runs on tokio's blocking pool so the session task is never
/// stalled by the filesystem.
pub struct FileBackend {
    path: PathBuf,
    file: Arc<File>,
}

impl FileBackend {
    /// Open or create `path`.
    ///
    /// If `size_bytes` is given and the file is smaller, it is grown to that
    /// size. Files are never shrunk. A newly created file needs a size.
    pub fn open(path: impl AsRef<Path>, size_bytes: Option<u64>) -> BackendResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let current = file.metadata()?.len();
        match size_bytes {
            Some(0) => {
                return Err(BackendError::InvalidSize {
                    reason: "must be > 0",
                });
            }
            Some(size) if size > current => {
                file.set_len(size)?;
                file.sync_all()?;
                info!(path = %path.display(), from = current, to = size, "grew backend file");
            }
            None if current == 0 => {
                return Err(BackendError::InvalidSize {
                    reason: "file is empty and no size was given",
                });
            }
            _ => {}
        }

        Ok(Self {
            path,
            file: Arc::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, op: F) -> BackendResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> std::io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(|e| BackendError::Task {
                message: e.to_string(),
            })?
            .map_err(BackendError::from)
    }
}

impl fmt::Display for FileBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.file.metadata().map(|m| m.len()).unwrap_or(0);
        write!(f, "file backend {}, size={}", self.path.display(), size)
    }
}

/// Read until `buf` is full or the file ends.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[async_trait]
impl Backend for FileBackend {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        let len = buf.len();
        let data = self
            .blocking(move |file| {
                let mut data = vec![0u8; len];
                let n = read_full_at(file, &mut data, offset)?;
                data.truncate(n);
                Ok(data)
            })
            .await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> BackendResult<usize> {
        let data = buf.to_vec();
        self.blocking(move |file| {
            file.write_all_at(&data, offset)?;
            Ok(data.len())
        })
        .await
    }

    async fn size(&self) -> BackendResult<u64> {
        self.blocking(|file| Ok(file.metadata()?.len())).await
    }

    async fn sync(&self) -> BackendResult<()> {
        self.blocking(|file| file.sync_all()).await
    }
}
