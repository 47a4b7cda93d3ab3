//! Transmission phase: the read-decode-execute-reply loop.
//!
//! Exactly one command is in flight per connection. A request is fully
//! handled, write payload included, before the next header is read, so
//! replies leave in request order and buffering is bounded by one payload.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use nbd::*;

use super::negotiate::Session;
use crate::error::{BackendError, BackendResult};
use crate::registry::Export;
use crate::types::ServerOptions;

pub(crate) struct Transmission<'a, S> {
    stream: &'a mut S,
    export: Arc<Export>,
    options: &'a ServerOptions,
    block_size_negotiated: bool,
}

impl<'a, S> Transmission<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: &'a mut S, session: Session, options: &'a ServerOptions) -> Self {
        Self {
            stream,
            export: session.export,
            options,
            block_size_negotiated: session.block_size_negotiated,
        }
    }

    /// Serve commands until the client disconnects.
    ///
    /// Returns `Err` only for fatal errors: transport failures and requests
    /// that cannot be decoded.
    pub async fn run(mut self) -> Result<(), NbdError> {
        let mut req_buf = [0u8; NbdRequest::SIZE_BYTES];

        loop {
            // EOF before a header starts is a clean close; EOF inside one is
            // a truncated request.
            if self.stream.read(&mut req_buf[..1]).await? == 0 {
                return Ok(());
            }
            self.stream.read_exact(&mut req_buf[1..]).await?;

            let req = NbdRequest::from_bytes(&req_buf)?;

            if let Err(code) = self.validate(&req) {
                if req.command == NbdCommand::Write {
                    self.discard_payload(req.length).await?;
                }
                self.reply(req.handle, code).await?;
                continue;
            }

            match req.command {
                NbdCommand::Read => self.read(&req).await?,
                NbdCommand::Write => self.write(&req).await?,
                NbdCommand::Flush => {
                    let result = self.export.backend().sync().await;
                    self.complete(&req, "flush", result).await?;
                }
                NbdCommand::Trim => {
                    let result = self
                        .export
                        .backend()
                        .trim(req.offset, req.length as u64)
                        .await;
                    self.complete(&req, "trim", result).await?;
                }
                NbdCommand::WriteZeroes => {
                    let backend = self.export.backend();
                    let mut result = backend.write_zeroes(req.offset, req.length as u64).await;
                    if result.is_ok() && req.flags & NBD_CMD_FLAG_FUA != 0 {
                        result = backend.sync().await;
                    }
                    self.complete(&req, "write_zeroes", result).await?;
                }
                NbdCommand::Disconnect => return Ok(()),
            }
        }
    }

    /// Check a request against the bound export. `Err` carries the NBD error
    /// code to reply with; the backend is not touched in that case.
    fn validate(&self, req: &NbdRequest) -> Result<(), u32> {
        if req.command == NbdCommand::Disconnect {
            return Ok(());
        }
        if self.export.is_retired() {
            return Err(NBD_ESHUTDOWN);
        }
        if req.command.is_mutation() && self.options.read_only {
            return Err(NBD_EPERM);
        }
        if matches!(req.command, NbdCommand::Read | NbdCommand::Write)
            && req.length > self.options.max_payload_bytes()
        {
            return Err(NBD_EOVERFLOW);
        }
        if req.command == NbdCommand::Flush {
            return Ok(());
        }

        let in_range = req.end().is_some_and(|end| end <= self.export.size_bytes());
        if !in_range {
            return Err(match req.command {
                NbdCommand::Write | NbdCommand::WriteZeroes => NBD_ENOSPC,
                _ => NBD_EINVAL,
            });
        }

        if self.block_size_negotiated {
            let min = self.options.minimum_block_size as u64;
            if req.offset % min != 0 || req.length as u64 % min != 0 {
                return Err(NBD_EINVAL);
            }
        }
        Ok(())
    }

    async fn read(&mut self, req: &NbdRequest) -> Result<(), NbdError> {
        let len = req.length as usize;
        let mut data = BytesMut::zeroed(len);
        let result = self
            .export
            .backend()
            .read_at(&mut data, req.offset)
            .await
            .and_then(|n| expect_full("read", n, len, req.offset));

        match result {
            Ok(()) => {
                self.reply(req.handle, NBD_OK).await?;
                self.stream.write_all(&data).await?;
                Ok(())
            }
            Err(e) => self.complete(req, "read", Err(e)).await,
        }
    }

    async fn write(&mut self, req: &NbdRequest) -> Result<(), NbdError> {
        let len = req.length as usize;
        let mut data = BytesMut::zeroed(len);
        self.stream.read_exact(&mut data).await?;

        let backend = self.export.backend();
        let mut result = backend
            .write_at(&data, req.offset)
            .await
            .and_then(|n| expect_full("write", n, len, req.offset));
        if result.is_ok() && req.flags & NBD_CMD_FLAG_FUA != 0 {
            result = backend.sync().await;
        }
        self.complete(req, "write", result).await
    }

    /// Reply to a command from its backend result. Backend failures are
    /// per-command: the client gets `NBD_EIO` and the connection stays open.
    async fn complete(
        &mut self,
        req: &NbdRequest,
        op: &'static str,
        result: BackendResult<()>,
    ) -> Result<(), NbdError> {
        let code = match result {
            Ok(()) => NBD_OK,
            Err(e) => {
                warn!(
                    export = self.export.name(),
                    op,
                    offset = req.offset,
                    length = req.length,
                    error = %e,
                    "backend error"
                );
                NBD_EIO
            }
        };
        self.reply(req.handle, code).await
    }

    async fn reply(&mut self, handle: u64, error: u32) -> Result<(), NbdError> {
        self.stream
            .write_all(&NbdReply { error, handle }.to_bytes())
            .await?;
        Ok(())
    }

    /// Drain the payload of a rejected write without buffering it.
    async fn discard_payload(&mut self, length: u32) -> Result<(), NbdError> {
        let mut payload = (&mut *self.stream).take(length as u64);
        let drained = tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
        if drained < length as u64 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }
}

fn expect_full(op: &str, n: usize, len: usize, offset: u64) -> BackendResult<()> {
    if n == len {
        return Ok(());
    }
    Err(BackendError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("short {}: {} of {} bytes at offset {}", op, n, len, offset),
    )))
}
