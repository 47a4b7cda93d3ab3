//! NBD client implementation.
//!
//! [`Handshake`] drives the fixed newstyle negotiation phase (listing,
//! querying and selecting exports). Once an export is selected it turns into
//! an [`NbdClient`] for the transmission phase.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// Export details reported by the server in reply to `NBD_OPT_INFO`/`NBD_OPT_GO`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportDetails {
    /// Export name, when the server sent `NBD_INFO_NAME`.
    pub name: Option<String>,
    /// Export description, when the server sent `NBD_INFO_DESCRIPTION`.
    pub description: Option<String>,
    pub size_bytes: u64,
    pub transmission_flags: u16,
    pub block_size: Option<BlockSizeConstraints>,
}

/// Client side of the negotiation phase.
pub struct Handshake<S> {
    stream: S,
    no_zeroes: bool,
    selected: Option<ExportDetails>,
}

impl<S> Handshake<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read the server greeting and send client flags.
    pub async fn start(mut stream: S) -> Result<Self, NbdError> {
        let mut hello = [0u8; 18];
        stream.read_exact(&mut hello).await?;

        let magic = u64::from_be_bytes(hello[0..8].try_into().unwrap());
        if magic != NBD_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_MAGIC,
                actual: magic,
            });
        }

        let opts_magic = u64::from_be_bytes(hello[8..16].try_into().unwrap());
        if opts_magic != NBD_OPTS_MAGIC {
            return Err(NbdError::NegotiationFailed {
                reason: "server does not speak newstyle negotiation",
            });
        }

        let flags = u16::from_be_bytes(hello[16..18].try_into().unwrap());
        if flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
            return Err(NbdError::NegotiationFailed {
                reason: "server does not support fixed newstyle",
            });
        }
        let no_zeroes = (flags & NBD_FLAG_NO_ZEROES) != 0;

        let client_flags =
            NBD_FLAG_C_FIXED_NEWSTYLE | if no_zeroes { NBD_FLAG_C_NO_ZEROES } else { 0 };
        stream.write_all(&client_flags.to_be_bytes()).await?;

        Ok(Self {
            stream,
            no_zeroes,
            selected: None,
        })
    }

    /// Send a raw option request.
    pub async fn send_option(&mut self, option: u32, data: &[u8]) -> Result<(), NbdError> {
        let header = OptionHeader {
            option,
            length: data.len() as u32,
        };
        self.stream.write_all(&header.to_bytes()).await?;
        if !data.is_empty() {
            self.stream.write_all(data).await?;
        }
        Ok(())
    }

    /// Read one raw option reply.
    pub async fn read_option_reply(&mut self) -> Result<(OptionReplyHeader, Vec<u8>), NbdError> {
        let mut buf = [0u8; OptionReplyHeader::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        let header = OptionReplyHeader::from_bytes(&buf)?;

        let mut data = vec![0u8; header.length as usize];
        self.stream.read_exact(&mut data).await?;
        Ok((header, data))
    }

    /// List the exports offered by the server (`NBD_OPT_LIST`).
    pub async fn list(&mut self) -> Result<Vec<ExportListing>, NbdError> {
        self.send_option(NBD_OPT_LIST, &[]).await?;

        let mut exports = Vec::new();
        loop {
            let (header, data) = self.read_option_reply().await?;
            match header.reply_type {
                NBD_REP_SERVER => {
                    let listing = ExportListing::from_bytes(&data).ok_or(
                        NbdError::NegotiationFailed {
                            reason: "malformed export listing",
                        },
                    )?;
                    exports.push(listing);
                }
                NBD_REP_ACK => return Ok(exports),
                reply => {
                    return Err(NbdError::OptionRejected {
                        option: NBD_OPT_LIST,
                        reply,
                    });
                }
            }
        }
    }

    /// Query an export without selecting it (`NBD_OPT_INFO`).
    pub async fn info(&mut self, name: &str) -> Result<ExportDetails, NbdError> {
        self.query(NBD_OPT_INFO, name).await
    }

    /// Select an export (`NBD_OPT_GO`).
    ///
    /// On failure the handshake stays usable so another export can be tried.
    pub async fn go(&mut self, name: &str) -> Result<ExportDetails, NbdError> {
        let details = self.query(NBD_OPT_GO, name).await?;
        self.selected = Some(details.clone());
        Ok(details)
    }

    /// Enter the transmission phase after a successful [`go`](Self::go).
    pub fn into_client(self) -> Result<NbdClient<S>, NbdError> {
        let export = self.selected.ok_or(NbdError::NegotiationFailed {
            reason: "no export selected",
        })?;
        Ok(NbdClient::new(self.stream, export))
    }

    /// Select an export with the legacy `NBD_OPT_EXPORT_NAME` option.
    ///
    /// The server closes the connection if the export does not exist.
    pub async fn export_name(mut self, name: &str) -> Result<NbdClient<S>, NbdError> {
        self.send_option(NBD_OPT_EXPORT_NAME, name.as_bytes())
            .await?;

        let mut resp = [0u8; 10];
        self.stream.read_exact(&mut resp).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                NbdError::UnknownExport {
                    name: name.to_string(),
                }
            } else {
                e.into()
            }
        })?;
        if !self.no_zeroes {
            let mut padding = [0u8; EXPORT_NAME_PADDING_BYTES];
            self.stream.read_exact(&mut padding).await?;
        }

        let export = ExportDetails {
            name: Some(name.to_string()),
            size_bytes: u64::from_be_bytes(resp[0..8].try_into().unwrap()),
            transmission_flags: u16::from_be_bytes(resp[8..10].try_into().unwrap()),
            ..Default::default()
        };
        Ok(NbdClient::new(self.stream, export))
    }

    /// End negotiation without selecting an export (`NBD_OPT_ABORT`).
    pub async fn abort(mut self) -> Result<(), NbdError> {
        self.send_option(NBD_OPT_ABORT, &[]).await?;
        // The server may close without acknowledging.
        match self.read_option_reply().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_disconnect() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn query(&mut self, option: u32, name: &str) -> Result<ExportDetails, NbdError> {
        let request = ExportRequest {
            name: name.to_string(),
            info_requests: vec![NBD_INFO_NAME, NBD_INFO_DESCRIPTION, NBD_INFO_BLOCK_SIZE],
        };
        self.send_option(option, &request.to_bytes()).await?;

        let mut details = ExportDetails::default();
        loop {
            let (header, data) = self.read_option_reply().await?;
            match header.reply_type {
                NBD_REP_INFO if data.len() >= 2 => {
                    parse_info(&mut details, &data);
                }
                NBD_REP_ACK => return Ok(details),
                NBD_REP_ERR_UNKNOWN => {
                    return Err(NbdError::UnknownExport {
                        name: name.to_string(),
                    });
                }
                reply if header.is_error() => {
                    return Err(NbdError::OptionRejected { option, reply });
                }
                // Unknown non-error replies are ignored per the protocol.
                _ => {}
            }
        }
    }
}

fn parse_info(details: &mut ExportDetails, data: &[u8]) {
    let info_type = u16::from_be_bytes([data[0], data[1]]);
    let body = &data[2..];
    match info_type {
        NBD_INFO_EXPORT if body.len() >= 10 => {
            details.size_bytes = u64::from_be_bytes(body[0..8].try_into().unwrap());
            details.transmission_flags = u16::from_be_bytes(body[8..10].try_into().unwrap());
        }
        NBD_INFO_NAME => {
            details.name = Some(String::from_utf8_lossy(body).into_owned());
        }
        NBD_INFO_DESCRIPTION => {
            details.description = Some(String::from_utf8_lossy(body).into_owned());
        }
        NBD_INFO_BLOCK_SIZE if body.len() >= 12 => {
            details.block_size = Some(BlockSizeConstraints {
                minimum: u32::from_be_bytes(body[0..4].try_into().unwrap()),
                preferred: u32::from_be_bytes(body[4..8].try_into().unwrap()),
                maximum: u32::from_be_bytes(body[8..12].try_into().unwrap()),
            });
        }
        _ => {}
    }
}

/// NBD client for the transmission phase.
pub struct NbdClient<S> {
    stream: S,
    handle_counter: AtomicU64,
    /// Export selected during negotiation.
    pub export: ExportDetails,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S, export: ExportDetails) -> Self {
        Self {
            stream,
            handle_counter: AtomicU64::new(0),
            export,
        }
    }

    /// Connect to an NBD server and select the export with `NBD_OPT_GO`.
    pub async fn connect(stream: S, export_name: &str) -> Result<Self, NbdError> {
        let mut handshake = Handshake::start(stream).await?;
        handshake.go(export_name).await?;
        handshake.into_client()
    }

    /// Size of the export in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.export.size_bytes
    }

    fn next_handle(&self) -> u64 {
        self.handle_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a request header and return its handle.
    ///
    /// Together with [`write_payload`](Self::write_payload),
    /// [`read_reply`](Self::read_reply) and [`read_payload`](Self::read_payload)
    /// this allows pipelining several requests before reading replies.
    pub async fn send_request(
        &mut self,
        command: NbdCommand,
        flags: u16,
        offset: u64,
        length: u32,
    ) -> Result<u64, NbdError> {
        let handle = self.next_handle();
        let req = NbdRequest {
            flags,
            command,
            handle,
            offset,
            length,
        };
        self.stream.write_all(&req.to_bytes()).await?;
        Ok(handle)
    }

    /// Send the data of a write request.
    pub async fn write_payload(&mut self, data: &[u8]) -> Result<(), NbdError> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Read one simple reply header.
    pub async fn read_reply(&mut self) -> Result<NbdReply, NbdError> {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        NbdReply::from_bytes(&buf)
    }

    /// Read the data following a successful read reply.
    pub async fn read_payload(&mut self, length: u32) -> Result<Bytes, NbdError> {
        let mut data = BytesMut::zeroed(length as usize);
        self.stream.read_exact(&mut data).await.map_err(|e| {
            NbdError::Io(io::Error::other(format!(
                "failed to read {} bytes of response data: {}",
                length, e
            )))
        })?;
        Ok(data.freeze())
    }

    async fn expect_reply(&mut self, handle: u64) -> Result<(), NbdError> {
        let reply = self.read_reply().await?;
        if reply.handle != handle {
            return Err(NbdError::HandleMismatch {
                expected: handle,
                actual: reply.handle,
            });
        }
        if reply.error != NBD_OK {
            return Err(NbdError::ServerError { code: reply.error });
        }
        Ok(())
    }

    async fn execute_request(
        &mut self,
        command: NbdCommand,
        flags: u16,
        offset: u64,
        length: u32,
    ) -> Result<(), NbdError> {
        let handle = self.send_request(command, flags, offset, length).await?;
        self.expect_reply(handle).await
    }

    /// Read data from the export.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        let handle = self
            .send_request(NbdCommand::Read, 0, offset, length)
            .await?;
        self.expect_reply(handle).await?;
        self.read_payload(length).await
    }

    /// Write data to the export.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        self.write_with_flags(offset, data, 0).await
    }

    /// Write data with command flags such as `NBD_CMD_FLAG_FUA`.
    pub async fn write_with_flags(
        &mut self,
        offset: u64,
        data: &[u8],
        flags: u16,
    ) -> Result<(), NbdError> {
        let handle = self
            .send_request(NbdCommand::Write, flags, offset, data.len() as u32)
            .await?;
        self.write_payload(data).await?;
        self.expect_reply(handle).await
    }

    /// Flush pending writes.
    pub async fn flush(&mut self) -> Result<(), NbdError> {
        self.execute_request(NbdCommand::Flush, 0, 0, 0).await
    }

    /// Trim a range (hint that data is no longer needed).
    pub async fn trim(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        self.execute_request(NbdCommand::Trim, 0, offset, length)
            .await
    }

    /// Write zeroes to a range.
    pub async fn write_zeroes(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        self.execute_request(NbdCommand::WriteZeroes, 0, offset, length)
            .await
    }

    /// Disconnect from the server.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        self.send_request(NbdCommand::Disconnect, 0, 0, 0).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn supports_flush(&self) -> bool {
        (self.export.transmission_flags & NBD_FLAG_SEND_FLUSH) != 0
    }

    pub fn supports_trim(&self) -> bool {
        (self.export.transmission_flags & NBD_FLAG_SEND_TRIM) != 0
    }

    pub fn supports_write_zeroes(&self) -> bool {
        (self.export.transmission_flags & NBD_FLAG_SEND_WRITE_ZEROES) != 0
    }

    pub fn is_read_only(&self) -> bool {
        (self.export.transmission_flags & NBD_FLAG_READ_ONLY) != 0
    }
}
