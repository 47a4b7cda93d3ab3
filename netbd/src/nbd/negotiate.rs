//! Negotiation phase of a connection.
//!
//! A connection moves through
//! `AwaitingClientFlags -> OptionHaggling -> {ExportBound | Aborted}`.
//! Protocol violations surface as `Err` and end the connection without
//! sending anything further. Per-option failures (unknown export, malformed
//! payload, unsupported option) are answered with an error reply and
//! haggling continues.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use nbd::*;

use crate::registry::{Export, ExportRegistry};
use crate::types::ServerOptions;

/// Outcome of a successful negotiation: the export bound to the connection.
#[derive(Debug)]
pub(crate) struct Session {
    pub export: Arc<Export>,
    /// The client asked for `NBD_INFO_BLOCK_SIZE` and so committed to honor
    /// the advertised constraints.
    pub block_size_negotiated: bool,
}

#[derive(Debug)]
pub(crate) enum Negotiated {
    Bound(Session),
    Aborted,
}

enum State {
    AwaitingClientFlags,
    OptionHaggling { no_zeroes: bool },
    ExportBound(Session),
    Aborted,
}

pub(crate) struct Negotiator<'a, S> {
    stream: &'a mut S,
    registry: &'a ExportRegistry,
    options: &'a ServerOptions,
}

impl<'a, S> Negotiator<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: &'a mut S, registry: &'a ExportRegistry, options: &'a ServerOptions) -> Self {
        Self {
            stream,
            registry,
            options,
        }
    }

    pub async fn run(mut self) -> Result<Negotiated, NbdError> {
        let mut state = State::AwaitingClientFlags;
        loop {
            state = match state {
                State::AwaitingClientFlags => State::OptionHaggling {
                    no_zeroes: self.handshake().await?,
                },
                State::OptionHaggling { no_zeroes } => self.haggle(no_zeroes).await?,
                State::ExportBound(session) => return Ok(Negotiated::Bound(session)),
                State::Aborted => return Ok(Negotiated::Aborted),
            };
        }
    }

    /// Send the greeting and validate the client flags. Returns whether the
    /// client asked to skip the zero padding after `NBD_OPT_EXPORT_NAME`.
    async fn handshake(&mut self) -> Result<bool, NbdError> {
        let mut hello = [0u8; 18];
        hello[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
        hello[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        let flags = NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES;
        hello[16..18].copy_from_slice(&flags.to_be_bytes());
        self.stream.write_all(&hello).await?;

        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf).await?;
        let client_flags = u32::from_be_bytes(buf);

        if (client_flags & NBD_FLAG_C_FIXED_NEWSTYLE) == 0 {
            return Err(NbdError::NegotiationFailed {
                reason: "client must use fixed newstyle",
            });
        }
        if (client_flags & !NBD_FLAG_C_KNOWN) != 0 {
            return Err(NbdError::UnsupportedClientFlags {
                flags: client_flags,
            });
        }

        Ok((client_flags & NBD_FLAG_C_NO_ZEROES) != 0)
    }

    /// Read and answer one option.
    async fn haggle(&mut self, no_zeroes: bool) -> Result<State, NbdError> {
        let mut buf = [0u8; OptionHeader::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        // Oversized payloads are rejected here, before anything is allocated.
        let header = OptionHeader::from_bytes(&buf)?;

        let mut data = vec![0u8; header.length as usize];
        self.stream.read_exact(&mut data).await?;

        let option = header.option;
        debug!(option, length = header.length, "NBD option");

        match option {
            NBD_OPT_LIST => {
                if !data.is_empty() {
                    self.send_reply(option, NBD_REP_ERR_INVALID, &[]).await?;
                    return Ok(State::OptionHaggling { no_zeroes });
                }
                for export in self.registry.list().await {
                    let listing = ExportListing {
                        name: export.name().to_string(),
                        description: export.description().to_string(),
                    };
                    self.send_reply(option, NBD_REP_SERVER, &listing.to_bytes())
                        .await?;
                }
                self.send_reply(option, NBD_REP_ACK, &[]).await?;
                Ok(State::OptionHaggling { no_zeroes })
            }
            NBD_OPT_EXPORT_NAME => {
                // This option has no error reply; an unknown name ends the
                // connection.
                let name = String::from_utf8_lossy(&data).into_owned();
                let export = resolve(self.registry, &name)
                    .await
                    .ok_or(NbdError::UnknownExport { name })?;

                let mut resp = [0u8; 10];
                resp[0..8].copy_from_slice(&export.size_bytes().to_be_bytes());
                resp[8..10].copy_from_slice(&self.options.transmission_flags().to_be_bytes());
                self.stream.write_all(&resp).await?;
                if !no_zeroes {
                    self.stream
                        .write_all(&[0u8; EXPORT_NAME_PADDING_BYTES])
                        .await?;
                }

                debug!(export = export.name(), "export selected");
                Ok(State::ExportBound(Session {
                    export,
                    block_size_negotiated: false,
                }))
            }
            NBD_OPT_GO | NBD_OPT_INFO => {
                let Some(request) = ExportRequest::from_bytes(&data) else {
                    self.send_reply(option, NBD_REP_ERR_INVALID, &[]).await?;
                    return Ok(State::OptionHaggling { no_zeroes });
                };
                let Some(export) = resolve(self.registry, &request.name).await else {
                    debug!(export = %request.name, "unknown export requested");
                    self.send_reply(option, NBD_REP_ERR_UNKNOWN, &[]).await?;
                    return Ok(State::OptionHaggling { no_zeroes });
                };

                self.send_export_info(option, &export, &request.info_requests)
                    .await?;
                self.send_reply(option, NBD_REP_ACK, &[]).await?;

                if option == NBD_OPT_INFO {
                    return Ok(State::OptionHaggling { no_zeroes });
                }
                debug!(export = export.name(), "export selected");
                Ok(State::ExportBound(Session {
                    export,
                    block_size_negotiated: request.info_requests.contains(&NBD_INFO_BLOCK_SIZE),
                }))
            }
            NBD_OPT_ABORT => {
                self.send_reply(option, NBD_REP_ACK, &[]).await?;
                Ok(State::Aborted)
            }
            // STARTTLS, STRUCTURED_REPLY and anything unknown.
            _ => {
                self.send_reply(option, NBD_REP_ERR_UNSUP, &[]).await?;
                Ok(State::OptionHaggling { no_zeroes })
            }
        }
    }

    async fn send_export_info(
        &mut self,
        option: u32,
        export: &Export,
        info_requests: &[u16],
    ) -> Result<(), NbdError> {
        let info = export_info_bytes(export.size_bytes(), self.options.transmission_flags());
        self.send_reply(option, NBD_REP_INFO, &info).await?;

        for &info_type in info_requests {
            let text = match info_type {
                NBD_INFO_NAME => export.name(),
                NBD_INFO_DESCRIPTION => export.description(),
                _ => continue,
            };
            let mut payload = Vec::with_capacity(2 + text.len());
            payload.extend_from_slice(&info_type.to_be_bytes());
            payload.extend_from_slice(text.as_bytes());
            self.send_reply(option, NBD_REP_INFO, &payload).await?;
        }

        // Block size constraints are always advertised; only clients that
        // asked for them are held to the minimum alignment.
        let block = self.options.block_size_constraints().to_info_bytes();
        self.send_reply(option, NBD_REP_INFO, &block).await
    }

    async fn send_reply(
        &mut self,
        option: u32,
        reply_type: u32,
        data: &[u8],
    ) -> Result<(), NbdError> {
        let header = OptionReplyHeader {
            option,
            reply_type,
            length: data.len() as u32,
        };
        self.stream.write_all(&header.to_bytes()).await?;
        if !data.is_empty() {
            self.stream.write_all(data).await?;
        }
        Ok(())
    }
}

/// Look up an export by name. The empty name selects the default export, the
/// first one in name order.
///
/// Takes the registry alone so no borrow of the connection's stream is held
/// while waiting on the registry lock.
async fn resolve(registry: &ExportRegistry, name: &str) -> Option<Arc<Export>> {
    if name.is_empty() {
        return registry.list().await.into_iter().next();
    }
    registry.lookup(name).await.ok()
}
