//! NBD server implementation.
//!
//! The `NbdServer` handles a single NBD connection, performing the handshake,
//! option negotiation, and transmission phases. It is transport-agnostic and
//! works with any async stream (TCP, Unix, or in-memory).
//!
//! For accepting multiple connections, see `Daemon::listen()` which uses
//! the `Listener` trait.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use nbd::NbdError;

use super::negotiate::{Negotiated, Negotiator};
use super::transmission::Transmission;
use crate::registry::ExportRegistry;
use crate::types::ServerOptions;

/// NBD server for handling a single connection.
///
/// Cheap to clone; all clones share the same registry and options.
#[derive(Clone)]
pub struct NbdServer {
    registry: Arc<ExportRegistry>,
    options: Arc<ServerOptions>,
}

impl NbdServer {
    pub fn new(registry: Arc<ExportRegistry>, options: Arc<ServerOptions>) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<ExportRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Serve a single NBD connection over any async stream.
    ///
    /// Negotiates an export, then enters transmission mode. Returns when the
    /// client disconnects or aborts negotiation, or with an error when the
    /// connection fails or breaks the protocol.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let negotiated = Negotiator::new(&mut stream, &self.registry, &self.options)
            .run()
            .await?;
        let Negotiated::Bound(session) = negotiated else {
            return Ok(());
        };
        Transmission::new(&mut stream, session, &self.options)
            .run()
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fmt;
    use std::io;
    use std::marker::PhantomData;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use nbd::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf, duplex};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::error::{BackendError, BackendResult};

    const MIB: usize = 1024 * 1024;

    /// Counts calls into a memory backend; optionally fails every call.
    struct CountingBackend {
        inner: MemoryBackend,
        reads: AtomicUsize,
        writes: AtomicUsize,
        syncs: AtomicUsize,
        fail: bool,
    }

    impl CountingBackend {
        fn new(size: usize) -> Self {
            Self {
                inner: MemoryBackend::new(size),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                syncs: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing(size: usize) -> Self {
            Self {
                fail: true,
                ..Self::new(size)
            }
        }

        fn io_error(&self) -> BackendResult<()> {
            if self.fail {
                return Err(BackendError::Io(std::io::Error::other("injected failure")));
            }
            Ok(())
        }
    }

    impl fmt::Display for CountingBackend {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "counting {}", self.inner)
        }
    }

    #[async_trait]
    impl Backend for CountingBackend {
        async fn read_at(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.io_error()?;
            self.inner.read_at(buf, offset).await
        }

        async fn write_at(&self, buf: &[u8], offset: u64) -> BackendResult<usize> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.io_error()?;
            self.inner.write_at(buf, offset).await
        }

        async fn size(&self) -> BackendResult<u64> {
            self.inner.size().await
        }

        async fn sync(&self) -> BackendResult<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            self.io_error()
        }

        async fn write_zeroes(&self, offset: u64, length: u64) -> BackendResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.io_error()?;
            self.inner.write_zeroes(offset, length).await
        }
    }

    struct Fixture {
        registry: Arc<ExportRegistry>,
        server: NbdServer,
    }

    impl Fixture {
        fn new(options: ServerOptions) -> Self {
            let registry = Arc::new(ExportRegistry::new());
            let server = NbdServer::new(Arc::clone(&registry), Arc::new(options));
            Self { registry, server }
        }

        async fn with_export(self, name: &str, backend: Arc<dyn Backend>) -> Self {
            self.registry
                .add(name, "test export", move || Ok(backend))
                .await
                .unwrap();
            self
        }

        /// Serve one in-memory connection; returns the client end.
        fn connect(&self) -> (DuplexStream, JoinHandle<Result<(), NbdError>>) {
            let (client, server_stream) = duplex(4 * MIB);
            let server = self.server.clone();
            let task = tokio::spawn(async move { server.serve(server_stream).await });
            (client, task)
        }
    }

    /// A stream that can move to another task but is not `Sync`, like many
    /// TLS and framed transports.
    struct UnsyncStream {
        inner: DuplexStream,
        _unsync: PhantomData<Cell<()>>,
    }

    impl AsyncRead for UnsyncStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for UnsyncStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn memory(size: usize) -> Arc<dyn Backend> {
        Arc::new(MemoryBackend::new(size))
    }

    fn server_code<T: fmt::Debug>(result: Result<T, NbdError>) -> u32 {
        match result {
            Err(NbdError::ServerError { code }) => code,
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disk0_scenario() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(MIB))
            .await;
        let (stream, task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();
        assert_eq!(client.size_bytes(), MIB as u64);

        client.write(0, &[0xAB; 4096]).await.unwrap();
        let data = client.read(0, 4096).await.unwrap();
        assert_eq!(data.as_ref(), &[0xAB; 4096]);

        let result = client.read(MIB as u64 - 1, 2).await;
        assert_eq!(server_code(result), NBD_EINVAL);

        // The connection survives the rejected command.
        client.flush().await.unwrap();
        client.disconnect().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn out_of_range_never_reaches_backend() {
        let backend = Arc::new(CountingBackend::new(4096));
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", backend.clone())
            .await;
        let (stream, _task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();

        let read = client.read(4000, 200).await;
        assert_eq!(server_code(read), NBD_EINVAL);
        let write = client.write(4096, &[1; 1]).await;
        assert_eq!(server_code(write), NBD_ENOSPC);
        let zeroes = client.write_zeroes(1, 4096).await;
        assert_eq!(server_code(zeroes), NBD_ENOSPC);
        let trim = client.trim(u64::MAX - 10, 100).await;
        assert_eq!(server_code(trim), NBD_EINVAL);

        assert_eq!(backend.reads.load(Ordering::SeqCst), 0);
        assert_eq!(backend.writes.load(Ordering::SeqCst), 0);

        // A valid write right after the rejected ones still lands.
        client.write(4095, &[7]).await.unwrap();
        assert_eq!(client.read(4095, 1).await.unwrap().as_ref(), &[7]);
    }

    #[tokio::test]
    async fn read_only_rejects_mutations() {
        let backend = Arc::new(CountingBackend::new(8192));
        backend.inner.write_at(&[0x5A; 8192], 0).await.unwrap();
        let options = ServerOptions {
            read_only: true,
            ..Default::default()
        };
        let fixture = Fixture::new(options)
            .with_export("disk0", backend.clone())
            .await;
        let (stream, _task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();
        assert!(client.is_read_only());

        let write = client.write(0, &[0; 512]).await;
        assert_eq!(server_code(write), NBD_EPERM);
        let trim = client.trim(0, 512).await;
        assert_eq!(server_code(trim), NBD_EPERM);
        let zeroes = client.write_zeroes(0, 512).await;
        assert_eq!(server_code(zeroes), NBD_EPERM);
        assert_eq!(backend.writes.load(Ordering::SeqCst), 0);

        let data = client.read(0, 8192).await.unwrap();
        assert!(data.iter().all(|&b| b == 0x5A));
    }

    #[tokio::test]
    async fn backend_failure_is_per_command() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("bad", Arc::new(CountingBackend::failing(4096)))
            .await;
        let (stream, task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "bad").await.unwrap();

        assert_eq!(server_code(client.read(0, 16).await), NBD_EIO);
        assert_eq!(server_code(client.write(0, &[1; 16]).await), NBD_EIO);
        assert_eq!(server_code(client.flush().await), NBD_EIO);
        assert_eq!(server_code(client.write_zeroes(0, 16).await), NBD_EIO);

        client.disconnect().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fua_write_syncs_backend() {
        let backend = Arc::new(CountingBackend::new(4096));
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", backend.clone())
            .await;
        let (stream, _task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();

        client.write(0, &[1; 64]).await.unwrap();
        assert_eq!(backend.syncs.load(Ordering::SeqCst), 0);
        client
            .write_with_flags(0, &[2; 64], NBD_CMD_FLAG_FUA)
            .await
            .unwrap();
        assert_eq!(backend.syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_zeroes_and_trim() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(64 * 1024))
            .await;
        let (stream, _task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();
        assert!(client.supports_trim());
        assert!(client.supports_write_zeroes());

        client.write(0, &[0xEE; 8192]).await.unwrap();
        client.write_zeroes(1024, 4096).await.unwrap();
        client.trim(0, 64 * 1024).await.unwrap();

        let data = client.read(0, 8192).await.unwrap();
        assert!(data[..1024].iter().all(|&b| b == 0xEE));
        assert!(data[1024..5120].iter().all(|&b| b == 0));
        assert!(data[5120..].iter().all(|&b| b == 0xEE));
    }

    #[tokio::test]
    async fn pipelined_replies_keep_request_order() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(64 * 1024))
            .await;
        let (stream, _task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let handle = client
                .send_request(NbdCommand::Write, 0, i * 512, 512)
                .await
                .unwrap();
            client.write_payload(&[i as u8; 512]).await.unwrap();
            handles.push(handle);
        }
        // An out-of-range read in the middle of the stream still gets its
        // reply in order.
        handles.push(
            client
                .send_request(NbdCommand::Read, 0, 1 << 40, 512)
                .await
                .unwrap(),
        );
        handles.push(
            client
                .send_request(NbdCommand::Flush, 0, 0, 0)
                .await
                .unwrap(),
        );

        for (i, expected) in handles.iter().enumerate() {
            let reply = client.read_reply().await.unwrap();
            assert_eq!(reply.handle, *expected);
            let code = if i == 16 { NBD_EINVAL } else { NBD_OK };
            assert_eq!(reply.error, code);
        }

        let data = client.read(15 * 512, 512).await.unwrap();
        assert!(data.iter().all(|&b| b == 15));
    }

    #[tokio::test]
    async fn oversized_read_gets_overflow() {
        let options = ServerOptions {
            maximum_block_size: 4096,
            ..Default::default()
        };
        let fixture = Fixture::new(options)
            .with_export("disk0", memory(64 * 1024))
            .await;
        let (stream, _task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();
        assert_eq!(client.export.block_size.unwrap().maximum, 4096);

        let read = client.read(0, 8192).await;
        assert_eq!(server_code(read), NBD_EOVERFLOW);

        // The oversized write payload is drained, keeping the stream framed.
        let write = client.write(0, &[3; 8192]).await;
        assert_eq!(server_code(write), NBD_EOVERFLOW);
        client.write(0, &[4; 4096]).await.unwrap();
        assert!(client.read(0, 4096).await.unwrap().iter().all(|&b| b == 4));
    }

    #[tokio::test]
    async fn negotiated_block_size_enforces_alignment() {
        let options = ServerOptions {
            minimum_block_size: 512,
            ..Default::default()
        };
        let fixture = Fixture::new(options)
            .with_export("disk0", memory(64 * 1024))
            .await;
        let (stream, _task) = fixture.connect();
        // The client requests NBD_INFO_BLOCK_SIZE during GO.
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();

        let unaligned = client.read(100, 512).await;
        assert_eq!(server_code(unaligned), NBD_EINVAL);
        client.read(512, 1024).await.unwrap();
    }

    #[tokio::test]
    async fn export_name_skips_alignment_checks() {
        let options = ServerOptions {
            minimum_block_size: 512,
            ..Default::default()
        };
        let fixture = Fixture::new(options)
            .with_export("disk0", memory(64 * 1024))
            .await;
        let (stream, _task) = fixture.connect();
        let handshake = Handshake::start(stream).await.unwrap();
        let mut client = handshake.export_name("disk0").await.unwrap();
        assert_eq!(client.size_bytes(), 64 * 1024);

        client.write(100, b"unaligned").await.unwrap();
        assert_eq!(client.read(100, 9).await.unwrap().as_ref(), b"unaligned");
    }

    #[tokio::test]
    async fn export_name_unknown_closes_connection() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(4096))
            .await;
        let (stream, task) = fixture.connect();
        let handshake = Handshake::start(stream).await.unwrap();

        let result = handshake.export_name("missing").await;
        assert!(matches!(result, Err(NbdError::UnknownExport { .. })));
        assert!(matches!(
            task.await.unwrap(),
            Err(NbdError::UnknownExport { .. })
        ));
    }

    #[tokio::test]
    async fn list_exports() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk1", memory(4096))
            .await
            .with_export("disk0", memory(4096))
            .await;
        let (stream, _task) = fixture.connect();
        let mut handshake = Handshake::start(stream).await.unwrap();

        let exports = handshake.list().await.unwrap();
        let names: Vec<_> = exports.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["disk0", "disk1"]);
        assert_eq!(exports[0].description, "test export");

        handshake.abort().await.unwrap();
    }

    #[tokio::test]
    async fn list_empty_registry() {
        let fixture = Fixture::new(ServerOptions::default());
        let (stream, task) = fixture.connect();
        let mut handshake = Handshake::start(stream).await.unwrap();

        assert!(handshake.list().await.unwrap().is_empty());
        handshake.abort().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn list_with_payload_is_invalid() {
        let fixture = Fixture::new(ServerOptions::default());
        let (stream, _task) = fixture.connect();
        let mut handshake = Handshake::start(stream).await.unwrap();

        handshake.send_option(NBD_OPT_LIST, b"junk").await.unwrap();
        let (header, _) = handshake.read_option_reply().await.unwrap();
        assert_eq!(header.reply_type, NBD_REP_ERR_INVALID);
    }

    #[tokio::test]
    async fn unknown_export_allows_retry() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(4096))
            .await;
        let (stream, _task) = fixture.connect();
        let mut handshake = Handshake::start(stream).await.unwrap();

        let result = handshake.go("missing").await;
        assert!(matches!(result, Err(NbdError::UnknownExport { .. })));

        let info = handshake.info("disk0").await.unwrap();
        assert_eq!(info.size_bytes, 4096);
        assert_eq!(info.name.as_deref(), Some("disk0"));
        assert_eq!(info.description.as_deref(), Some("test export"));

        handshake.go("disk0").await.unwrap();
        let mut client = handshake.into_client().unwrap();
        client.write(0, b"hello").await.unwrap();
        assert_eq!(client.read(0, 5).await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn empty_name_selects_default_export() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("b", memory(8192))
            .await
            .with_export("a", memory(4096))
            .await;
        let (stream, _task) = fixture.connect();
        let client = NbdClient::connect(stream, "").await.unwrap();
        assert_eq!(client.size_bytes(), 4096);
    }

    #[tokio::test]
    async fn malformed_go_payload_is_invalid() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(4096))
            .await;
        let (stream, _task) = fixture.connect();
        let mut handshake = Handshake::start(stream).await.unwrap();

        handshake.send_option(NBD_OPT_GO, &[0, 0]).await.unwrap();
        let (header, _) = handshake.read_option_reply().await.unwrap();
        assert_eq!(header.reply_type, NBD_REP_ERR_INVALID);

        // Zero-length payloads are read and answered too.
        handshake.send_option(NBD_OPT_INFO, &[]).await.unwrap();
        let (header, _) = handshake.read_option_reply().await.unwrap();
        assert_eq!(header.reply_type, NBD_REP_ERR_INVALID);

        handshake.go("disk0").await.unwrap();
    }

    #[tokio::test]
    async fn unsupported_options_keep_haggling() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(4096))
            .await;
        let (stream, _task) = fixture.connect();
        let mut handshake = Handshake::start(stream).await.unwrap();

        for option in [NBD_OPT_STRUCTURED_REPLY, NBD_OPT_STARTTLS, 0x1234] {
            handshake.send_option(option, &[]).await.unwrap();
            let (header, _) = handshake.read_option_reply().await.unwrap();
            assert_eq!(header.option, option);
            assert_eq!(header.reply_type, NBD_REP_ERR_UNSUP);
        }

        handshake.go("disk0").await.unwrap();
    }

    #[tokio::test]
    async fn oversized_option_aborts() {
        let fixture = Fixture::new(ServerOptions::default());
        let (mut stream, task) = fixture.connect();

        let mut hello = [0u8; 18];
        stream.read_exact(&mut hello).await.unwrap();
        stream
            .write_all(&NBD_FLAG_C_FIXED_NEWSTYLE.to_be_bytes())
            .await
            .unwrap();
        let header = OptionHeader {
            option: NBD_OPT_GO,
            length: u32::MAX,
        };
        stream.write_all(&header.to_bytes()).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(NbdError::OptionTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn missing_fixed_newstyle_aborts() {
        let fixture = Fixture::new(ServerOptions::default());
        let (mut stream, task) = fixture.connect();

        let mut hello = [0u8; 18];
        stream.read_exact(&mut hello).await.unwrap();
        stream.write_all(&0u32.to_be_bytes()).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(NbdError::NegotiationFailed { .. })
        ));
        // Nothing further was sent before closing.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn unknown_client_flags_abort() {
        let fixture = Fixture::new(ServerOptions::default());
        let (mut stream, task) = fixture.connect();

        let mut hello = [0u8; 18];
        stream.read_exact(&mut hello).await.unwrap();
        let flags = NBD_FLAG_C_FIXED_NEWSTYLE | 1 << 7;
        stream.write_all(&flags.to_be_bytes()).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(NbdError::UnsupportedClientFlags { .. })
        ));
    }

    #[tokio::test]
    async fn bad_request_magic_is_fatal() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(4096))
            .await;
        let (stream, task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();

        // A write payload sent without its header looks like a bad request.
        client.write_payload(&[0u8; NbdRequest::SIZE_BYTES]).await.unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(NbdError::InvalidMagic { .. })
        ));
    }

    #[tokio::test]
    async fn retired_export_refuses_commands() {
        let backend = Arc::new(CountingBackend::new(4096));
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", backend.clone())
            .await;
        let (stream, task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();
        client.write(0, &[1; 16]).await.unwrap();

        fixture.registry.remove("disk0").await.unwrap();
        let writes = backend.writes.load(Ordering::SeqCst);

        assert_eq!(server_code(client.read(0, 16).await), NBD_ESHUTDOWN);
        assert_eq!(
            server_code(client.write(0, &[2; 16]).await),
            NBD_ESHUTDOWN
        );
        assert_eq!(backend.writes.load(Ordering::SeqCst), writes);

        client.disconnect().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn serves_send_streams_that_are_not_sync() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(4096))
            .await;
        let (client_stream, server_stream) = duplex(MIB);
        let stream = UnsyncStream {
            inner: server_stream,
            _unsync: PhantomData,
        };
        let server = fixture.server.clone();
        let task = tokio::spawn(async move { server.serve(stream).await });

        // Named and default lookups both go through the registry.
        let mut handshake = Handshake::start(client_stream).await.unwrap();
        assert_eq!(handshake.info("").await.unwrap().size_bytes, 4096);
        handshake.go("disk0").await.unwrap();
        let mut client = handshake.into_client().unwrap();

        client.write(0, &[7; 16]).await.unwrap();
        assert_eq!(client.read(0, 16).await.unwrap().as_ref(), &[7; 16]);
        client.disconnect().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn eof_between_requests_is_clean() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(4096))
            .await;
        let (stream, task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();
        client.flush().await.unwrap();

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn truncated_request_header_is_fatal() {
        let fixture = Fixture::new(ServerOptions::default())
            .with_export("disk0", memory(4096))
            .await;
        let (stream, task) = fixture.connect();
        let mut client = NbdClient::connect(stream, "disk0").await.unwrap();

        // Request magic plus half of the flags, then the client goes away.
        client
            .write_payload(&[0x25, 0x60, 0x95, 0x13, 0x00])
            .await
            .unwrap();
        drop(client);

        match task.await.unwrap() {
            Err(NbdError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected a truncated request error, got {other:?}"),
        }
    }
}
