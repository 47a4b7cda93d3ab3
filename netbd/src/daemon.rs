//! Daemon API for running netbd.
//!
//! A [`Daemon`] owns an export registry and the options shared by its
//! sessions, and supervises the connections accepted from a [`Listener`].
//! Daemons are plain values: several can run side by side in one process.
//!
//! # Example
//!
//! ```ignore
//! use netbd::daemon::Daemon;
//! use tokio::net::TcpListener;
//!
//! let daemon = Daemon::from_config(config).await?;
//! let listener = TcpListener::bind(daemon.address()).await?;
//! daemon.listen(listener).await?;
//! ```

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{BackendConfig, Config};
use crate::error::{Error, NbdError, RegistryError};
use crate::nbd::{Listener, NbdServer};
use crate::registry::{Export, ExportRegistry};
use crate::types::ServerOptions;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A netbd server instance.
#[derive(Clone)]
pub struct Daemon {
    registry: Arc<ExportRegistry>,
    server: NbdServer,
    config: Arc<Config>,
    sessions: Arc<AtomicUsize>,
}

impl Daemon {
    /// Create a daemon with an empty registry.
    ///
    /// The exports listed in `config` are not registered; see
    /// [`from_config`](Self::from_config).
    pub fn new(config: Config) -> Result<Self, Error> {
        config.options.validate()?;

        let registry = Arc::new(ExportRegistry::new());
        let server = NbdServer::new(Arc::clone(&registry), Arc::new(config.options.clone()));
        Ok(Self {
            registry,
            server,
            config: Arc::new(config),
            sessions: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Create a daemon and register every export from the configuration.
    pub async fn from_config(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let daemon = Self::new(config)?;
        for export in &daemon.config.exports {
            daemon
                .add_export(&export.name, &export.description, &export.backend)
                .await?;
        }
        Ok(daemon)
    }

    pub fn registry(&self) -> &Arc<ExportRegistry> {
        &self.registry
    }

    /// Get the daemon configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> &ServerOptions {
        self.server.options()
    }

    /// Get the NBD listen address from config.
    pub fn address(&self) -> &str {
        &self.config.server.address
    }

    /// Number of sessions currently being served.
    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Register an export whose backend is described by a URL such as
    /// `memory:?size=1048576` or `file:///var/lib/netbd/disk0.img`.
    ///
    /// The backend is built on the blocking pool before the registry lock is
    /// taken, so sessions looking up exports never wait on filesystem I/O.
    /// Invalid and taken names are rejected before anything is built.
    pub async fn add_export(
        &self,
        name: &str,
        description: &str,
        backend_url: &str,
    ) -> Result<Arc<Export>, Error> {
        let config = BackendConfig::parse(backend_url)?;
        self.registry.check_available(name).await?;

        let backend = config
            .build_blocking()
            .await
            .map_err(|source| RegistryError::BackendConstruction {
                name: name.to_string(),
                source,
            })?;
        let export = self
            .registry
            .add(name, description, move || Ok(backend))
            .await?;
        Ok(export)
    }

    /// Unregister an export. Sessions bound to it are refused further
    /// commands.
    pub async fn remove_export(&self, name: &str) -> Result<Arc<Export>, Error> {
        Ok(self.registry.remove(name).await?)
    }

    pub async fn list_exports(&self) -> Vec<Arc<Export>> {
        self.registry.list().await
    }

    /// Accept NBD connections from any listener until it closes.
    ///
    /// Returns `Ok` once the listener reports `BrokenPipe`. Any other accept
    /// error is logged and the loop keeps going.
    ///
    /// Each connection is served in its own task. A watcher task awaits the
    /// session and logs how it ended, so a failing or panicking session never
    /// takes down the listener or its neighbours.
    ///
    /// # Arguments
    ///
    /// * `listener` - Any type implementing [`Listener`], such as:
    ///   - `TcpListener` for production TCP connections
    ///   - `UnixListener` for Unix domain sockets
    ///   - `StreamListener` for testing with in-memory streams
    pub async fn listen<L>(&self, mut listener: L) -> Result<(), NbdError>
    where
        L: Listener,
    {
        let exports = self.registry.len().await;
        info!(
            exports,
            read_only = self.options().read_only,
            "NBD server accepting connections"
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => self.spawn_session(stream, peer),
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    // Listener exhausted (StreamListener channel closed)
                    return Ok(());
                }
                Err(e) => {
                    // Only this connection is lost. The pause keeps a
                    // persistent failure such as EMFILE from spinning.
                    warn!(error = %e, "failed to accept NBD connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    fn spawn_session<S>(&self, stream: S, peer: String)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let active = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        info!(peer = %peer, active, "session opened");

        let server = self.server.clone();
        let session = tokio::spawn(async move { server.serve(stream).await });

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            match session.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_disconnect() => {
                    debug!(peer = %peer, error = %e, "client went away");
                }
                Ok(Err(e)) => warn!(peer = %peer, error = %e, "NBD session failed"),
                Err(e) if e.is_panic() => {
                    let message = panic_message(e.into_panic());
                    error!(peer = %peer, panic = %message, "NBD session panicked");
                }
                Err(e) => warn!(peer = %peer, error = %e, "NBD session cancelled"),
            }
            let active = sessions.fetch_sub(1, Ordering::SeqCst) - 1;
            info!(peer = %peer, active, "session closed");
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
