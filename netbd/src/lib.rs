//! netbd: an NBD server exposing named block-storage exports.
//!
//! Clients negotiate an export over the fixed-newstyle NBD handshake and then
//! issue read, write, flush, trim and write-zeroes commands against the
//! export's [`Backend`](backend::Backend).
//!
//! # Library Usage
//!
//! The primary API for running netbd is the [`Daemon`] struct:
//!
//! ```ignore
//! use netbd::{Config, Daemon};
//! use tokio::net::TcpListener;
//!
//! let daemon = Daemon::from_config(Config::default()).await?;
//! daemon.add_export("disk0", "scratch disk", "memory:?size=1048576").await?;
//! let listener = TcpListener::bind(daemon.address()).await?;
//! daemon.listen(listener).await?;
//! ```

pub mod backend;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod nbd;
pub mod registry;
pub mod types;

pub use backend::{Backend, MemoryBackend};
#[cfg(unix)]
pub use backend::FileBackend;
pub use config::{BackendConfig, Config, ExportConfig, Network, ServerConfig};
pub use daemon::Daemon;
pub use error::{BackendError, BackendResult, ConfigError, Error, NbdError, RegistryError, Result};
pub use nbd::{Listener, NbdServer, StreamListener};
pub use registry::{Export, ExportRegistry};
pub use types::{DEFAULT_EXPORT_SIZE_BYTES, ServerOptions};
