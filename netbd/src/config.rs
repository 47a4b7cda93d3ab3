//! Configuration for netbd.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::{Backend, MemoryBackend};
use crate::error::{BackendError, BackendResult, ConfigError};
use crate::types::{DEFAULT_EXPORT_SIZE_BYTES, ServerOptions};

#[cfg(unix)]
use crate::backend::FileBackend;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub options: ServerOptions,
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,
    /// Exports registered at startup. Omitting the table entirely yields the
    /// default in-memory export; an explicit empty list yields none.
    #[serde(default = "default_exports")]
    pub exports: Vec<ExportConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            options: ServerOptions::default(),
            socket: default_socket_path(),
            exports: default_exports(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port` for TCP, a filesystem path for Unix sockets.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub network: Network,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            network: Network::default(),
        }
    }
}

/// Transport the NBD listener binds to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Unix,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            _ => Err(ConfigError::InvalidValue {
                field: "server.network",
                reason: "must be \"tcp\" or \"unix\"",
            }),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Unix => f.write_str("unix"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Backend URL, see [`BackendConfig::parse`].
    #[serde(default = "default_backend_url")]
    pub backend: String,
}

fn default_address() -> String {
    "127.0.0.1:10809".to_string()
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/netbd/netbd.sock")
}

fn default_backend_url() -> String {
    format!("memory:?size={}", DEFAULT_EXPORT_SIZE_BYTES)
}

fn default_exports() -> Vec<ExportConfig> {
    vec![ExportConfig {
        name: "default".to_string(),
        description: "The default export".to_string(),
        backend: default_backend_url(),
    }]
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the server options and every export's backend URL.
    ///
    /// Export names are checked by the registry when the exports are added.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.options.validate()?;
        if self.server.address.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "server.address",
                reason: "must not be empty",
            });
        }
        for export in &self.exports {
            BackendConfig::parse(&export.backend)?;
        }
        Ok(())
    }
}

/// A parsed backend URL.
///
/// - `memory:` or `memory:?size=N`: an in-memory region, 1 GiB by default.
/// - `file:///path/to/image` or `file:///path?size=N`: a file, created and
///   grown to `N` bytes when given, otherwise sized by the existing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Memory { size_bytes: u64 },
    File { path: PathBuf, size_bytes: Option<u64> },
}

impl BackendConfig {
    pub fn parse(url_str: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(url_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let mut size_bytes = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "size" => {
                    let size = value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                        field: "exports.backend",
                        reason: "size must be an unsigned integer",
                    })?;
                    if size == 0 {
                        return Err(ConfigError::InvalidValue {
                            field: "exports.backend",
                            reason: "size must be > 0",
                        });
                    }
                    size_bytes = Some(size);
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: "exports.backend",
                        reason: "unknown query parameter",
                    });
                }
            }
        }

        match url.scheme() {
            "memory" => {
                let size_bytes = size_bytes.unwrap_or(DEFAULT_EXPORT_SIZE_BYTES);
                if usize::try_from(size_bytes).is_err() {
                    return Err(ConfigError::InvalidValue {
                        field: "exports.backend",
                        reason: "memory size exceeds the address space",
                    });
                }
                Ok(Self::Memory { size_bytes })
            }
            "file" => {
                let path = url.to_file_path().map_err(|()| ConfigError::InvalidValue {
                    field: "exports.backend",
                    reason: "file URL must name an absolute local path",
                })?;
                Ok(Self::File { path, size_bytes })
            }
            scheme => Err(ConfigError::UnsupportedScheme {
                scheme: scheme.to_string(),
            }),
        }
    }

    /// Construct the backend. Used as the registry's backend factory.
    pub fn build(&self) -> BackendResult<Arc<dyn Backend>> {
        match self {
            Self::Memory { size_bytes } => {
                let size = usize::try_from(*size_bytes).map_err(|_| BackendError::InvalidSize {
                    reason: "memory size exceeds the address space",
                })?;
                Ok(Arc::new(MemoryBackend::new(size)))
            }
            #[cfg(unix)]
            Self::File { path, size_bytes } => Ok(Arc::new(FileBackend::open(path, *size_bytes)?)),
            #[cfg(not(unix))]
            Self::File { .. } => Err(BackendError::Io(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "file backends require a unix platform",
            ))),
        }
    }

    /// Construct the backend on tokio's blocking pool.
    ///
    /// Opening a file backend may create, grow and sync the file.
    pub async fn build_blocking(&self) -> BackendResult<Arc<dyn Backend>> {
        let config = self.clone();
        tokio::task::spawn_blocking(move || config.build())
            .await
            .map_err(|e| BackendError::Task {
                message: e.to_string(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_memory_export() {
        let config = Config::default();
        assert_eq!(config.server.address, "127.0.0.1:10809");
        assert_eq!(config.server.network, Network::Tcp);
        assert_eq!(config.exports.len(), 1);
        assert_eq!(config.exports[0].name, "default");
        assert_eq!(
            BackendConfig::parse(&config.exports[0].backend).unwrap(),
            BackendConfig::Memory {
                size_bytes: DEFAULT_EXPORT_SIZE_BYTES
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_toml() {
        let config: Config = toml::from_str(
            r#"
            socket = "/tmp/netbd.sock"

            [server]
            address = "/tmp/nbd.sock"
            network = "unix"

            [options]
            read_only = true
            minimum_block_size = 512

            [[exports]]
            name = "disk0"
            description = "first disk"
            backend = "memory:?size=1048576"

            [[exports]]
            name = "disk1"
            backend = "file:///var/lib/netbd/disk1.img"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.network, Network::Unix);
        assert!(config.options.read_only);
        assert_eq!(config.options.minimum_block_size, 512);
        assert_eq!(config.options.preferred_block_size, 4096);
        assert_eq!(config.socket, PathBuf::from("/tmp/netbd.sock"));
        assert_eq!(config.exports.len(), 2);
        assert_eq!(config.exports[1].description, "");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_empty_exports() {
        let config: Config = toml::from_str("exports = []").unwrap();
        assert!(config.exports.is_empty());

        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.exports.len(), 1);
    }

    #[test]
    fn validate_rejects_bad_block_sizes() {
        let mut config = Config::default();
        config.options.minimum_block_size = 1000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "minimum_block_size",
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_bad_backend() {
        let mut config = Config::default();
        config.exports[0].backend = "s3://bucket/disk".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn network_from_str() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("unix".parse::<Network>().unwrap(), Network::Unix);
        assert!("udp".parse::<Network>().is_err());
        assert_eq!(Network::Unix.to_string(), "unix");
    }

    #[test]
    fn backend_url_memory() {
        assert_eq!(
            BackendConfig::parse("memory:?size=4096").unwrap(),
            BackendConfig::Memory { size_bytes: 4096 }
        );
        assert_eq!(
            BackendConfig::parse("memory:").unwrap(),
            BackendConfig::Memory {
                size_bytes: DEFAULT_EXPORT_SIZE_BYTES
            }
        );
    }

    #[test]
    fn backend_url_file() {
        assert_eq!(
            BackendConfig::parse("file:///tmp/disk.img?size=8192").unwrap(),
            BackendConfig::File {
                path: PathBuf::from("/tmp/disk.img"),
                size_bytes: Some(8192),
            }
        );
        assert_eq!(
            BackendConfig::parse("file:///tmp/disk.img").unwrap(),
            BackendConfig::File {
                path: PathBuf::from("/tmp/disk.img"),
                size_bytes: None,
            }
        );
    }

    #[test]
    fn backend_url_errors() {
        assert!(matches!(
            BackendConfig::parse("not a url"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            BackendConfig::parse("ftp://example.com/disk"),
            Err(ConfigError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            BackendConfig::parse("memory:?size=0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            BackendConfig::parse("memory:?size=lots"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            BackendConfig::parse("memory:?sise=10"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn builds_memory_backend() {
        let backend = BackendConfig::Memory { size_bytes: 4096 }.build().unwrap();
        assert_eq!(backend.size().await.unwrap(), 4096);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn builds_file_backend_off_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let backend = BackendConfig::File {
            path: path.clone(),
            size_bytes: Some(4096),
        }
        .build_blocking()
        .await
        .unwrap();

        assert_eq!(backend.size().await.unwrap(), 4096);
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn builds_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let backend = BackendConfig::File {
            path: path.clone(),
            size_bytes: Some(8192),
        }
        .build()
        .unwrap();

        assert_eq!(backend.size().await.unwrap(), 8192);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
    }
}
