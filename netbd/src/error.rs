//! Error types for netbd.

use std::io;
use thiserror::Error;

// Re-export NbdError from the nbd crate
pub use nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("export registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Storage backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid backend size: {reason}")]
    InvalidSize { reason: &'static str },

    #[error("backend task failed: {message}")]
    Task { message: String },
}

/// Result of a backend operation.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Export registry errors. Returned to whoever manages exports, never sent to
/// NBD clients.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid export name {name:?}: must be non-empty and contain no whitespace")]
    InvalidName { name: String },

    #[error("export already exists: {name}")]
    DuplicateExport { name: String },

    #[error("export not found: {name}")]
    NotFound { name: String },

    #[error("failed to construct backend for export {name}: {source}")]
    BackendConstruction {
        name: String,
        #[source]
        source: BackendError,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("unsupported backend scheme: {scheme}")]
    UnsupportedScheme { scheme: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_error_display() {
        let err = RegistryError::BackendConstruction {
            name: "disk0".to_string(),
            source: BackendError::InvalidSize {
                reason: "must be > 0",
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("disk0"));
        assert!(msg.contains("must be > 0"));
    }

    #[test]
    fn invalid_name_is_quoted() {
        let err = RegistryError::InvalidName {
            name: "bad name".to_string(),
        };
        assert!(err.to_string().contains("\"bad name\""));
    }
}
