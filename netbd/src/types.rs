//! Core types for netbd.

use nbd::{
    BlockSizeConstraints, NBD_FLAG_HAS_FLAGS, NBD_FLAG_READ_ONLY, NBD_FLAG_SEND_FLUSH,
    NBD_FLAG_SEND_FUA, NBD_FLAG_SEND_TRIM, NBD_FLAG_SEND_WRITE_ZEROES, NBD_MAX_PAYLOAD_SIZE,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Size of the export created when no configuration is given (1 GiB).
pub const DEFAULT_EXPORT_SIZE_BYTES: u64 = 1024 * 1024 * 1024;

/// Largest minimum block size a server may advertise (64 KiB).
pub const MAX_MINIMUM_BLOCK_SIZE: u32 = 64 * 1024;

/// Sentinel maximum block size meaning "no limit beyond the export size".
pub const UNBOUNDED_BLOCK_SIZE: u32 = u32::MAX;

/// Options shared by every session of a server.
///
/// Built once at startup and never mutated afterwards; sessions hold it
/// behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub read_only: bool,
    pub minimum_block_size: u32,
    pub preferred_block_size: u32,
    pub maximum_block_size: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            minimum_block_size: 1,
            preferred_block_size: 4096,
            maximum_block_size: UNBOUNDED_BLOCK_SIZE,
        }
    }
}

impl ServerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = self.minimum_block_size;
        let preferred = self.preferred_block_size;
        let max = self.maximum_block_size;

        if !min.is_power_of_two() || min > MAX_MINIMUM_BLOCK_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "minimum_block_size",
                reason: "must be a power of two no larger than 65536",
            });
        }
        if !preferred.is_power_of_two() || preferred < min.max(512) {
            return Err(ConfigError::InvalidValue {
                field: "preferred_block_size",
                reason: "must be a power of two of at least 512 and minimum_block_size",
            });
        }
        if max < preferred {
            return Err(ConfigError::InvalidValue {
                field: "maximum_block_size",
                reason: "must be no smaller than preferred_block_size",
            });
        }
        if max != UNBOUNDED_BLOCK_SIZE && max % min != 0 {
            return Err(ConfigError::InvalidValue {
                field: "maximum_block_size",
                reason: "must be a multiple of minimum_block_size or 4294967295",
            });
        }
        Ok(())
    }

    /// Block size constraints as advertised with `NBD_INFO_BLOCK_SIZE`.
    pub fn block_size_constraints(&self) -> BlockSizeConstraints {
        BlockSizeConstraints {
            minimum: self.minimum_block_size,
            preferred: self.preferred_block_size,
            maximum: self.maximum_block_size,
        }
    }

    /// Largest read or write payload a session accepts.
    ///
    /// Bounded by the protocol's 32 MiB payload limit regardless of the
    /// configured maximum block size.
    pub fn max_payload_bytes(&self) -> u32 {
        self.maximum_block_size.min(NBD_MAX_PAYLOAD_SIZE)
    }

    /// Transmission flags sent to clients when an export is selected.
    pub fn transmission_flags(&self) -> u16 {
        let mut flags = NBD_FLAG_HAS_FLAGS
            | NBD_FLAG_SEND_FLUSH
            | NBD_FLAG_SEND_FUA
            | NBD_FLAG_SEND_TRIM
            | NBD_FLAG_SEND_WRITE_ZEROES;
        if self.read_only {
            flags |= NBD_FLAG_READ_ONLY;
        }
        flags
    }
}
