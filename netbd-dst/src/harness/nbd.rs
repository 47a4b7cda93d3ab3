//! NBD protocol-level simulation harness.
//!
//! Drives random commands through a real NBD session against a daemon export
//! and checks every read against a byte-level oracle.

use std::collections::{HashMap, HashSet};

use nbd::{NBD_EINVAL, NBD_ENOSPC, NbdClient, NbdError};
use netbd::config::Config;
use netbd::daemon::Daemon;
use netbd::nbd::StreamListener;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{DuplexStream, duplex};
use tokio::sync::mpsc;

use super::SimulationError;

const EXPORT_NAME: &str = "sim";

/// Actions that can be performed in NBD simulation.
#[derive(Debug, Clone)]
pub enum NbdAction {
    Read { offset: u64, length: u32 },
    Write { offset: u64, data: Vec<u8>, fua: bool },
    Trim { offset: u64, length: u32 },
    WriteZeroes { offset: u64, length: u32 },
    Flush,
    /// A read or write that ends past the export; must be refused.
    OutOfRange { offset: u64, length: u32, write: bool },
    /// Disconnect and negotiate a fresh session.
    Reconnect,
}

/// Byte-level oracle for NBD verification.
///
/// Trimmed bytes are indeterminate until written again: a backend may keep
/// or discard them.
pub struct NbdOracle {
    data: HashMap<u64, u8>,
    indeterminate: HashSet<u64>,
}

impl NbdOracle {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            indeterminate: HashSet::new(),
        }
    }

    /// Expected contents; `None` for indeterminate bytes.
    pub fn read(&self, offset: u64, length: u32) -> Vec<Option<u8>> {
        (offset..offset + length as u64)
            .map(|pos| {
                if self.indeterminate.contains(&pos) {
                    None
                } else {
                    Some(self.data.get(&pos).copied().unwrap_or(0))
                }
            })
            .collect()
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let pos = offset + i as u64;
            self.indeterminate.remove(&pos);
            if byte == 0 {
                self.data.remove(&pos);
            } else {
                self.data.insert(pos, byte);
            }
        }
    }

    pub fn trim(&mut self, offset: u64, length: u32) {
        for pos in offset..offset + length as u64 {
            if self.data.contains_key(&pos) {
                self.indeterminate.insert(pos);
            }
        }
    }

    pub fn write_zeroes(&mut self, offset: u64, length: u32) {
        for pos in offset..offset + length as u64 {
            self.data.remove(&pos);
            self.indeterminate.remove(&pos);
        }
    }
}

impl Default for NbdOracle {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct NbdStats {
    pub operations: u64,
    pub reads: u64,
    pub writes: u64,
    pub trims: u64,
    pub write_zeroes: u64,
    pub flushes: u64,
    pub rejected: u64,
    pub reconnects: u64,
}

/// NBD protocol-level simulation harness.
pub struct NbdHarness {
    rng: SmallRng,
    backend_url: String,
    client: Option<NbdClient<DuplexStream>>,
    streams: Option<mpsc::Sender<DuplexStream>>,
    oracle: NbdOracle,
    size_bytes: u64,
    stats: NbdStats,
    // Keep listen task handle to ensure it stays alive
    _listen_handle: Option<tokio::task::JoinHandle<()>>,
}

impl NbdHarness {
    /// `backend_url` describes the export's backend, e.g.
    /// `memory:?size=1048576`.
    pub fn new(seed: u64, backend_url: impl Into<String>) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            backend_url: backend_url.into(),
            client: None,
            streams: None,
            oracle: NbdOracle::new(),
            size_bytes: 0,
            stats: NbdStats::default(),
            _listen_handle: None,
        }
    }

    pub async fn init(&mut self) -> Result<(), netbd::Error> {
        let config = Config {
            exports: Vec::new(),
            ..Default::default()
        };
        let daemon = Daemon::new(config)?;
        let export = daemon
            .add_export(EXPORT_NAME, "simulation export", &self.backend_url)
            .await?;
        self.size_bytes = export.size_bytes();

        let (stream_tx, listener) = StreamListener::new(1);
        let handle = tokio::spawn({
            let daemon = daemon.clone();
            async move {
                let _ = daemon.listen(listener).await;
            }
        });
        self._listen_handle = Some(handle);
        self.streams = Some(stream_tx);

        self.client = Some(self.connect().await?);
        Ok(())
    }

    async fn connect(&self) -> Result<NbdClient<DuplexStream>, NbdError> {
        let (client_stream, server_stream) = duplex(1024 * 1024);
        let streams = self.streams.as_ref().ok_or(NbdError::NegotiationFailed {
            reason: "harness not initialized",
        })?;
        streams.send(server_stream).await.map_err(|_| {
            NbdError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "listener closed",
            ))
        })?;
        NbdClient::connect(client_stream, EXPORT_NAME).await
    }

    fn client(&mut self) -> Result<&mut NbdClient<DuplexStream>, SimulationError> {
        self.client
            .as_mut()
            .ok_or_else(|| SimulationError::Unexpected("not initialized".to_string()))
    }

    /// Run the simulation for a given number of operations.
    pub async fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await?;
            self.stats.operations += 1;
        }
        Ok(())
    }

    /// Pick a random in-range `(offset, length)` with `length <= max_len`.
    fn sample_range(&mut self, max_len: u64) -> (u64, u32) {
        let max_len = max_len.min(self.size_bytes).max(1);
        let length = self.rng.random_range(1..=max_len);
        let max_offset = self.size_bytes.saturating_sub(length);
        let offset = if max_offset > 0 {
            self.rng.random_range(0..=max_offset)
        } else {
            0
        };
        (offset, length as u32)
    }

    fn sample_action(&mut self) -> NbdAction {
        let choice = self.rng.random_range(0..100);
        match choice {
            0..35 => {
                let (offset, length) = self.sample_range(32 * 1024);
                NbdAction::Read { offset, length }
            }
            35..65 => {
                let (offset, length) = self.sample_range(32 * 1024);
                let data: Vec<u8> = (0..length).map(|_| self.rng.random()).collect();
                let fua = self.rng.random_bool(0.1);
                NbdAction::Write { offset, data, fua }
            }
            65..72 => {
                let (offset, length) = self.sample_range(64 * 1024);
                NbdAction::Trim { offset, length }
            }
            72..82 => {
                let (offset, length) = self.sample_range(64 * 1024);
                NbdAction::WriteZeroes { offset, length }
            }
            82..90 => NbdAction::Flush,
            90..97 => {
                let length = self.rng.random_range(1..=4096u32);
                // Starts inside the export but runs past its end.
                let offset = self.size_bytes
                    - self.rng.random_range(0..length as u64).min(self.size_bytes);
                NbdAction::OutOfRange {
                    offset,
                    length,
                    write: self.rng.random_bool(0.5),
                }
            }
            _ => NbdAction::Reconnect,
        }
    }

    /// Execute a single action.
    pub async fn execute(&mut self, action: NbdAction) -> Result<(), SimulationError> {
        match action {
            NbdAction::Read { offset, length } => {
                self.stats.reads += 1;
                let expected = self.oracle.read(offset, length);
                let actual = self
                    .client()?
                    .read(offset, length)
                    .await
                    .map_err(unexpected)?;

                if let Some(pos) = find_diff(&expected, &actual) {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "read(offset={}, len={}): first diff at byte {}",
                            offset, length, pos
                        ),
                    });
                }
            }
            NbdAction::Write { offset, data, fua } => {
                self.stats.writes += 1;
                self.oracle.write(offset, &data);
                let flags = if fua { nbd::NBD_CMD_FLAG_FUA } else { 0 };
                self.client()?
                    .write_with_flags(offset, &data, flags)
                    .await
                    .map_err(unexpected)?;
            }
            NbdAction::Trim { offset, length } => {
                self.stats.trims += 1;
                self.oracle.trim(offset, length);
                self.client()?
                    .trim(offset, length)
                    .await
                    .map_err(unexpected)?;
            }
            NbdAction::WriteZeroes { offset, length } => {
                self.stats.write_zeroes += 1;
                self.oracle.write_zeroes(offset, length);
                self.client()?
                    .write_zeroes(offset, length)
                    .await
                    .map_err(unexpected)?;
            }
            NbdAction::Flush => {
                self.stats.flushes += 1;
                self.client()?.flush().await.map_err(unexpected)?;
            }
            NbdAction::OutOfRange {
                offset,
                length,
                write,
            } => {
                self.stats.rejected += 1;
                let client = self.client()?;
                let (result, expected) = if write {
                    let data = vec![0xFF; length as usize];
                    (client.write(offset, &data).await, NBD_ENOSPC)
                } else {
                    (client.read(offset, length).await.map(|_| ()), NBD_EINVAL)
                };
                match result {
                    Err(NbdError::ServerError { code }) if code == expected => {}
                    other => {
                        return Err(SimulationError::Mismatch {
                            context: format!(
                                "out-of-range {}(offset={}, len={}): expected error {}, got {:?}",
                                if write { "write" } else { "read" },
                                offset,
                                length,
                                expected,
                                other
                            ),
                        });
                    }
                }
            }
            NbdAction::Reconnect => {
                self.stats.reconnects += 1;
                if let Some(client) = self.client.take() {
                    client.disconnect().await.map_err(unexpected)?;
                }
                let client = self.connect().await.map_err(unexpected)?;
                if client.size_bytes() != self.size_bytes {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "reconnect: export size {} != {}",
                            client.size_bytes(),
                            self.size_bytes
                        ),
                    });
                }
                self.client = Some(client);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> &NbdStats {
        &self.stats
    }
}

fn unexpected(e: NbdError) -> SimulationError {
    SimulationError::Unexpected(e.to_string())
}

/// Position of the first determinate byte that differs, if any.
fn find_diff(expected: &[Option<u8>], actual: &[u8]) -> Option<usize> {
    if expected.len() != actual.len() {
        return Some(expected.len().min(actual.len()));
    }
    expected
        .iter()
        .zip(actual)
        .position(|(e, a)| e.is_some_and(|e| e != *a))
}
