//! Simulation runners and utilities.
//!
//! Every random choice is drawn from a `SmallRng` seeded with the simulation
//! seed, and sessions run on a single-threaded runtime, so a failing seed
//! replays the same command sequence.

use crate::harness::{NbdHarness, SimulationError};

/// Build a single-threaded tokio runtime for simulation.
pub fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

/// Run an NBD simulation with the given seed against an export backed by
/// `backend_url`.
pub async fn run_nbd_simulation(
    seed: u64,
    backend_url: &str,
    operations: u64,
) -> Result<(), SimulationError> {
    eprintln!(
        "NBD simulation: seed={}, backend={}, ops={}",
        seed, backend_url, operations
    );

    let mut harness = NbdHarness::new(seed, backend_url);
    harness
        .init()
        .await
        .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
    harness.run(operations).await?;

    let stats = harness.stats();
    eprintln!("NBD simulation complete: {:?}", stats);
    Ok(())
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}
