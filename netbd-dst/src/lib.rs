//! Deterministic Simulation Testing (DST) for netbd.
//!
//! This crate drives seeded random command sequences through real NBD
//! sessions and checks them against an oracle. It is kept apart from the
//! main netbd crate so that test scaffolding never ends up in production
//! binaries.
//!
//! ## Crate Structure
//!
//! - `harness` - Simulation harness and oracle for correctness verification
//! - `simulation` - Single-threaded runtime and simulation runners
//!
//! ## Running DST Tests
//!
//! ```bash
//! # PR-level quick tests
//! cargo test -p netbd-dst simulation
//!
//! # Nightly long-running tests
//! cargo test -p netbd-dst simulation -- --ignored
//!
//! # Reproduce a failure
//! DST_SEED=1234 cargo test -p netbd-dst simulation
//! ```

pub mod harness;
pub mod simulation;

// Re-export NBD client from nbd crate
pub use nbd::{NbdClient, NbdError};

pub use harness::{NbdAction, NbdHarness, NbdOracle, NbdStats, SimulationError};
pub use simulation::{build_runtime, get_seed, run_nbd_simulation};
