//! NBD (Network Block Device) server implementation.
//!
//! This module serves the `nbd` crate's protocol against the exports of an
//! [`ExportRegistry`](crate::registry::ExportRegistry).
//!
//! # Architecture
//!
//! - [`NbdServer`] handles a single NBD connection: negotiation, then
//!   transmission
//! - [`Listener`] trait abstracts over connection sources (TCP, Unix, channels)
//! - [`StreamListener`] accepts streams from a channel (for testing/benchmarks)
//!
//! For serving multiple connections, use `Daemon::listen()` which accepts any
//! `Listener` implementation.

mod listener;
mod negotiate;
mod server;
mod transmission;

pub use listener::{Listener, StreamListener};
// Re-export protocol types from the nbd crate
pub use nbd::{NbdCommand, NbdReply, NbdRequest};
pub use server::NbdServer;
