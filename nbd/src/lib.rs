//! NBD (Network Block Device) protocol implementation.
//!
//! This crate provides a pure Rust implementation of the NBD fixed newstyle
//! protocol: wire constants and codecs shared by servers and clients, and an
//! async client used to talk to NBD servers.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

mod client;
mod protocol;

pub use client::{ExportDetails, Handshake, NbdClient};
pub use protocol::*;
