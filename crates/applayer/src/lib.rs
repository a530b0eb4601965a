//! Application-layer protocol support for FUOTA deployments.
//!
//! This crate implements the three LoRa Alliance application-layer packages
//! the FUOTA server speaks with its end-devices:
//!
//! - Remote Multicast Setup (TS005) — [`multicastsetup`]
//! - Fragmented Data Block Transport (TS004) — [`fragmentation`]
//! - Application Layer Clock Synchronization (TS003) — [`clocksync`]
//!
//! plus the forward-error-correction fragment encoder/decoder, the multicast
//! key derivations and GPS time conversion. Everything here is pure: no I/O,
//! no async, byte slices in and byte vectors out.

pub mod clocksync;
pub mod fragmentation;
pub mod gps;
pub mod multicastsetup;

mod types;

pub use types::{Aes128Key, DevAddr, Eui64, TypeError};

use thiserror::Error;

/// Errors shared by the command codecs of all three command families.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command payload is truncated or has an unexpected length")]
    InvalidLength,

    #[error("unknown CID: {0:#04x}")]
    UnknownCid(u8),

    #[error("{0} out of range")]
    OutOfRange(&'static str),
}
