//! FUOTA deployment server.
//!
//! Orchestrates firmware updates over-the-air for fleets of LoRaWAN
//! end-devices: it sets up a multicast group on the network server,
//! negotiates a fragmentation session with every device over unicast,
//! broadcasts the forward-error-corrected firmware fragments at a GPS-time
//! aligned multicast session, and records per-device progress durably.
//!
//! Can be used as a library or through the `fuota-server` binary.

pub mod api;
pub mod clocksync;
pub mod config;
pub mod deployment;
pub mod error;
pub mod eventhandler;

// Re-export generated API types.
pub mod proto {
    tonic::include_proto!("fuota.v1");
}
