//! Network-server client surface consumed by the FUOTA orchestrator.
//!
//! The orchestrator only depends on the [`NetworkServerClient`] trait, so
//! tests can substitute a scripted implementation. Production uses
//! [`ChirpStackClient`], a thin wrapper over the ChirpStack gRPC API.

mod chirpstack;

pub use chirpstack::{ChirpStackClient, ChirpStackConfig};

use async_trait::async_trait;
use thiserror::Error;

use applayer::Eui64;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("request failed: {0}")]
    Status(#[from] tonic::Status),

    #[error("unknown region: {0}")]
    UnknownRegion(String),

    #[error("api token contains invalid characters")]
    InvalidToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastGroupType {
    ClassB,
    ClassC,
}

/// Parameters for creating a multicast group on the network server.
///
/// Addresses and keys are hex-encoded strings, the representation the
/// network-server API expects.
#[derive(Debug, Clone)]
pub struct MulticastGroupConfig {
    pub name: String,
    pub application_id: String,
    pub region: String,
    pub mc_addr: String,
    pub mc_nwk_s_key: String,
    pub mc_app_s_key: String,
    pub group_type: MulticastGroupType,
    pub dr: u8,
    pub frequency: u32,
    /// Ping-slot periodicity 0..=7, Class-B groups only.
    pub class_b_ping_slot_periodicity: u8,
}

/// Class-B ping-slot period for a periodicity code: 2^(5 + periodicity).
pub fn class_b_ping_slot_period(periodicity: u8) -> u32 {
    1 << (5 + periodicity as u32)
}

/// A unicast downlink to enqueue for one device.
#[derive(Debug, Clone)]
pub struct DeviceQueueItem {
    pub dev_eui: Eui64,
    pub f_port: u8,
    pub data: Vec<u8>,
}

/// A multicast downlink to enqueue on a multicast group.
#[derive(Debug, Clone)]
pub struct MulticastQueueItem {
    pub multicast_group_id: String,
    pub f_cnt: u32,
    pub f_port: u8,
    pub data: Vec<u8>,
}

/// The operations the FUOTA server needs from the network server.
#[async_trait]
pub trait NetworkServerClient: Send + Sync {
    /// Creates a multicast group and returns its identifier.
    async fn create_multicast_group(
        &self,
        group: MulticastGroupConfig,
    ) -> Result<String, ClientError>;

    async fn delete_multicast_group(&self, id: &str) -> Result<(), ClientError>;

    async fn add_device_to_multicast_group(
        &self,
        id: &str,
        dev_eui: Eui64,
    ) -> Result<(), ClientError>;

    /// Enqueues a multicast downlink; returns the scheduled frame counter.
    async fn enqueue_multicast(&self, item: MulticastQueueItem) -> Result<u32, ClientError>;

    async fn enqueue_device(&self, item: DeviceQueueItem) -> Result<(), ClientError>;
}
