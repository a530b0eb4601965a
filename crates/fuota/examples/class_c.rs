//! Creates a Class-C FUOTA deployment through the deployment API and polls
//! its status until all phases completed.
//!
//! Run against a local fuota-server with `cargo run --example class_c`.

use std::time::Duration;

use uuid::Uuid;

use applayer::{multicastsetup, Aes128Key};
use fuota::proto::deployment_service_client::DeploymentServiceClient;
use fuota::proto::{
    CreateDeploymentRequest, Deployment, DeploymentDevice, GetDeploymentStatusRequest,
    MulticastGroupType, RequestFragmentationSessionStatus,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let gen_app_key = Aes128Key([
        0x09, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00,
    ]);
    let mc_root_key = multicastsetup::get_mc_root_key_for_gen_app_key(gen_app_key);

    let mut client = DeploymentServiceClient::connect("http://localhost:8090").await?;

    let resp = client
        .create_deployment(CreateDeploymentRequest {
            deployment: Some(Deployment {
                application_id: "1".to_string(),
                devices: vec![DeploymentDevice {
                    dev_eui: hex::decode("0102030405060708")?,
                    mc_root_key: mc_root_key.as_bytes().to_vec(),
                }],
                multicast_group_type: MulticastGroupType::ClassC as i32,
                multicast_dr: 5,
                multicast_frequency: 868_100_000,
                multicast_group_id: 0,
                multicast_timeout: 6,
                multicast_region: "EU868".to_string(),
                unicast_timeout: Some(prost_types::Duration {
                    seconds: 60,
                    nanos: 0,
                }),
                unicast_attempt_count: 1,
                fragmentation_fragment_size: 50,
                payload: (0..1000u32).map(|i| i as u8).collect(),
                fragmentation_redundancy: 1,
                fragmentation_session_index: 0,
                fragmentation_matrix: 0,
                fragmentation_block_ack_delay: 1,
                fragmentation_descriptor: vec![0, 0, 0, 0],
                request_fragmentation_session_status:
                    RequestFragmentationSessionStatus::AfterSessionTimeout as i32,
                ..Default::default()
            }),
        })
        .await?
        .into_inner();

    let id = Uuid::from_slice(&resp.id)?;
    println!("deployment created: {}", id);

    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;

        let status = client
            .get_deployment_status(GetDeploymentStatusRequest {
                id: id.as_bytes().to_vec(),
            })
            .await?
            .into_inner();

        println!(
            "mc-group setup: {} | frag-session setup: {} | mc-session: {} | enqueue: {} | frag-status: {}",
            status.mc_group_setup_completed_at.is_some(),
            status.frag_session_setup_completed_at.is_some(),
            status.mc_session_completed_at.is_some(),
            status.enqueue_completed_at.is_some(),
            status.frag_status_completed_at.is_some(),
        );

        if status.frag_status_completed_at.is_some() {
            break;
        }
    }

    Ok(())
}
