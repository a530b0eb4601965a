//! Deployment gRPC API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{error, info};
use uuid::Uuid;

use applayer::{Aes128Key, Eui64};
use ns_client::{MulticastGroupType, NetworkServerClient};
use storage::DeploymentStore;

use crate::deployment::{Deployment, DeploymentOptions, DeviceOptions, FragSessionStatusRequest};
use crate::eventhandler::EventRouter;
use crate::proto;
use crate::proto::deployment_service_server::{DeploymentService, DeploymentServiceServer};

pub struct DeploymentServiceImpl {
    store: Arc<dyn DeploymentStore>,
    client: Arc<dyn NetworkServerClient>,
    router: Arc<EventRouter>,
}

impl DeploymentServiceImpl {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        client: Arc<dyn NetworkServerClient>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            store,
            client,
            router,
        }
    }
}

fn deployment_options(req: proto::Deployment) -> Result<DeploymentOptions, Status> {
    if req.devices.is_empty() {
        return Err(Status::invalid_argument("deployment has no devices"));
    }
    if req.fragmentation_fragment_size == 0 {
        return Err(Status::invalid_argument(
            "fragmentation_fragment_size must be greater than zero",
        ));
    }
    if req.payload.is_empty() {
        return Err(Status::invalid_argument("payload must not be empty"));
    }
    if req.multicast_group_id > 3 {
        return Err(Status::invalid_argument("multicast_group_id must be 0..=3"));
    }
    if req.multicast_class_b_ping_slot_periodicity > 7 {
        return Err(Status::invalid_argument(
            "multicast_class_b_ping_slot_periodicity must be 0..=7",
        ));
    }
    if chirpstack_api::common::Region::from_str_name(&req.multicast_region.to_uppercase())
        .is_none()
    {
        return Err(Status::invalid_argument("unknown multicast_region"));
    }

    let mut devices = HashMap::new();
    for device in &req.devices {
        let dev_eui = Eui64::from_slice(&device.dev_eui)
            .map_err(|_| Status::invalid_argument("dev_eui must be 8 bytes"))?;
        let mc_root_key = Aes128Key::from_slice(&device.mc_root_key)
            .map_err(|_| Status::invalid_argument("mc_root_key must be 16 bytes"))?;
        devices.insert(dev_eui, DeviceOptions { mc_root_key });
    }

    let multicast_group_type = match proto::MulticastGroupType::try_from(
        req.multicast_group_type,
    ) {
        Ok(proto::MulticastGroupType::ClassB) => MulticastGroupType::ClassB,
        Ok(proto::MulticastGroupType::ClassC) => MulticastGroupType::ClassC,
        Err(_) => return Err(Status::invalid_argument("invalid multicast_group_type")),
    };

    let request_fragmentation_session_status =
        match proto::RequestFragmentationSessionStatus::try_from(
            req.request_fragmentation_session_status,
        ) {
            Ok(proto::RequestFragmentationSessionStatus::NoRequest) => {
                FragSessionStatusRequest::NoRequest
            }
            Ok(proto::RequestFragmentationSessionStatus::AfterFragmentEnqueue) => {
                FragSessionStatusRequest::AfterFragmentEnqueue
            }
            Ok(proto::RequestFragmentationSessionStatus::AfterSessionTimeout) => {
                FragSessionStatusRequest::AfterSessionTimeout
            }
            Err(_) => {
                return Err(Status::invalid_argument(
                    "invalid request_fragmentation_session_status",
                ))
            }
        };

    let unicast_timeout: std::time::Duration = req
        .unicast_timeout
        .ok_or_else(|| Status::invalid_argument("unicast_timeout is required"))?
        .try_into()
        .map_err(|_| Status::invalid_argument("unicast_timeout must be positive"))?;

    let mut descriptor = [0u8; 4];
    if !req.fragmentation_descriptor.is_empty() {
        if req.fragmentation_descriptor.len() != 4 {
            return Err(Status::invalid_argument(
                "fragmentation_descriptor must be 4 bytes",
            ));
        }
        descriptor.copy_from_slice(&req.fragmentation_descriptor);
    }

    Ok(DeploymentOptions {
        application_id: req.application_id,
        devices,
        multicast_group_type,
        multicast_dr: req.multicast_dr as u8,
        multicast_class_b_ping_slot_periodicity: req.multicast_class_b_ping_slot_periodicity
            as u8,
        multicast_frequency: req.multicast_frequency,
        multicast_group_id: req.multicast_group_id as u8,
        multicast_timeout: req.multicast_timeout as u8,
        multicast_region: req.multicast_region,
        unicast_timeout,
        unicast_attempt_count: req.unicast_attempt_count as usize,
        frag_size: req.fragmentation_fragment_size as usize,
        payload: req.payload,
        redundancy: req.fragmentation_redundancy as usize,
        fragmentation_session_index: req.fragmentation_session_index as u8,
        fragmentation_matrix: req.fragmentation_matrix as u8,
        block_ack_delay: req.fragmentation_block_ack_delay as u8,
        descriptor,
        request_fragmentation_session_status,
    })
}

#[tonic::async_trait]
impl DeploymentService for DeploymentServiceImpl {
    async fn create_deployment(
        &self,
        request: Request<proto::CreateDeploymentRequest>,
    ) -> Result<Response<proto::CreateDeploymentResponse>, Status> {
        let deployment = request
            .into_inner()
            .deployment
            .ok_or_else(|| Status::invalid_argument("deployment is required"))?;

        let opts = deployment_options(deployment)?;

        let depl = Deployment::new(opts, self.store.clone(), self.client.clone())
            .await
            .map_err(|e| Status::internal(format!("create deployment error: {}", e)))?;
        let id = depl.id();

        // Execution is asynchronous; the status is queryable immediately.
        let router = self.router.clone();
        tokio::spawn(async move {
            if let Err(e) = depl.run(router).await {
                error!(deployment_id = %id, error = %e, "api: fuota deployment error");
            }
        });

        Ok(Response::new(proto::CreateDeploymentResponse {
            id: id.as_bytes().to_vec(),
        }))
    }

    async fn get_deployment_status(
        &self,
        request: Request<proto::GetDeploymentStatusRequest>,
    ) -> Result<Response<proto::GetDeploymentStatusResponse>, Status> {
        let id = parse_uuid(&request.into_inner().id)?;

        let d = self
            .store
            .get_deployment(id)
            .await
            .map_err(storage_status)?;
        let devices = self
            .store
            .get_deployment_devices(id)
            .await
            .map_err(storage_status)?;

        let device_status = devices
            .into_iter()
            .map(|dd| proto::DeploymentDeviceStatus {
                dev_eui: dd.dev_eui,
                created_at: Some(timestamp(dd.created_at)),
                updated_at: Some(timestamp(dd.updated_at)),
                mc_group_setup_completed_at: dd.mc_group_setup_completed_at.map(timestamp),
                mc_session_completed_at: dd.mc_session_completed_at.map(timestamp),
                frag_session_setup_completed_at: dd
                    .frag_session_setup_completed_at
                    .map(timestamp),
                frag_status_completed_at: dd.frag_status_completed_at.map(timestamp),
            })
            .collect();

        Ok(Response::new(proto::GetDeploymentStatusResponse {
            created_at: Some(timestamp(d.created_at)),
            updated_at: Some(timestamp(d.updated_at)),
            mc_group_setup_completed_at: d.mc_group_setup_completed_at.map(timestamp),
            mc_session_completed_at: d.mc_session_completed_at.map(timestamp),
            frag_session_setup_completed_at: d.frag_session_setup_completed_at.map(timestamp),
            enqueue_completed_at: d.enqueue_completed_at.map(timestamp),
            frag_status_completed_at: d.frag_status_completed_at.map(timestamp),
            device_status,
        }))
    }

    async fn get_deployment_device_logs(
        &self,
        request: Request<proto::GetDeploymentDeviceLogsRequest>,
    ) -> Result<Response<proto::GetDeploymentDeviceLogsResponse>, Status> {
        let req = request.into_inner();
        let deployment_id = parse_uuid(&req.deployment_id)?;
        let dev_eui = Eui64::from_slice(&req.dev_eui)
            .map_err(|_| Status::invalid_argument("dev_eui must be 8 bytes"))?;

        let logs = self
            .store
            .get_deployment_logs(deployment_id, dev_eui)
            .await
            .map_err(storage_status)?;

        let logs = logs
            .into_iter()
            .map(|l| proto::DeploymentDeviceLog {
                created_at: Some(timestamp(l.created_at)),
                f_port: l.f_port as u32,
                command: l.command,
                fields: l
                    .fields
                    .as_object()
                    .map(|obj| {
                        obj.iter()
                            .map(|(k, v)| {
                                (k.clone(), v.as_str().unwrap_or_default().to_string())
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect();

        Ok(Response::new(proto::GetDeploymentDeviceLogsResponse {
            logs,
        }))
    }
}

/// Serves the deployment API, with mutual TLS when the CA/cert/key triple is
/// configured.
pub async fn serve(
    bind: SocketAddr,
    ca_cert: &str,
    tls_cert: &str,
    tls_key: &str,
    service: DeploymentServiceImpl,
) -> anyhow::Result<()> {
    let mut builder = Server::builder();

    if !ca_cert.is_empty() && !tls_cert.is_empty() && !tls_key.is_empty() {
        let cert = tokio::fs::read(tls_cert).await?;
        let key = tokio::fs::read(tls_key).await?;
        let ca = tokio::fs::read(ca_cert).await?;

        builder = builder.tls_config(
            ServerTlsConfig::new()
                .identity(Identity::from_pem(cert, key))
                .client_ca_root(Certificate::from_pem(ca)),
        )?;
        info!(%bind, "api: starting deployment api server with tls");
    } else {
        info!(%bind, "api: starting deployment api server");
    }

    builder
        .add_service(DeploymentServiceServer::new(service))
        .serve(bind)
        .await?;

    Ok(())
}

fn parse_uuid(b: &[u8]) -> Result<Uuid, Status> {
    Uuid::from_slice(b).map_err(|_| Status::invalid_argument("id must be 16 bytes"))
}

fn timestamp(t: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

fn storage_status(e: storage::StorageError) -> Status {
    match e {
        storage::StorageError::NotFound => Status::not_found("object does not exist"),
        e => Status::internal(format!("storage error: {}", e)),
    }
}
