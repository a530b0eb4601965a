//! ChirpStack implementation of the network-server client.
//!
//! One shared gRPC channel; every RPC carries `authorization: Bearer <token>`
//! metadata, matching the ChirpStack external API contract.

use async_trait::async_trait;
use chirpstack_api::api;
use chirpstack_api::api::application_service_client::ApplicationServiceClient;
use chirpstack_api::api::device_service_client::DeviceServiceClient;
use chirpstack_api::api::multicast_group_service_client::MulticastGroupServiceClient;
use chirpstack_api::common;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Status};
use tracing::info;

use applayer::Eui64;

use crate::{
    class_b_ping_slot_period, ClientError, DeviceQueueItem, MulticastGroupConfig,
    MulticastGroupType, MulticastQueueItem, NetworkServerClient,
};

#[derive(Debug, Clone)]
pub struct ChirpStackConfig {
    /// host:port of the ChirpStack gRPC API.
    pub server: String,
    pub api_token: String,
    pub tls_enabled: bool,
}

#[derive(Clone)]
pub struct AuthInterceptor {
    token: MetadataValue<Ascii>,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert("authorization", self.token.clone());
        Ok(request)
    }
}

type Intercepted = InterceptedService<Channel, AuthInterceptor>;

/// Network-server client for the ChirpStack gRPC API.
pub struct ChirpStackClient {
    multicast_group: MulticastGroupServiceClient<Intercepted>,
    device: DeviceServiceClient<Intercepted>,
    application: ApplicationServiceClient<Intercepted>,
}

impl ChirpStackClient {
    /// Dials the ChirpStack API and verifies the transport is usable.
    pub async fn connect(cfg: &ChirpStackConfig) -> Result<Self, ClientError> {
        let scheme = if cfg.tls_enabled { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{}://{}", scheme, cfg.server))?;
        if cfg.tls_enabled {
            endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
        }

        let channel = endpoint.connect().await?;
        let token: MetadataValue<Ascii> = format!("Bearer {}", cfg.api_token)
            .parse()
            .map_err(|_| ClientError::InvalidToken)?;
        let interceptor = AuthInterceptor { token };

        info!(server = %cfg.server, tls = cfg.tls_enabled, "ns-client: connected to network server");

        Ok(Self {
            multicast_group: MulticastGroupServiceClient::with_interceptor(
                channel.clone(),
                interceptor.clone(),
            ),
            device: DeviceServiceClient::with_interceptor(channel.clone(), interceptor.clone()),
            application: ApplicationServiceClient::with_interceptor(channel, interceptor),
        })
    }

    /// The application service is not used by the orchestrator itself but is
    /// part of the consumed API surface for integrations.
    pub fn application(&self) -> ApplicationServiceClient<Intercepted> {
        self.application.clone()
    }
}

#[async_trait]
impl NetworkServerClient for ChirpStackClient {
    async fn create_multicast_group(
        &self,
        group: MulticastGroupConfig,
    ) -> Result<String, ClientError> {
        let region = common::Region::from_str_name(&group.region.to_uppercase())
            .ok_or_else(|| ClientError::UnknownRegion(group.region.clone()))?;

        let group_type = match group.group_type {
            MulticastGroupType::ClassB => api::MulticastGroupType::ClassB,
            MulticastGroupType::ClassC => api::MulticastGroupType::ClassC,
        };

        #[allow(deprecated)]
        let mg = api::MulticastGroup {
            name: group.name,
            application_id: group.application_id,
            region: region as i32,
            mc_addr: group.mc_addr,
            mc_nwk_s_key: group.mc_nwk_s_key,
            mc_app_s_key: group.mc_app_s_key,
            f_cnt: 0,
            group_type: group_type as i32,
            dr: group.dr as u32,
            frequency: group.frequency,
            class_b_ping_slot_period: class_b_ping_slot_period(
                group.class_b_ping_slot_periodicity,
            ),
            ..Default::default()
        };

        let resp = self
            .multicast_group
            .clone()
            .create(api::CreateMulticastGroupRequest {
                multicast_group: Some(mg),
            })
            .await?;

        Ok(resp.into_inner().id)
    }

    async fn delete_multicast_group(&self, id: &str) -> Result<(), ClientError> {
        self.multicast_group
            .clone()
            .delete(api::DeleteMulticastGroupRequest { id: id.to_string() })
            .await?;
        Ok(())
    }

    async fn add_device_to_multicast_group(
        &self,
        id: &str,
        dev_eui: Eui64,
    ) -> Result<(), ClientError> {
        self.multicast_group
            .clone()
            .add_device(api::AddDeviceToMulticastGroupRequest {
                multicast_group_id: id.to_string(),
                dev_eui: dev_eui.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn enqueue_multicast(&self, item: MulticastQueueItem) -> Result<u32, ClientError> {
        let resp = self
            .multicast_group
            .clone()
            .enqueue(api::EnqueueMulticastGroupQueueItemRequest {
                queue_item: Some(api::MulticastGroupQueueItem {
                    multicast_group_id: item.multicast_group_id,
                    f_cnt: item.f_cnt,
                    f_port: item.f_port as u32,
                    data: item.data,
                    ..Default::default()
                }),
            })
            .await?;
        Ok(resp.into_inner().f_cnt)
    }

    async fn enqueue_device(&self, item: DeviceQueueItem) -> Result<(), ClientError> {
        self.device
            .clone()
            .enqueue(api::EnqueueDeviceQueueItemRequest {
                queue_item: Some(api::DeviceQueueItem {
                    dev_eui: item.dev_eui.to_string(),
                    f_port: item.f_port as u32,
                    data: item.data,
                    ..Default::default()
                }),
            })
            .await?;
        Ok(())
    }
}
