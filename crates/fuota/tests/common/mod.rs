//! Test doubles: an in-memory deployment store and a scripted
//! network-server client.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chirpstack_api::integration;
use tokio::sync::mpsc;
use uuid::Uuid;

use applayer::Eui64;
use ns_client::{
    ClientError, DeviceQueueItem, MulticastGroupConfig, MulticastQueueItem, NetworkServerClient,
};
use storage::entity::{deployment, deployment_device, deployment_log};
use storage::{now_ms, DeploymentStore, NewDeploymentLog, StorageError};

/// In-memory [`DeploymentStore`].
#[derive(Default)]
pub struct MemStore {
    deployments: Mutex<HashMap<Uuid, deployment::Model>>,
    devices: Mutex<HashMap<(Uuid, Vec<u8>), deployment_device::Model>>,
    logs: Mutex<Vec<deployment_log::Model>>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DeploymentStore for MemStore {
    async fn create_deployment(
        &self,
        id: Uuid,
        dev_euis: &[Eui64],
    ) -> Result<deployment::Model, StorageError> {
        let now = now_ms();
        let model = deployment::Model {
            id,
            created_at: now,
            updated_at: now,
            mc_group_setup_completed_at: None,
            mc_session_completed_at: None,
            frag_session_setup_completed_at: None,
            enqueue_completed_at: None,
            frag_status_completed_at: None,
        };
        self.deployments.lock().unwrap().insert(id, model.clone());

        let mut devices = self.devices.lock().unwrap();
        for dev_eui in dev_euis {
            devices.insert(
                (id, dev_eui.to_vec()),
                deployment_device::Model {
                    deployment_id: id,
                    dev_eui: dev_eui.to_vec(),
                    created_at: now,
                    updated_at: now,
                    mc_group_setup_completed_at: None,
                    mc_session_completed_at: None,
                    frag_session_setup_completed_at: None,
                    frag_status_completed_at: None,
                },
            );
        }

        Ok(model)
    }

    async fn get_deployment(&self, id: Uuid) -> Result<deployment::Model, StorageError> {
        self.deployments
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn update_deployment(
        &self,
        mut d: deployment::Model,
    ) -> Result<deployment::Model, StorageError> {
        let mut deployments = self.deployments.lock().unwrap();
        if !deployments.contains_key(&d.id) {
            return Err(StorageError::NotFound);
        }
        d.updated_at = now_ms();
        deployments.insert(d.id, d.clone());
        Ok(d)
    }

    async fn get_deployment_device(
        &self,
        deployment_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<deployment_device::Model, StorageError> {
        self.devices
            .lock()
            .unwrap()
            .get(&(deployment_id, dev_eui.to_vec()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn update_deployment_device(
        &self,
        mut d: deployment_device::Model,
    ) -> Result<deployment_device::Model, StorageError> {
        let key = (d.deployment_id, d.dev_eui.clone());
        let mut devices = self.devices.lock().unwrap();
        if !devices.contains_key(&key) {
            return Err(StorageError::NotFound);
        }
        d.updated_at = now_ms();
        devices.insert(key, d.clone());
        Ok(d)
    }

    async fn get_deployment_devices(
        &self,
        deployment_id: Uuid,
    ) -> Result<Vec<deployment_device::Model>, StorageError> {
        let mut devices: Vec<_> = self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.deployment_id == deployment_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.dev_eui.cmp(&b.dev_eui));
        Ok(devices)
    }

    async fn create_deployment_log(&self, log: NewDeploymentLog) -> Result<(), StorageError> {
        let mut logs = self.logs.lock().unwrap();
        let id = logs.len() as i64 + 1;
        logs.push(deployment_log::Model {
            id,
            created_at: now_ms(),
            deployment_id: log.deployment_id,
            dev_eui: log.dev_eui.to_vec(),
            f_port: log.f_port as i16,
            command: log.command,
            fields: serde_json::to_value(&log.fields).unwrap(),
        });
        Ok(())
    }

    async fn get_deployment_logs(
        &self,
        deployment_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<Vec<deployment_log::Model>, StorageError> {
        let mut logs: Vec<_> = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.deployment_id == deployment_id && l.dev_eui == dev_eui.to_vec())
            .cloned()
            .collect();
        logs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(logs)
    }
}

#[derive(Debug, Clone)]
pub enum ClientCall {
    CreateMulticastGroup(MulticastGroupConfig),
    DeleteMulticastGroup(String),
    AddDevice { group_id: String, dev_eui: Eui64 },
    EnqueueMulticast(MulticastQueueItem),
    EnqueueDevice(DeviceQueueItem),
}

pub const MOCK_GROUP_ID: &str = "cc18b11e-3b3d-4b26-a1d7-6a3a6b6a3a6b";

/// Scripted [`NetworkServerClient`]: records every call and forwards it on a
/// channel so a test task can inject device answers.
pub struct MockClient {
    pub calls: Mutex<Vec<ClientCall>>,
    tx: mpsc::UnboundedSender<ClientCall>,
}

impl MockClient {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ClientCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                tx,
            }),
            rx,
        )
    }

    fn record(&self, call: ClientCall) {
        self.calls.lock().unwrap().push(call.clone());
        let _ = self.tx.send(call);
    }

    pub fn device_enqueues(&self) -> Vec<DeviceQueueItem> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ClientCall::EnqueueDevice(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn multicast_enqueues(&self) -> Vec<MulticastQueueItem> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                ClientCall::EnqueueMulticast(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn group_deleted(&self) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| matches!(c, ClientCall::DeleteMulticastGroup(_)))
    }
}

#[async_trait]
impl NetworkServerClient for MockClient {
    async fn create_multicast_group(
        &self,
        group: MulticastGroupConfig,
    ) -> Result<String, ClientError> {
        self.record(ClientCall::CreateMulticastGroup(group));
        Ok(MOCK_GROUP_ID.to_string())
    }

    async fn delete_multicast_group(&self, id: &str) -> Result<(), ClientError> {
        self.record(ClientCall::DeleteMulticastGroup(id.to_string()));
        Ok(())
    }

    async fn add_device_to_multicast_group(
        &self,
        id: &str,
        dev_eui: Eui64,
    ) -> Result<(), ClientError> {
        self.record(ClientCall::AddDevice {
            group_id: id.to_string(),
            dev_eui,
        });
        Ok(())
    }

    async fn enqueue_multicast(&self, item: MulticastQueueItem) -> Result<u32, ClientError> {
        let f_cnt = item.f_cnt;
        self.record(ClientCall::EnqueueMulticast(item));
        Ok(f_cnt)
    }

    async fn enqueue_device(&self, item: DeviceQueueItem) -> Result<(), ClientError> {
        self.record(ClientCall::EnqueueDevice(item));
        Ok(())
    }
}

/// Builds an uplink event the way the network server would post it.
pub fn uplink_event(dev_eui: Eui64, f_port: u8, data: Vec<u8>) -> integration::UplinkEvent {
    integration::UplinkEvent {
        device_info: Some(integration::DeviceInfo {
            dev_eui: dev_eui.to_string(),
            ..Default::default()
        }),
        f_port: f_port as u32,
        data,
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn log_fields(log: &deployment_log::Model) -> BTreeMap<String, String> {
    log.fields
        .as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default()
}
