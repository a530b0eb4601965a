//! Persistent FUOTA deployment records.
//!
//! Three tables: `deployment`, `deployment_device` and `deployment_log`.
//! The orchestrator and the API consume the [`DeploymentStore`] trait so
//! tests can run against an in-memory implementation; production uses
//! [`PgStore`] on PostgreSQL.

pub mod entity;

mod pg;

pub use pg::{PgConfig, PgStore};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use thiserror::Error;
use uuid::Uuid;

use applayer::Eui64;

use entity::{deployment, deployment_device, deployment_log};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object does not exist")]
    NotFound,

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

/// A deployment_log row to append; id and timestamp are assigned on write.
#[derive(Debug, Clone)]
pub struct NewDeploymentLog {
    pub deployment_id: Uuid,
    pub dev_eui: Eui64,
    pub f_port: u8,
    pub command: String,
    pub fields: BTreeMap<String, String>,
}

/// Durable record of deployments, their devices and their command log.
///
/// Update calls stamp `updated_at` and fail with [`StorageError::NotFound`]
/// when no row matches. `create_deployment_log` must be safe to call
/// concurrently from any task.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Creates the deployment row and one device row per DevEUI in a single
    /// transaction.
    async fn create_deployment(
        &self,
        id: Uuid,
        dev_euis: &[Eui64],
    ) -> Result<deployment::Model, StorageError>;

    async fn get_deployment(&self, id: Uuid) -> Result<deployment::Model, StorageError>;

    async fn update_deployment(
        &self,
        d: deployment::Model,
    ) -> Result<deployment::Model, StorageError>;

    async fn get_deployment_device(
        &self,
        deployment_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<deployment_device::Model, StorageError>;

    async fn update_deployment_device(
        &self,
        d: deployment_device::Model,
    ) -> Result<deployment_device::Model, StorageError>;

    async fn get_deployment_devices(
        &self,
        deployment_id: Uuid,
    ) -> Result<Vec<deployment_device::Model>, StorageError>;

    async fn create_deployment_log(&self, log: NewDeploymentLog) -> Result<(), StorageError>;

    /// Logs for one (deployment, device) pair, ordered by `created_at`
    /// ascending.
    async fn get_deployment_logs(
        &self,
        deployment_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<Vec<deployment_log::Model>, StorageError>;
}

/// Current UTC time rounded down to millisecond precision, the resolution
/// stored in the database.
pub fn now_ms() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now)
}
