//! PostgreSQL implementation of the deployment store.

use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    DbErr, EntityTrait, NotSet, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tracing::{info, warn};
use uuid::Uuid;

use applayer::Eui64;

use crate::entity::{deployment, deployment_device, deployment_log};
use crate::{now_ms, DeploymentStore, NewDeploymentLog, StorageError};

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Clone)]
pub struct PgConfig {
    pub dsn: String,
    pub automigrate: bool,
    pub max_open_connections: u32,
    pub max_idle_connections: u32,
}

/// Deployment store backed by a PostgreSQL connection pool.
pub struct PgStore {
    conn: DatabaseConnection,
}

impl PgStore {
    /// Connects to PostgreSQL, retrying until the server answers, and
    /// applies the schema when automigration is enabled.
    pub async fn connect(cfg: &PgConfig) -> Result<Self, StorageError> {
        info!("storage: connecting to PostgreSQL");

        let mut opt = ConnectOptions::new(cfg.dsn.clone());
        opt.max_connections(cfg.max_open_connections)
            .min_connections(cfg.max_idle_connections)
            .connect_timeout(Duration::from_secs(10))
            .sqlx_logging(false);

        let conn = loop {
            match Database::connect(opt.clone()).await {
                Ok(conn) => break conn,
                Err(e) => {
                    warn!(error = %e, "storage: PostgreSQL not ready, retrying in 2s");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        };

        let store = Self { conn };
        if cfg.automigrate {
            store.automigrate().await?;
        }

        Ok(store)
    }

    /// Applies the idempotent schema DDL.
    pub async fn automigrate(&self) -> Result<(), StorageError> {
        info!("storage: applying PostgreSQL schema");
        self.conn.execute_unprepared(SCHEMA).await?;
        Ok(())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }
}

#[async_trait]
impl DeploymentStore for PgStore {
    async fn create_deployment(
        &self,
        id: Uuid,
        dev_euis: &[Eui64],
    ) -> Result<deployment::Model, StorageError> {
        let now = now_ms();
        let dev_euis = dev_euis.to_vec();

        let model = self
            .conn
            .transaction::<_, deployment::Model, DbErr>(move |txn| {
                Box::pin(async move {
                    let d = deployment::ActiveModel {
                        id: Set(id),
                        created_at: Set(now),
                        updated_at: Set(now),
                        mc_group_setup_completed_at: Set(None),
                        mc_session_completed_at: Set(None),
                        frag_session_setup_completed_at: Set(None),
                        enqueue_completed_at: Set(None),
                        frag_status_completed_at: Set(None),
                    };
                    let model = d.insert(txn).await?;

                    for dev_eui in dev_euis {
                        let dd = deployment_device::ActiveModel {
                            deployment_id: Set(id),
                            dev_eui: Set(dev_eui.to_vec()),
                            created_at: Set(now),
                            updated_at: Set(now),
                            mc_group_setup_completed_at: Set(None),
                            mc_session_completed_at: Set(None),
                            frag_session_setup_completed_at: Set(None),
                            frag_status_completed_at: Set(None),
                        };
                        dd.insert(txn).await?;
                    }

                    Ok(model)
                })
            })
            .await
            .map_err(|e| match e {
                sea_orm::TransactionError::Connection(e) => StorageError::Db(e),
                sea_orm::TransactionError::Transaction(e) => StorageError::Db(e),
            })?;

        info!(deployment_id = %id, "storage: deployment created");
        Ok(model)
    }

    async fn get_deployment(&self, id: Uuid) -> Result<deployment::Model, StorageError> {
        deployment::Entity::find_by_id(id)
            .one(&self.conn)
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn update_deployment(
        &self,
        d: deployment::Model,
    ) -> Result<deployment::Model, StorageError> {
        let am = deployment::ActiveModel {
            id: Set(d.id),
            created_at: Set(d.created_at),
            updated_at: Set(now_ms()),
            mc_group_setup_completed_at: Set(d.mc_group_setup_completed_at),
            mc_session_completed_at: Set(d.mc_session_completed_at),
            frag_session_setup_completed_at: Set(d.frag_session_setup_completed_at),
            enqueue_completed_at: Set(d.enqueue_completed_at),
            frag_status_completed_at: Set(d.frag_status_completed_at),
        };

        let model = am.update(&self.conn).await.map_err(not_found_on_zero)?;
        info!(deployment_id = %model.id, "storage: deployment updated");
        Ok(model)
    }

    async fn get_deployment_device(
        &self,
        deployment_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<deployment_device::Model, StorageError> {
        deployment_device::Entity::find_by_id((deployment_id, dev_eui.to_vec()))
            .one(&self.conn)
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn update_deployment_device(
        &self,
        d: deployment_device::Model,
    ) -> Result<deployment_device::Model, StorageError> {
        let am = deployment_device::ActiveModel {
            deployment_id: Set(d.deployment_id),
            dev_eui: Set(d.dev_eui),
            created_at: Set(d.created_at),
            updated_at: Set(now_ms()),
            mc_group_setup_completed_at: Set(d.mc_group_setup_completed_at),
            mc_session_completed_at: Set(d.mc_session_completed_at),
            frag_session_setup_completed_at: Set(d.frag_session_setup_completed_at),
            frag_status_completed_at: Set(d.frag_status_completed_at),
        };

        let model = am.update(&self.conn).await.map_err(not_found_on_zero)?;
        Ok(model)
    }

    async fn get_deployment_devices(
        &self,
        deployment_id: Uuid,
    ) -> Result<Vec<deployment_device::Model>, StorageError> {
        Ok(deployment_device::Entity::find()
            .filter(deployment_device::Column::DeploymentId.eq(deployment_id))
            .order_by_asc(deployment_device::Column::DevEui)
            .all(&self.conn)
            .await?)
    }

    async fn create_deployment_log(&self, log: NewDeploymentLog) -> Result<(), StorageError> {
        let fields = serde_json::to_value(&log.fields)
            .unwrap_or(serde_json::Value::Object(Default::default()));

        let am = deployment_log::ActiveModel {
            id: NotSet,
            created_at: Set(now_ms()),
            deployment_id: Set(log.deployment_id),
            dev_eui: Set(log.dev_eui.to_vec()),
            f_port: Set(log.f_port as i16),
            command: Set(log.command.clone()),
            fields: Set(fields),
        };
        am.insert(&self.conn).await?;

        info!(
            deployment_id = %log.deployment_id,
            dev_eui = %log.dev_eui,
            command = %log.command,
            "storage: deployment log created"
        );
        Ok(())
    }

    async fn get_deployment_logs(
        &self,
        deployment_id: Uuid,
        dev_eui: Eui64,
    ) -> Result<Vec<deployment_log::Model>, StorageError> {
        Ok(deployment_log::Entity::find()
            .filter(deployment_log::Column::DeploymentId.eq(deployment_id))
            .filter(deployment_log::Column::DevEui.eq(dev_eui.to_vec()))
            .order_by_asc(deployment_log::Column::CreatedAt)
            .order_by_asc(deployment_log::Column::Id)
            .all(&self.conn)
            .await?)
    }
}

fn not_found_on_zero(e: DbErr) -> StorageError {
    match e {
        DbErr::RecordNotUpdated | DbErr::RecordNotFound(_) => StorageError::NotFound,
        e => StorageError::Db(e),
    }
}
