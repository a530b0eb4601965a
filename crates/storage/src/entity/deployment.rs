//! deployment entity
//!
//! One row per FUOTA deployment. The five phase timestamps start out NULL
//! and are written once, when the orchestrator finishes the phase.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "deployment")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(column_type = "TimestampWithTimeZone")]
    pub created_at: DateTimeUtc,
    #[sea_orm(column_type = "TimestampWithTimeZone")]
    pub updated_at: DateTimeUtc,
    #[sea_orm(column_type = "TimestampWithTimeZone", nullable)]
    pub mc_group_setup_completed_at: Option<DateTimeUtc>,
    #[sea_orm(column_type = "TimestampWithTimeZone", nullable)]
    pub mc_session_completed_at: Option<DateTimeUtc>,
    #[sea_orm(column_type = "TimestampWithTimeZone", nullable)]
    pub frag_session_setup_completed_at: Option<DateTimeUtc>,
    #[sea_orm(column_type = "TimestampWithTimeZone", nullable)]
    pub enqueue_completed_at: Option<DateTimeUtc>,
    #[sea_orm(column_type = "TimestampWithTimeZone", nullable)]
    pub frag_status_completed_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::deployment_device::Entity")]
    DeploymentDevice,
    #[sea_orm(has_many = "super::deployment_log::Entity")]
    DeploymentLog,
}

impl Related<super::deployment_device::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeploymentDevice.def()
    }
}

impl Related<super::deployment_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeploymentLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
