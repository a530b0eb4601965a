//! deployment_device entity
//!
//! Composite key (deployment_id, dev_eui). The device set of a deployment is
//! written once at creation and never changes afterwards.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "deployment_device")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub deployment_id: Uuid,
    #[sea_orm(primary_key, auto_increment = false)]
    pub dev_eui: Vec<u8>,
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
    pub frag_status_completed_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::deployment::Entity",
        from = "Column::DeploymentId",
        to = "super::deployment::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Deployment,
}

impl Related<super::deployment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Deployment.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
