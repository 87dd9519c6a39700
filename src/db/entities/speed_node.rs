//! Speed-node registration entity.
//!
//! One row per `(instance_id, online)` pair. Rows are never deleted;
//! liveness is derived from `updated_at`.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "speed_node")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub instance_id: String,
    pub host: String,
    pub port: i32,
    pub online: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
