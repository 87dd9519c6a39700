//! Preheat/mount cache jobs proxied to speed nodes.

use sea_orm::entity::prelude::*;

pub const TYPE_PREHEAT: i32 = 1;
pub const TYPE_MOUNT: i32 = 2;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "cache_job")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(column_name = "type")]
    pub job_type: i32,
    pub instance_id: String,
    pub datatype: String,
    pub org: String,
    pub repo: String,
    pub used_storage: i64,
    pub status: i32,
    /// JSON blob `{"msg": ...}`; empty when the job has no error.
    pub error_msg: String,
    /// Fractional completion in `0..=1`.
    pub process: f64,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
