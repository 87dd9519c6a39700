//! Per-`(record, instance)` download progress.

use sea_orm::entity::prelude::*;

/// Download status codes carried on the wire by speed nodes.
pub const STATUS_DOWNLOADING: i32 = 1;
pub const STATUS_BREAK: i32 = 2;
pub const STATUS_COMPLETE: i32 = 3;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "file_progress")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub record_id: i64,
    pub instance_id: String,
    pub offset_num: i64,
    pub status: i32,
    pub master_instance_id: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::file_record::Entity",
        from = "Column::RecordId",
        to = "super::file_record::Column::Id"
    )]
    FileRecord,
}

impl Related<super::file_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FileRecord.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
