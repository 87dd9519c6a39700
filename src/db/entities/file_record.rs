//! File identity entity, keyed by `(datatype, org, repo, name, etag)`.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "file_record")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub datatype: String,
    pub org: String,
    pub repo: String,
    /// Full path of the file within the repo.
    pub name: String,
    /// Content identity: the LFS oid when present, otherwise the git oid.
    pub etag: String,
    pub file_size: i64,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::file_progress::Entity")]
    FileProgress,
}

impl Related<super::file_progress::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::FileProgress.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
