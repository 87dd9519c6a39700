//! Catalog entry for a fully-mirrored repo on one instance.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "repository")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub instance_id: String,
    pub datatype: String,
    pub org: String,
    pub repo: String,
    pub org_repo: String,
    pub like_num: i32,
    pub download_num: i32,
    pub pipeline_tag_id: String,
    pub pipeline_tag: String,
    pub last_modified: String,
    pub used_storage: i64,
    pub sha: String,
    /// Mount state, same code space as cache-job statuses.
    pub status: i32,
    pub error_msg: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::repository_tag::Entity")]
    RepositoryTags,
}

impl Related<super::repository_tag::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RepositoryTags.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
