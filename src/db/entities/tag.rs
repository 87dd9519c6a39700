//! Tag reference data. Ids are upstream tag identifiers (strings).

use sea_orm::entity::prelude::*;

pub const TYPE_PIPELINE: &str = "pipeline_tag";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tag")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub label: String,
    #[sea_orm(column_name = "type")]
    pub tag_type: String,
    pub sub_type: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
