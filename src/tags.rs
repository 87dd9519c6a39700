//! Tag reference lookups.

use std::collections::BTreeMap;

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::Serialize;

use crate::db::entities::tag::{self, Entity as Tag, TYPE_PIPELINE};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagView {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub tag_type: String,
    pub sub_type: String,
}

/// Pipeline tags grouped by sub-type for the catalog's main navigation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MainTagGroup {
    pub sub_type: String,
    pub tags: Vec<TagView>,
}

pub struct TagService {
    db: DatabaseConnection,
}

impl TagService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn list(&self, types: &[String], sub_types: &[String]) -> Result<Vec<TagView>> {
        let mut q = Tag::find();
        if !types.is_empty() {
            q = q.filter(tag::Column::TagType.is_in(types.iter().cloned()));
        }
        if !sub_types.is_empty() {
            q = q.filter(tag::Column::SubType.is_in(sub_types.iter().cloned()));
        }
        let rows = q.order_by_asc(tag::Column::Id).all(&self.db).await?;
        Ok(rows.into_iter().map(view_of).collect())
    }

    pub async fn task_tags(&self) -> Result<Vec<TagView>> {
        self.list(&[TYPE_PIPELINE.to_string()], &[]).await
    }

    pub async fn main_tags(&self) -> Result<Vec<MainTagGroup>> {
        let rows = self
            .list(&[TYPE_PIPELINE.to_string()], &[])
            .await?;
        let mut groups: BTreeMap<String, Vec<TagView>> = BTreeMap::new();
        for row in rows {
            groups.entry(row.sub_type.clone()).or_default().push(row);
        }
        Ok(groups
            .into_iter()
            .map(|(sub_type, tags)| MainTagGroup { sub_type, tags })
            .collect())
    }
}

fn view_of(m: tag::Model) -> TagView {
    TagView {
        id: m.id,
        label: m.label,
        tag_type: m.tag_type,
        sub_type: m.sub_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use sea_orm::{ActiveModelTrait, Set};

    async fn seed(db: &DatabaseConnection, id: &str, tag_type: &str, sub_type: &str) {
        tag::ActiveModel {
            id: Set(id.to_string()),
            label: Set(id.to_uppercase()),
            tag_type: Set(tag_type.to_string()),
            sub_type: Set(sub_type.to_string()),
        }
        .insert(db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_by_type_and_subtype() {
        let db = test_db().await;
        seed(&db, "text-generation", TYPE_PIPELINE, "nlp").await;
        seed(&db, "image-to-image", TYPE_PIPELINE, "cv").await;
        seed(&db, "pytorch", "library", "").await;

        let svc = TagService::new(db);
        assert_eq!(svc.list(&[], &[]).await.unwrap().len(), 3);
        assert_eq!(
            svc.list(&[TYPE_PIPELINE.to_string()], &[]).await.unwrap().len(),
            2
        );
        let nlp = svc
            .list(&[TYPE_PIPELINE.to_string()], &["nlp".to_string()])
            .await
            .unwrap();
        assert_eq!(nlp.len(), 1);
        assert_eq!(nlp[0].id, "text-generation");
    }

    #[tokio::test]
    async fn test_main_tags_grouped_by_subtype() {
        let db = test_db().await;
        seed(&db, "text-generation", TYPE_PIPELINE, "nlp").await;
        seed(&db, "translation", TYPE_PIPELINE, "nlp").await;
        seed(&db, "image-to-image", TYPE_PIPELINE, "cv").await;

        let svc = TagService::new(db);
        let groups = svc.main_tags().await.unwrap();
        assert_eq!(groups.len(), 2);
        let nlp = groups.iter().find(|g| g.sub_type == "nlp").unwrap();
        assert_eq!(nlp.tags.len(), 2);
    }
}
