//! Repository catalog surface and mount orchestration.
//!
//! Reads serve the operator UI; the card and file-tree endpoints proxy the
//! owning speed node. Mount state rides on the repository row itself, using
//! the same status code space as cache jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait, FromQueryResult,
    Order, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Statement, Value,
};
use serde::Serialize;

use crate::cache::{card_key, TtlCache};
use crate::db::entities::cache_job::TYPE_MOUNT;
use crate::db::entities::organization::{self, Entity as Organization};
use crate::db::entities::repository::{self, Entity as Repository};
use crate::error::{Result, ServerError};
use crate::jobs::{JobStatus, NodeJobPayload};
use crate::registry::NodeRegistry;
use crate::speed::{RawResponse, SpeedClient};
use crate::tokens::TokenCache;

#[derive(Debug, Clone, Default)]
pub struct RepoListQuery {
    pub instance_id: String,
    pub name: String,
    pub page: u64,
    pub page_size: u64,
    pub sort: String,
    pub order: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryView {
    pub id: i64,
    pub org_repo: String,
    pub datatype: String,
    pub like_num: i32,
    pub download_num: i32,
    pub pipeline_tag_id: String,
    pub pipeline_tag: String,
    pub last_modified: String,
    pub used_storage: i64,
    pub sha: String,
    pub status: i32,
    pub icon: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

pub struct RepositoryService {
    db: DatabaseConnection,
    registry: Arc<NodeRegistry>,
    client: Arc<SpeedClient>,
    tokens: Arc<TokenCache>,
    cards: Arc<TtlCache<RawResponse>>,
    card_ttl: Duration,
    oss_path: String,
}

impl RepositoryService {
    pub fn new(
        db: DatabaseConnection,
        registry: Arc<NodeRegistry>,
        client: Arc<SpeedClient>,
        tokens: Arc<TokenCache>,
        cards: Arc<TtlCache<RawResponse>>,
        card_ttl: Duration,
        oss_path: String,
    ) -> Self {
        Self {
            db,
            registry,
            client,
            tokens,
            cards,
            card_ttl,
            oss_path,
        }
    }

    pub async fn list(&self, q: &RepoListQuery) -> Result<(Vec<RepositoryView>, u64)> {
        let page = q.page.max(1);
        let page_size = if (1..=100).contains(&q.page_size) {
            q.page_size
        } else {
            10
        };
        let sort_col = match q.sort.as_str() {
            "" | "last_modified" => repository::Column::LastModified,
            "like_num" => repository::Column::LikeNum,
            "download_num" => repository::Column::DownloadNum,
            "used_storage" => repository::Column::UsedStorage,
            other => {
                return Err(ServerError::InvalidParam(format!(
                    "unsupported sort column: {other}"
                )))
            }
        };
        let order = match q.order.to_lowercase().as_str() {
            "" | "desc" => Order::Desc,
            "asc" => Order::Asc,
            other => {
                return Err(ServerError::InvalidParam(format!(
                    "unsupported sort order: {other}"
                )))
            }
        };
        let mut cond = Condition::all();
        if !q.instance_id.is_empty() {
            cond = cond.add(repository::Column::InstanceId.eq(q.instance_id.as_str()));
        }
        if !q.name.is_empty() {
            cond = cond.add(repository::Column::OrgRepo.contains(q.name.as_str()));
        }
        let base = Repository::find().filter(cond);
        let total = base.clone().count(&self.db).await?;
        let rows = base
            .order_by(sort_col, order)
            .offset((page - 1) * page_size)
            .limit(page_size)
            .all(&self.db)
            .await?;
        let mut views = Vec::with_capacity(rows.len());
        for row in rows {
            let icon = self.icon_url(&row.org).await?;
            views.push(view_of(row, icon, vec![]));
        }
        Ok((views, total))
    }

    pub async fn get_by_id(&self, id: i64) -> Result<RepositoryView> {
        let row = self.get_repository(id).await?;
        let tags = self.tag_labels_for(id).await?;
        let icon = self.icon_url(&row.org).await?;
        Ok(view_of(row, icon, tags))
    }

    /// README proxied from the owning node, cached for the card TTL.
    pub async fn card(&self, instance_id: &str, id: i64) -> Result<RawResponse> {
        let key = card_key(instance_id, id);
        if let Some(cached) = self.cards.get(&key) {
            return Ok(cached);
        }
        let (base, row) = self.node_and_repo(instance_id, id).await?;
        let token = self.tokens.current().await?;
        let resp = self
            .client
            .repo_card(&base, &row.datatype, &row.org_repo, &row.sha, token.as_deref())
            .await?;
        self.cards.insert(key, resp.clone(), self.card_ttl);
        Ok(resp)
    }

    /// File tree proxied from the owning node, never cached.
    pub async fn files(&self, instance_id: &str, id: i64, file_path: &str) -> Result<RawResponse> {
        let (base, row) = self.node_and_repo(instance_id, id).await?;
        let token = self.tokens.current().await?;
        self.client
            .repo_files(
                &base,
                &row.datatype,
                &row.org_repo,
                &row.sha,
                file_path,
                token.as_deref(),
            )
            .await
    }

    /// Kick off a mount job on the owning node and mark the row running.
    pub async fn mount(&self, id: i64) -> Result<()> {
        let row = self.get_repository(id).await?;
        let node = self.registry.get_online(&row.instance_id).await?;
        let token = self.tokens.current().await?;
        let payload = NodeJobPayload {
            id: None,
            repository_id: Some(row.id),
            job_type: TYPE_MOUNT,
            instance_id: row.instance_id.clone(),
            datatype: row.datatype.clone(),
            org: row.org.clone(),
            repo: row.repo.clone(),
        };
        let resp = self
            .client
            .cache_job_create(&NodeRegistry::base_url(&node), &payload, token.as_deref())
            .await?;
        if resp.status != 200 {
            return Err(ServerError::Upstream(format!(
                "mount create returned {}",
                resp.status
            )));
        }
        self.write_mount_status(id, JobStatus::Running, "").await
    }

    /// Mount-state callback from the owning node.
    pub async fn update_mount_status(
        &self,
        id: i64,
        status: i32,
        error_msg: &str,
    ) -> Result<()> {
        let row = self.get_repository(id).await?;
        let from = JobStatus::from_code(row.status);
        let to = JobStatus::from_code(status);
        if !JobStatus::can_transition(from, to) {
            return Err(ServerError::PreconditionFailed(format!(
                "repository {id} cannot move from {from:?} to {to:?}"
            )));
        }
        self.write_mount_status(id, to, error_msg).await
    }

    /// Repositories whose mount is interrupted or queued, for the wait-task
    /// executor.
    pub async fn unmounted_repositories(
        &self,
        instance_id: &str,
        ids: &[i64],
        statuses: &[JobStatus],
        limit: u64,
    ) -> Result<Vec<repository::Model>> {
        let mut q = Repository::find();
        if !instance_id.is_empty() {
            q = q.filter(repository::Column::InstanceId.eq(instance_id));
        }
        if !ids.is_empty() {
            q = q.filter(repository::Column::Id.is_in(ids.iter().copied()));
        }
        q = q.filter(repository::Column::Status.is_in(statuses.iter().map(|s| s.code())));
        if limit > 0 {
            q = q.limit(limit);
        }
        Ok(q.all(&self.db).await?)
    }

    /// Startup repair: any mount left `Stopping` by a dead process goes to
    /// `Stop`.
    pub async fn repair_stopping(&self) -> Result<usize> {
        let stuck = Repository::find()
            .filter(repository::Column::Status.eq(JobStatus::Stopping.code()))
            .all(&self.db)
            .await?;
        let count = stuck.len();
        for row in stuck {
            self.write_mount_status(row.id, JobStatus::Stop, "").await?;
        }
        Ok(count)
    }

    async fn write_mount_status(&self, id: i64, status: JobStatus, error_msg: &str) -> Result<()> {
        let msg_json = if error_msg.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&serde_json::json!({ "msg": error_msg }))
                .map_err(|e| ServerError::Internal(e.to_string()))?
        };
        self.db
            .execute(Statement::from_sql_and_values(
                self.db.get_database_backend(),
                "UPDATE repository SET status = ?, error_msg = ?, updated_at = ? WHERE id = ?",
                [
                    status.code().into(),
                    msg_json.into(),
                    Value::from(Utc::now()),
                    id.into(),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn node_and_repo(
        &self,
        instance_id: &str,
        id: i64,
    ) -> Result<(String, repository::Model)> {
        let node = self.registry.get_online(instance_id).await?;
        let row = self.get_repository(id).await?;
        Ok((NodeRegistry::base_url(&node), row))
    }

    async fn get_repository(&self, id: i64) -> Result<repository::Model> {
        Repository::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("repository {id} does not exist")))
    }

    async fn tag_labels_for(&self, repo_id: i64) -> Result<Vec<String>> {
        #[derive(FromQueryResult)]
        struct LabelRow {
            label: String,
        }
        let rows = LabelRow::find_by_statement(Statement::from_sql_and_values(
            self.db.get_database_backend(),
            "SELECT t.label FROM tag t WHERE t.id IN \
             (SELECT x.tag_id FROM repository_tag x WHERE x.repo_id = ?)",
            [repo_id.into()],
        ))
        .all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|r| r.label).collect())
    }

    async fn icon_url(&self, org: &str) -> Result<String> {
        let icon = Organization::find()
            .filter(organization::Column::Name.eq(org))
            .one(&self.db)
            .await?
            .map(|o| o.icon)
            .unwrap_or_default();
        if icon.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("{}{}", self.oss_path, icon))
    }
}

fn view_of(row: repository::Model, icon: String, tags: Vec<String>) -> RepositoryView {
    RepositoryView {
        id: row.id,
        org_repo: row.org_repo,
        datatype: row.datatype,
        like_num: row.like_num,
        download_num: row.download_num,
        pipeline_tag_id: row.pipeline_tag_id,
        pipeline_tag: row.pipeline_tag,
        last_modified: row.last_modified,
        used_storage: row.used_storage,
        sha: row.sha,
        status: row.status,
        icon,
        tags,
    }
}
