//! Repo persister: promotes fully-downloaded repos into the catalog.
//!
//! A repo is "free" while it has progress on an instance but no catalog row.
//! Promotion fetches upstream metadata through the owning node, verifies
//! completeness against the sibling count (unless the caller switched
//! verification off), and writes the repository plus its tag joins in one
//! transaction. One bad repo never stalls the rest of the batch.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use tokio::sync::Mutex;

use crate::db::entities::repository;
use crate::db::entities::repository_tag;
use crate::db::entities::tag::{self, Entity as Tag, TYPE_PIPELINE};
use crate::error::{Result, ServerError};
use crate::organization::OrgLogoService;
use crate::progress::{FreeRepo, ProgressStore};
use crate::registry::NodeRegistry;
use crate::speed::{RepoMeta, SpeedClient};
use crate::tokens::TokenCache;

pub struct RepoPersister {
    db: DatabaseConnection,
    progress: Arc<ProgressStore>,
    registry: Arc<NodeRegistry>,
    client: Arc<SpeedClient>,
    tokens: Arc<TokenCache>,
    logo: Option<Arc<OrgLogoService>>,
    // One persistence sweep at a time, process-wide.
    persist_mu: Mutex<()>,
}

impl RepoPersister {
    pub fn new(
        db: DatabaseConnection,
        progress: Arc<ProgressStore>,
        registry: Arc<NodeRegistry>,
        client: Arc<SpeedClient>,
        tokens: Arc<TokenCache>,
        logo: Option<Arc<OrgLogoService>>,
    ) -> Self {
        Self {
            db,
            progress,
            registry,
            client,
            tokens,
            logo,
            persist_mu: Mutex::new(()),
        }
    }

    /// Promote every free repo of the given instances. Returns how many
    /// repositories were written.
    pub async fn persist_repo(
        &self,
        instance_ids: &[String],
        org: Option<&str>,
        repo: Option<&str>,
        off_verify: bool,
    ) -> Result<usize> {
        let _sweep = self.persist_mu.lock().await;
        let tag_labels = self.pipeline_tag_labels().await?;
        let mut persisted = 0;
        for instance_id in instance_ids {
            let free = self.progress.free_repositories(instance_id, org, repo).await?;
            if free.is_empty() {
                continue;
            }
            let node = match self.registry.get_online(instance_id).await {
                Ok(node) => node,
                Err(e) => {
                    tracing::error!(%instance_id, "persist skipped: {e}");
                    if instance_ids.len() == 1 {
                        return Err(e);
                    }
                    continue;
                }
            };
            let base = NodeRegistry::base_url(&node);
            for item in free {
                match self
                    .persist_one(instance_id, &base, &item, off_verify, &tag_labels)
                    .await
                {
                    Ok(true) => persisted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(
                            %instance_id,
                            datatype = %item.datatype,
                            org = %item.org,
                            repo = %item.repo,
                            "repo promotion failed: {e}"
                        );
                    }
                }
            }
        }
        Ok(persisted)
    }

    async fn persist_one(
        &self,
        instance_id: &str,
        base: &str,
        item: &FreeRepo,
        off_verify: bool,
        tag_labels: &HashMap<String, String>,
    ) -> Result<bool> {
        let org_repo = format!("{}/{}", item.org, item.repo);
        let token = self.tokens.current().await?;
        let resp = self
            .client
            .repo_meta(base, &item.datatype, &org_repo, None, token.as_deref())
            .await?;
        if resp.status != 200 && resp.status != 307 {
            return Err(ServerError::Upstream(format!(
                "meta fetch for {org_repo} returned {}",
                resp.status
            )));
        }
        let meta: RepoMeta = resp.json()?;

        if !off_verify {
            let completed = self
                .progress
                .completed_count(instance_id, &item.datatype, &item.org, &item.repo)
                .await?;
            if (completed as usize) < meta.siblings.len() {
                tracing::info!(
                    instance_id,
                    %org_repo,
                    completed,
                    siblings = meta.siblings.len(),
                    "repo not yet complete, skipping"
                );
                return Ok(false);
            }
        }

        if let Some(logo) = &self.logo {
            if let Err(e) = logo.persist_org_logo(&item.org).await {
                tracing::warn!(org = item.org, "org logo persist failed: {e}");
            }
        }

        self.save_repo_and_tags(instance_id, item, &org_repo, &meta, tag_labels)
            .await?;
        tracing::info!(instance_id, %org_repo, "repository persisted");
        Ok(true)
    }

    /// Repository + tag joins in a single transaction. The metadata fetch
    /// stays outside it.
    async fn save_repo_and_tags(
        &self,
        instance_id: &str,
        item: &FreeRepo,
        org_repo: &str,
        meta: &RepoMeta,
        tag_labels: &HashMap<String, String>,
    ) -> Result<()> {
        let now = Utc::now();
        let pipeline_label = tag_labels
            .get(&meta.pipeline_tag)
            .cloned()
            .unwrap_or_default();
        let txn = self.db.begin().await?;
        let inserted = repository::ActiveModel {
            instance_id: Set(instance_id.to_string()),
            datatype: Set(item.datatype.clone()),
            org: Set(item.org.clone()),
            repo: Set(item.repo.clone()),
            org_repo: Set(org_repo.to_string()),
            like_num: Set(meta.likes),
            download_num: Set(meta.downloads),
            pipeline_tag_id: Set(meta.pipeline_tag.clone()),
            pipeline_tag: Set(pipeline_label),
            last_modified: Set(meta.last_modified.clone()),
            used_storage: Set(meta.used_storage),
            sha: Set(meta.sha.clone()),
            status: Set(0),
            error_msg: Set(String::new()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        // Tag ids not present in the reference table are still joined;
        // reference integrity is eventual.
        for tag_id in &meta.tags {
            repository_tag::ActiveModel {
                repo_id: Set(inserted.id),
                tag_id: Set(tag_id.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn pipeline_tag_labels(&self) -> Result<HashMap<String, String>> {
        let tags = Tag::find()
            .filter(tag::Column::TagType.eq(TYPE_PIPELINE))
            .all(&self.db)
            .await?;
        Ok(tags.into_iter().map(|t| (t.id, t.label)).collect())
    }
}
