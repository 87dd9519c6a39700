//! Scheduler decision engine.
//!
//! For each incoming file request, decides whether the requesting node should
//! pull from a peer that is further along ("master") or fall back to origin,
//! and keeps the requester's progress row in sync. All work for one
//! `(datatype, org, repo, etag)` key is serialized by a named lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use crate::db::entities::file_progress::{STATUS_COMPLETE, STATUS_DOWNLOADING};
use crate::db::entities::repository::{self, Entity as Repository};
use crate::error::{Result, ServerError};
use crate::locks::{scheduler_file_key, LockRegistry};
use crate::progress::{FileKey, ProgressStore};
use crate::registry::NodeRegistry;

pub const SCHEDULER_NO: i32 = 1;
pub const SCHEDULER_YES: i32 = 2;

#[derive(Debug, Clone, Default)]
pub struct SchedulerFileRequest {
    pub instance_id: String,
    pub datatype: String,
    pub org: String,
    pub repo: String,
    pub name: String,
    pub etag: String,
    pub file_size: i64,
    pub start_pos: i64,
    pub end_pos: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerFileResponse {
    pub scheduler_type: i32,
    pub process_id: i64,
    pub master_instance_id: String,
    pub host: String,
    pub port: i32,
    pub max_offset: i64,
}

impl SchedulerFileResponse {
    fn origin(process_id: i64) -> Self {
        Self {
            scheduler_type: SCHEDULER_NO,
            process_id,
            ..Default::default()
        }
    }
}

pub struct SchedulerService {
    db: DatabaseConnection,
    progress: Arc<ProgressStore>,
    registry: Arc<NodeRegistry>,
    locks: Arc<LockRegistry>,
    lock_ttl: Duration,
}

impl SchedulerService {
    pub fn new(
        db: DatabaseConnection,
        progress: Arc<ProgressStore>,
        registry: Arc<NodeRegistry>,
        locks: Arc<LockRegistry>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            db,
            progress,
            registry,
            locks,
            lock_ttl,
        }
    }

    pub async fn scheduler_file(
        &self,
        req: &SchedulerFileRequest,
    ) -> Result<SchedulerFileResponse> {
        if req.etag.is_empty() {
            return Err(ServerError::InvalidParam(
                "files without an etag are not scheduled".to_string(),
            ));
        }
        let lock = self.locks.get(
            &scheduler_file_key(&req.datatype, &req.org, &req.repo, &req.etag),
            self.lock_ttl,
        );
        let _guard = lock.write().await;

        let record = self
            .progress
            .get_record(
                &req.datatype,
                &req.org,
                &req.repo,
                Some(req.name.as_str()),
                &req.etag,
            )
            .await?;
        match record {
            None => {
                let (_, process_id) = self
                    .progress
                    .save_scheduler_record(
                        &file_key(req),
                        &req.instance_id,
                        0,
                        STATUS_DOWNLOADING,
                        "",
                    )
                    .await?;
                Ok(SchedulerFileResponse::origin(process_id))
            }
            Some(record) => {
                let rows = self.progress.get_progress_by_record(record.id).await?;
                if rows.is_empty() {
                    let process_id = self
                        .progress
                        .insert_progress(record.id, &req.instance_id, 0, STATUS_DOWNLOADING, "")
                        .await?;
                    Ok(SchedulerFileResponse::origin(process_id))
                } else {
                    self.schedule_among_peers(record.id, rows, req).await
                }
            }
        }
    }

    /// Pick the master peer (first fresh node ahead of the requester, rows
    /// already ordered by offset desc) and upsert the requester's row.
    async fn schedule_among_peers(
        &self,
        record_id: i64,
        rows: Vec<crate::db::entities::file_progress::Model>,
        req: &SchedulerFileRequest,
    ) -> Result<SchedulerFileResponse> {
        let mut resp = SchedulerFileResponse::default();
        let mut master: Option<(
            crate::db::entities::file_progress::Model,
            crate::db::entities::speed_node::Model,
        )> = None;
        let mut history: HashMap<String, crate::db::entities::file_progress::Model> =
            HashMap::new();

        for row in rows {
            if master.is_none()
                && row.instance_id != req.instance_id
                && row.offset_num > req.start_pos
            {
                // The endpoint must resolve to a currently-fresh node, or
                // the requester falls back to origin.
                if let Some(node) = self.registry.get_best(&row.instance_id).await? {
                    if self.registry.is_fresh(node.updated_at) {
                        master = Some((row.clone(), node));
                    }
                }
            }
            history.entry(row.instance_id.clone()).or_insert(row);
        }

        let master_instance_id = match &master {
            Some((row, node)) => {
                resp.scheduler_type = SCHEDULER_YES;
                resp.master_instance_id = row.instance_id.clone();
                resp.host = node.host.clone();
                resp.port = node.port;
                resp.max_offset = row.offset_num;
                row.instance_id.clone()
            }
            None => {
                resp.scheduler_type = SCHEDULER_NO;
                String::new()
            }
        };

        match history.get(&req.instance_id) {
            Some(existing) => {
                // Rescheduling an existing download. An offset ahead of the
                // reported start means the node's local cache was truncated;
                // rewind to what the node actually has.
                resp.process_id = existing.id;
                let new_offset = if existing.offset_num > req.start_pos {
                    req.start_pos
                } else {
                    existing.offset_num
                };
                self.progress
                    .reset_progress(existing.id, new_offset, &master_instance_id)
                    .await?;
            }
            None => {
                resp.process_id = self
                    .progress
                    .insert_progress(
                        record_id,
                        &req.instance_id,
                        0,
                        STATUS_DOWNLOADING,
                        &master_instance_id,
                    )
                    .await?;
            }
        }
        Ok(resp)
    }

    /// A node asserts the file is fully present locally, skipping the
    /// incremental report path.
    pub async fn sync_file_process(&self, req: &SchedulerFileRequest) -> Result<()> {
        let record = self
            .progress
            .get_record(&req.datatype, &req.org, &req.repo, None, &req.etag)
            .await?;
        match record {
            Some(record) => {
                let existing = self
                    .progress
                    .get_progress_by_instance(record.id, &req.instance_id)
                    .await?;
                if existing.is_none() {
                    self.progress
                        .insert_progress(
                            record.id,
                            &req.instance_id,
                            req.end_pos,
                            STATUS_COMPLETE,
                            "",
                        )
                        .await?;
                }
                Ok(())
            }
            None => {
                self.progress
                    .save_scheduler_record(
                        &file_key(req),
                        &req.instance_id,
                        req.end_pos,
                        STATUS_COMPLETE,
                        "",
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Cascade delete: the requester's progress rows for matching records,
    /// then the instance's catalog row for the repo.
    pub async fn delete_by_etags_and_fields(&self, req: &SchedulerFileRequest) -> Result<()> {
        let record_ids = self
            .progress
            .get_record_ids(&req.etag, &req.datatype, &req.org, &req.repo, &req.name)
            .await?;
        if !record_ids.is_empty() && !req.instance_id.is_empty() {
            self.progress
                .delete_progress_by_records_and_instance(&record_ids, &req.instance_id)
                .await?;
        }
        if !req.instance_id.is_empty()
            && !req.datatype.is_empty()
            && !req.org.is_empty()
            && !req.repo.is_empty()
        {
            Repository::delete_many()
                .filter(repository::Column::InstanceId.eq(req.instance_id.as_str()))
                .filter(repository::Column::Datatype.eq(req.datatype.as_str()))
                .filter(repository::Column::Org.eq(req.org.as_str()))
                .filter(repository::Column::Repo.eq(req.repo.as_str()))
                .exec(&self.db)
                .await?;
        }
        Ok(())
    }
}

fn file_key(req: &SchedulerFileRequest) -> FileKey {
    FileKey {
        datatype: req.datatype.clone(),
        org: req.org.clone(),
        repo: req.repo.clone(),
        name: req.name.clone(),
        etag: req.etag.clone(),
        file_size: req.file_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::db::entities::file_record::Entity as FileRecord;
    use crate::db::entities::file_progress::Entity as FileProgress;
    use crate::db::test_db;
    use chrono::Utc;
    use sea_orm::{ActiveModelTrait, Set};

    struct Fixture {
        svc: Arc<SchedulerService>,
        progress: Arc<ProgressStore>,
        registry: Arc<NodeRegistry>,
        db: DatabaseConnection,
    }

    async fn fixture() -> Fixture {
        let db = test_db().await;
        let progress = Arc::new(ProgressStore::new(db.clone()));
        let registry = Arc::new(NodeRegistry::new(
            db.clone(),
            Arc::new(TtlCache::new()),
            Duration::from_secs(300),
            chrono::Duration::minutes(5),
        ));
        let svc = Arc::new(SchedulerService::new(
            db.clone(),
            progress.clone(),
            registry.clone(),
            Arc::new(LockRegistry::new()),
            Duration::from_secs(1800),
        ));
        Fixture {
            svc,
            progress,
            registry,
            db,
        }
    }

    fn request(instance: &str, start_pos: i64) -> SchedulerFileRequest {
        SchedulerFileRequest {
            instance_id: instance.to_string(),
            datatype: "models".to_string(),
            org: "o".to_string(),
            repo: "r".to_string(),
            name: "a.bin".to_string(),
            etag: "E".to_string(),
            file_size: 100,
            start_pos,
            end_pos: 0,
        }
    }

    #[tokio::test]
    async fn test_first_download_no_peer() {
        let f = fixture().await;
        f.registry.register("A", "h1", 9000, true).await.unwrap();
        let resp = f.svc.scheduler_file(&request("A", 0)).await.unwrap();
        assert_eq!(resp.scheduler_type, SCHEDULER_NO);
        assert!(resp.process_id > 0);
        assert_eq!(FileRecord::find().all(&f.db).await.unwrap().len(), 1);
        assert_eq!(FileProgress::find().all(&f.db).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_handoff() {
        let f = fixture().await;
        f.registry.register("A", "h1", 9000, true).await.unwrap();
        let first = f.svc.scheduler_file(&request("A", 0)).await.unwrap();
        f.progress
            .report_file_process(first.process_id, 0, 60, STATUS_DOWNLOADING)
            .await
            .unwrap();
        f.registry.register("B", "h2", 9001, true).await.unwrap();

        let resp = f.svc.scheduler_file(&request("B", 0)).await.unwrap();
        assert_eq!(resp.scheduler_type, SCHEDULER_YES);
        assert_eq!(resp.master_instance_id, "A");
        assert_eq!(resp.host, "h1");
        assert_eq!(resp.port, 9000);
        assert_eq!(resp.max_offset, 60);
    }

    #[tokio::test]
    async fn test_stale_peer_ignored() {
        let f = fixture().await;
        f.registry.register("A", "h1", 9000, true).await.unwrap();
        let first = f.svc.scheduler_file(&request("A", 0)).await.unwrap();
        f.progress
            .report_file_process(first.process_id, 0, 60, STATUS_DOWNLOADING)
            .await
            .unwrap();
        // Push A's freshness 10 minutes into the past, beyond the gap.
        let node = f.registry.get_best("A").await.unwrap().unwrap();
        let mut active: crate::db::entities::speed_node::ActiveModel = node.into();
        active.updated_at = Set(Utc::now() - chrono::Duration::minutes(10));
        active.update(&f.db).await.unwrap();
        // A fresh registry (empty cache) sees the stale timestamp.
        let registry = Arc::new(NodeRegistry::new(
            f.db.clone(),
            Arc::new(TtlCache::new()),
            Duration::from_secs(300),
            chrono::Duration::minutes(5),
        ));
        let svc = SchedulerService::new(
            f.db.clone(),
            f.progress.clone(),
            registry,
            Arc::new(LockRegistry::new()),
            Duration::from_secs(1800),
        );
        f.registry.register("B", "h2", 9001, true).await.unwrap();
        let resp = svc.scheduler_file(&request("B", 0)).await.unwrap();
        assert_eq!(resp.scheduler_type, SCHEDULER_NO);
    }

    #[tokio::test]
    async fn test_requester_cannot_be_own_master() {
        let f = fixture().await;
        f.registry.register("A", "h1", 9000, true).await.unwrap();
        let first = f.svc.scheduler_file(&request("A", 0)).await.unwrap();
        f.progress
            .report_file_process(first.process_id, 0, 60, STATUS_DOWNLOADING)
            .await
            .unwrap();
        let resp = f.svc.scheduler_file(&request("A", 0)).await.unwrap();
        assert_eq!(resp.scheduler_type, SCHEDULER_NO);
        assert_eq!(resp.process_id, first.process_id);
    }

    #[tokio::test]
    async fn test_reschedule_rewinds_truncated_cache() {
        let f = fixture().await;
        f.registry.register("A", "h1", 9000, true).await.unwrap();
        let first = f.svc.scheduler_file(&request("A", 0)).await.unwrap();
        f.progress
            .report_file_process(first.process_id, 0, 80, STATUS_DOWNLOADING)
            .await
            .unwrap();
        // The node comes back reporting start_pos 20: its cache lost data.
        let resp = f.svc.scheduler_file(&request("A", 20)).await.unwrap();
        assert_eq!(resp.process_id, first.process_id);
        let row = f.progress.get_progress(first.process_id).await.unwrap().unwrap();
        assert_eq!(row.offset_num, 20);
    }

    #[tokio::test]
    async fn test_empty_etag_rejected() {
        let f = fixture().await;
        let mut req = request("A", 0);
        req.etag = String::new();
        assert!(f.svc.scheduler_file(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_requests_create_one_record() {
        let f = fixture().await;
        f.registry.register("A", "h1", 9000, true).await.unwrap();
        f.registry.register("B", "h2", 9001, true).await.unwrap();
        let req_a = request("A", 0);
        let req_b = request("B", 0);
        let (ra, rb) = tokio::join!(
            f.svc.scheduler_file(&req_a),
            f.svc.scheduler_file(&req_b)
        );
        ra.unwrap();
        rb.unwrap();
        assert_eq!(FileRecord::find().all(&f.db).await.unwrap().len(), 1);
        assert_eq!(FileProgress::find().all(&f.db).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_file_process_marks_complete() {
        let f = fixture().await;
        let mut req = request("A", 0);
        req.end_pos = 100;
        f.svc.sync_file_process(&req).await.unwrap();
        let record = f
            .progress
            .get_record("models", "o", "r", None, "E")
            .await
            .unwrap()
            .unwrap();
        let row = f
            .progress
            .get_progress_by_instance(record.id, "A")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.offset_num, 100);
        assert_eq!(row.status, STATUS_COMPLETE);
        // Re-sync is a no-op for an existing row.
        f.svc.sync_file_process(&req).await.unwrap();
        assert_eq!(FileProgress::find().all(&f.db).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_cascade() {
        let f = fixture().await;
        f.registry.register("A", "h1", 9000, true).await.unwrap();
        f.svc.scheduler_file(&request("A", 0)).await.unwrap();
        crate::db::entities::repository::ActiveModel {
            instance_id: Set("A".to_string()),
            datatype: Set("models".to_string()),
            org: Set("o".to_string()),
            repo: Set("r".to_string()),
            org_repo: Set("o/r".to_string()),
            error_msg: Set(String::new()),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&f.db)
        .await
        .unwrap();

        f.svc.delete_by_etags_and_fields(&request("A", 0)).await.unwrap();
        assert!(FileProgress::find().all(&f.db).await.unwrap().is_empty());
        assert!(Repository::find().all(&f.db).await.unwrap().is_empty());
        // The record itself stays; other instances may still reference it.
        assert_eq!(FileRecord::find().all(&f.db).await.unwrap().len(), 1);
    }
}
