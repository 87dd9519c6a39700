//! Cache-job manager: preheat and mount jobs proxied to speed nodes.
//!
//! The scheduler owns the job rows and their state machine; the owning node
//! does the actual work and reports back through the status callback. Every
//! operation on a job holds that job's named lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, Order,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, Statement, Value,
};
use serde::{Deserialize, Serialize};

use crate::db::entities::cache_job::{self, Entity as CacheJob, TYPE_PREHEAT};
use crate::error::{Result, ServerError};
use crate::locks::{cache_job_key, LockRegistry};
use crate::persister::RepoPersister;
use crate::registry::NodeRegistry;
use crate::speed::{RawResponse, RealtimeEntry, SpeedClient};
use crate::tokens::TokenCache;

/// Single source of truth for job status codes. Legacy numeric codes map
/// onto this enum on read; unknown codes read as `Default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JobStatus {
    Default = 0,
    Running = 1,
    Break = 2,
    Complete = 3,
    Stopping = 4,
    Stop = 5,
    Wait = 6,
}

impl JobStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => JobStatus::Running,
            2 => JobStatus::Break,
            3 => JobStatus::Complete,
            4 => JobStatus::Stopping,
            5 => JobStatus::Stop,
            6 => JobStatus::Wait,
            _ => JobStatus::Default,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// The legal edges of the job DAG. `Running → Running` carries progress
    /// updates.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (from, to),
            (Default, Running)
                | (Running, Running)
                | (Running, Break)
                | (Running, Complete)
                | (Running, Stopping)
                | (Break, Running)
                | (Wait, Running)
                | (Stopping, Stop)
        )
    }

    /// Statuses that block a second job on the same key.
    pub fn is_non_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Default | JobStatus::Running | JobStatus::Break | JobStatus::Stopping
                | JobStatus::Wait
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCacheJobRequest {
    #[serde(rename = "type", default)]
    pub job_type: i32,
    #[serde(default)]
    pub instance_id: String,
    pub datatype: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub org_repo: String,
}

/// Body posted to the owning node for create/stop/resume.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeJobPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<i64>,
    #[serde(rename = "type")]
    pub job_type: i32,
    pub instance_id: String,
    pub datatype: String,
    pub org: String,
    pub repo: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobStatusRequest {
    pub id: i64,
    pub status: i32,
    #[serde(default)]
    pub error_msg: String,
    #[serde(default)]
    pub process: f64,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub repo: String,
}

/// Job row plus realtime figures for the list surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheJobView {
    pub id: i64,
    #[serde(rename = "type")]
    pub job_type: i32,
    pub instance_id: String,
    pub datatype: String,
    pub org: String,
    pub repo: String,
    pub used_storage: i64,
    pub status: i32,
    pub error_msg: String,
    pub process: f64,
    pub stock_speed: String,
    pub stock_process: f64,
    pub created_at: i64,
}

pub struct CacheJobService {
    db: DatabaseConnection,
    registry: Arc<NodeRegistry>,
    client: Arc<SpeedClient>,
    tokens: Arc<TokenCache>,
    locks: Arc<LockRegistry>,
    persister: Arc<RepoPersister>,
    lock_ttl: Duration,
}

impl CacheJobService {
    pub fn new(
        db: DatabaseConnection,
        registry: Arc<NodeRegistry>,
        client: Arc<SpeedClient>,
        tokens: Arc<TokenCache>,
        locks: Arc<LockRegistry>,
        persister: Arc<RepoPersister>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            db,
            registry,
            client,
            tokens,
            locks,
            persister,
            lock_ttl,
        }
    }

    /// Create a job and proxy it to the owning node. The node's response
    /// body is returned to the caller verbatim.
    pub async fn create(&self, req: &CreateCacheJobRequest) -> Result<RawResponse> {
        let lock = self.locks.get(
            &format!("cacheJob/{}/{}", req.instance_id, req.org_repo),
            self.lock_ttl,
        );
        let _guard = lock.write().await;

        let existing = CacheJob::find()
            .filter(cache_job::Column::JobType.eq(req.job_type))
            .filter(cache_job::Column::InstanceId.eq(req.instance_id.as_str()))
            .filter(cache_job::Column::Datatype.eq(req.datatype.as_str()))
            .filter(cache_job::Column::Org.eq(req.org.as_str()))
            .filter(cache_job::Column::Repo.eq(req.repo.as_str()))
            .all(&self.db)
            .await?;
        if existing
            .iter()
            .any(|j| JobStatus::from_code(j.status).is_non_terminal())
        {
            return Err(ServerError::Conflict(
                "a job for this repo already exists".to_string(),
            ));
        }

        let node = self.registry.get_online(&req.instance_id).await?;
        let token = self.tokens.current().await?;
        let payload = NodeJobPayload {
            id: None,
            repository_id: None,
            job_type: req.job_type,
            instance_id: req.instance_id.clone(),
            datatype: req.datatype.clone(),
            org: req.org.clone(),
            repo: req.repo.clone(),
        };
        let resp = self
            .client
            .cache_job_create(&NodeRegistry::base_url(&node), &payload, token.as_deref())
            .await?;
        if resp.status == 200 {
            let now = Utc::now();
            cache_job::ActiveModel {
                job_type: Set(req.job_type),
                instance_id: Set(req.instance_id.clone()),
                datatype: Set(req.datatype.clone()),
                org: Set(req.org.clone()),
                repo: Set(req.repo.clone()),
                status: Set(JobStatus::Running.code()),
                error_msg: Set(String::new()),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(&self.db)
            .await
            .map(|_| ())
            .map_err(ServerError::from)?;
        }
        Ok(resp)
    }

    /// Request a stop. The job goes to `Stopping` locally; the node reports
    /// the final `Stop` through its progress channel.
    pub async fn stop(&self, id: i64, instance_id: &str) -> Result<()> {
        let lock = self.locks.get(&cache_job_key(id), self.lock_ttl);
        let _guard = lock.write().await;

        let job = self.get_job(id).await?;
        if JobStatus::from_code(job.status) != JobStatus::Running {
            return Err(ServerError::PreconditionFailed(format!(
                "job {id} is not running and cannot be stopped"
            )));
        }
        let node = self.registry.get_online(instance_id).await?;
        let token = self.tokens.current().await?;
        let payload = NodeJobPayload {
            id: Some(id),
            repository_id: None,
            job_type: job.job_type,
            instance_id: job.instance_id.clone(),
            datatype: job.datatype.clone(),
            org: job.org.clone(),
            repo: job.repo.clone(),
        };
        self.client
            .cache_job_stop(&NodeRegistry::base_url(&node), &payload, token.as_deref())
            .await?;
        self.write_status(id, JobStatus::Stopping, "", None).await
    }

    pub async fn resume(&self, id: i64, instance_id: &str) -> Result<()> {
        let lock = self.locks.get(&cache_job_key(id), self.lock_ttl);
        let _guard = lock.write().await;

        let job = self.get_job(id).await?;
        if JobStatus::from_code(job.status) != JobStatus::Break
            && JobStatus::from_code(job.status) != JobStatus::Wait
        {
            return Err(ServerError::PreconditionFailed(format!(
                "job {id} is not interrupted and cannot be resumed"
            )));
        }
        let node = self.registry.get_online(instance_id).await?;
        let token = self.tokens.current().await?;
        let payload = NodeJobPayload {
            id: Some(id),
            repository_id: None,
            job_type: job.job_type,
            instance_id: job.instance_id.clone(),
            datatype: job.datatype.clone(),
            org: job.org.clone(),
            repo: job.repo.clone(),
        };
        self.client
            .cache_job_resume(&NodeRegistry::base_url(&node), &payload, token.as_deref())
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let lock = self.locks.get(&cache_job_key(id), self.lock_ttl);
        let _guard = lock.write().await;

        let job = self.get_job(id).await?;
        let status = JobStatus::from_code(job.status);
        if status == JobStatus::Running || status == JobStatus::Complete {
            return Err(ServerError::PreconditionFailed(format!(
                "job {id} cannot be deleted in its current state"
            )));
        }
        CacheJob::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    /// Status callback from the owning node. A completed job triggers repo
    /// promotion for its instance with verification off (the node asserts
    /// completeness).
    pub async fn update_cache_status(&self, req: &UpdateJobStatusRequest) -> Result<()> {
        let lock = self.locks.get(&cache_job_key(req.id), self.lock_ttl);
        let _guard = lock.write().await;

        let job = self.get_job(req.id).await?;
        let from = JobStatus::from_code(job.status);
        let to = JobStatus::from_code(req.status);
        if !JobStatus::can_transition(from, to) {
            return Err(ServerError::PreconditionFailed(format!(
                "job {} cannot move from {:?} to {:?}",
                req.id, from, to
            )));
        }
        let process = if req.process > 0.0 {
            Some(req.process)
        } else {
            None
        };
        self.write_status(req.id, to, &req.error_msg, process).await?;

        if to == JobStatus::Complete {
            self.persister
                .persist_repo(
                    &[job.instance_id.clone()],
                    Some(job.org.as_str()),
                    Some(job.repo.as_str()),
                    true,
                )
                .await?;
        }
        Ok(())
    }

    /// Realtime throughput/progress per job; jobs that are not running get
    /// their persisted progress and a placeholder speed.
    pub async fn realtime_status(
        &self,
        job_ids: &[i64],
        instance_id: &str,
    ) -> Result<HashMap<i64, RealtimeEntry>> {
        let jobs = CacheJob::find()
            .filter(cache_job::Column::Id.is_in(job_ids.iter().copied()))
            .all(&self.db)
            .await?;
        self.merge_realtime(instance_id, &jobs).await
    }

    pub async fn list(
        &self,
        instance_id: &str,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<CacheJobView>, u64)> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let mut q = CacheJob::find().filter(cache_job::Column::JobType.eq(TYPE_PREHEAT));
        if !instance_id.is_empty() {
            q = q.filter(cache_job::Column::InstanceId.eq(instance_id));
        }
        let total = q.clone().count(&self.db).await?;
        let jobs = q
            .order_by(cache_job::Column::CreatedAt, Order::Desc)
            .offset((page - 1) * page_size)
            .limit(page_size)
            .all(&self.db)
            .await?;
        let realtime = self.merge_realtime(instance_id, &jobs).await?;
        let views = jobs
            .into_iter()
            .map(|job| {
                let rt = realtime.get(&job.id);
                CacheJobView {
                    id: job.id,
                    job_type: job.job_type,
                    instance_id: job.instance_id,
                    datatype: job.datatype,
                    org: job.org,
                    repo: job.repo,
                    used_storage: job.used_storage,
                    status: job.status,
                    error_msg: job.error_msg,
                    process: job.process,
                    stock_speed: rt.map(|r| r.stock_speed.clone()).unwrap_or_default(),
                    stock_process: rt.map(|r| r.stock_process).unwrap_or(0.0),
                    created_at: job.created_at.timestamp(),
                }
            })
            .collect();
        Ok((views, total))
    }

    async fn merge_realtime(
        &self,
        instance_id: &str,
        jobs: &[cache_job::Model],
    ) -> Result<HashMap<i64, RealtimeEntry>> {
        let mut out = HashMap::new();
        let running: Vec<i64> = jobs
            .iter()
            .filter(|j| JobStatus::from_code(j.status) == JobStatus::Running)
            .map(|j| j.id)
            .collect();
        if !running.is_empty() && !instance_id.is_empty() {
            match self.registry.get_online(instance_id).await {
                Ok(node) => {
                    let token = self.tokens.current().await?;
                    match self
                        .client
                        .cache_job_realtime(
                            &NodeRegistry::base_url(&node),
                            &running,
                            token.as_deref(),
                        )
                        .await
                    {
                        Ok(map) => out.extend(map),
                        Err(e) => {
                            tracing::warn!(instance_id, "realtime query failed: {e}")
                        }
                    }
                }
                Err(e) => tracing::warn!(instance_id, "realtime skipped: {e}"),
            }
        }
        for job in jobs {
            out.entry(job.id).or_insert_with(|| RealtimeEntry {
                stock_speed: "-".to_string(),
                stock_process: job.process,
            });
        }
        Ok(out)
    }

    /// Jobs eligible for the wait-task executor.
    pub async fn waiting_jobs(
        &self,
        instance_id: &str,
        ids: &[i64],
        statuses: &[JobStatus],
        limit: u64,
    ) -> Result<Vec<cache_job::Model>> {
        let mut q = CacheJob::find();
        if !instance_id.is_empty() {
            q = q.filter(cache_job::Column::InstanceId.eq(instance_id));
        }
        if !ids.is_empty() {
            q = q.filter(cache_job::Column::Id.is_in(ids.iter().copied()));
        }
        q = q.filter(
            cache_job::Column::Status.is_in(statuses.iter().map(|s| s.code())),
        );
        if limit > 0 {
            q = q.limit(limit);
        }
        Ok(q.all(&self.db).await?)
    }

    /// Force every job stuck in `Stopping` to `Stop`; startup repair.
    pub async fn repair_stopping(&self) -> Result<usize> {
        let stuck = CacheJob::find()
            .filter(cache_job::Column::Status.eq(JobStatus::Stopping.code()))
            .all(&self.db)
            .await?;
        let count = stuck.len();
        for job in stuck {
            self.write_status(job.id, JobStatus::Stop, "", None).await?;
        }
        Ok(count)
    }

    async fn get_job(&self, id: i64) -> Result<cache_job::Model> {
        CacheJob::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("job {id} does not exist")))
    }

    /// Single write path for status changes; the error message goes in as a
    /// JSON blob through a bind parameter.
    async fn write_status(
        &self,
        id: i64,
        status: JobStatus,
        error_msg: &str,
        process: Option<f64>,
    ) -> Result<()> {
        let msg_json = if error_msg.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&serde_json::json!({ "msg": error_msg }))
                .map_err(|e| ServerError::Internal(e.to_string()))?
        };
        let backend = self.db.get_database_backend();
        let stmt = match process {
            Some(p) => Statement::from_sql_and_values(
                backend,
                "UPDATE cache_job SET status = ?, error_msg = ?, updated_at = ?, process = ? \
                 WHERE id = ?",
                [
                    status.code().into(),
                    msg_json.into(),
                    Value::from(Utc::now()),
                    p.into(),
                    id.into(),
                ],
            ),
            None => Statement::from_sql_and_values(
                backend,
                "UPDATE cache_job SET status = ?, error_msg = ?, updated_at = ? WHERE id = ?",
                [
                    status.code().into(),
                    msg_json.into(),
                    Value::from(Utc::now()),
                    id.into(),
                ],
            ),
        };
        self.db.execute(stmt).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::config::RetryConfig;
    use crate::db::test_db;
    use axum::{routing::post, Json, Router};
    use std::net::SocketAddr;

    /// Minimal stand-in for a speed node's cacheJob endpoints.
    async fn spawn_fake_node() -> SocketAddr {
        let app = Router::new()
            .route("/api/cacheJob/create", post(|| async { Json(serde_json::json!({"ok": true})) }))
            .route("/api/cacheJob/stop", post(|| async { Json(serde_json::json!({"ok": true})) }))
            .route("/api/cacheJob/resume", post(|| async { Json(serde_json::json!({"ok": true})) }))
            .route(
                "/api/cacheJob/realtime",
                post(|Json(body): Json<serde_json::Value>| async move {
                    let mut out = serde_json::Map::new();
                    for id in body["jobIds"].as_array().cloned().unwrap_or_default() {
                        out.insert(
                            id.to_string(),
                            serde_json::json!({"stockSpeed": "12MB/s", "stockProcess": 0.5}),
                        );
                    }
                    Json(serde_json::Value::Object(out))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    struct Fixture {
        svc: CacheJobService,
        registry: Arc<NodeRegistry>,
        db: DatabaseConnection,
    }

    async fn fixture() -> Fixture {
        let db = test_db().await;
        let registry = Arc::new(NodeRegistry::new(
            db.clone(),
            Arc::new(TtlCache::new()),
            Duration::from_secs(300),
            chrono::Duration::minutes(5),
        ));
        let client = Arc::new(SpeedClient::new(RetryConfig {
            delay_secs: 0,
            attempts: 1,
        }));
        let tokens = Arc::new(TokenCache::new(db.clone(), String::new()));
        let persister = Arc::new(RepoPersister::new(
            db.clone(),
            Arc::new(crate::progress::ProgressStore::new(db.clone())),
            registry.clone(),
            client.clone(),
            tokens.clone(),
            None,
        ));
        let svc = CacheJobService::new(
            db.clone(),
            registry.clone(),
            client,
            tokens,
            Arc::new(LockRegistry::new()),
            persister,
            Duration::from_secs(60),
        );
        Fixture { svc, registry, db }
    }

    fn create_req() -> CreateCacheJobRequest {
        CreateCacheJobRequest {
            job_type: TYPE_PREHEAT,
            instance_id: "node-a".to_string(),
            datatype: "models".to_string(),
            org: "o".to_string(),
            repo: "r".to_string(),
            org_repo: "o/r".to_string(),
        }
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for code in 0..=6 {
            assert_eq!(JobStatus::from_code(code).code(), code);
        }
        // Unknown legacy codes read as Default.
        assert_eq!(JobStatus::from_code(42), JobStatus::Default);
    }

    #[test]
    fn test_transition_dag() {
        use JobStatus::*;
        assert!(JobStatus::can_transition(Default, Running));
        assert!(JobStatus::can_transition(Running, Break));
        assert!(JobStatus::can_transition(Running, Stopping));
        assert!(JobStatus::can_transition(Break, Running));
        assert!(JobStatus::can_transition(Stopping, Stop));
        assert!(!JobStatus::can_transition(Stopping, Complete));
        assert!(!JobStatus::can_transition(Complete, Running));
        assert!(!JobStatus::can_transition(Stop, Running));
        assert!(!JobStatus::can_transition(Default, Complete));
    }

    #[tokio::test]
    async fn test_create_then_duplicate_conflicts() {
        let f = fixture().await;
        let addr = spawn_fake_node().await;
        f.registry
            .register("node-a", "127.0.0.1", addr.port() as i32, true)
            .await
            .unwrap();
        let resp = f.svc.create(&create_req()).await.unwrap();
        assert_eq!(resp.status, 200);
        let jobs = CacheJob::find().all(&f.db).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(JobStatus::from_code(jobs[0].status), JobStatus::Running);

        match f.svc.create(&create_req()).await {
            Err(ServerError::Conflict(_)) => {}
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_requires_registered_node() {
        let f = fixture().await;
        assert!(matches!(
            f.svc.create(&create_req()).await,
            Err(ServerError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_requires_running_and_sets_stopping() {
        let f = fixture().await;
        let addr = spawn_fake_node().await;
        f.registry
            .register("node-a", "127.0.0.1", addr.port() as i32, true)
            .await
            .unwrap();
        f.svc.create(&create_req()).await.unwrap();
        let job = CacheJob::find().one(&f.db).await.unwrap().unwrap();

        f.svc.stop(job.id, "node-a").await.unwrap();
        let job = CacheJob::find_by_id(job.id).one(&f.db).await.unwrap().unwrap();
        assert_eq!(JobStatus::from_code(job.status), JobStatus::Stopping);

        // A second stop is a precondition failure.
        assert!(matches!(
            f.svc.stop(job.id, "node-a").await,
            Err(ServerError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_forbidden_while_running_or_complete() {
        let f = fixture().await;
        let addr = spawn_fake_node().await;
        f.registry
            .register("node-a", "127.0.0.1", addr.port() as i32, true)
            .await
            .unwrap();
        f.svc.create(&create_req()).await.unwrap();
        let job = CacheJob::find().one(&f.db).await.unwrap().unwrap();
        assert!(f.svc.delete(job.id).await.is_err());

        // Break it, then deletion is allowed.
        f.svc
            .update_cache_status(&UpdateJobStatusRequest {
                id: job.id,
                status: JobStatus::Break.code(),
                error_msg: "disk full".to_string(),
                process: 0.3,
                instance_id: String::new(),
                org: String::new(),
                repo: String::new(),
            })
            .await
            .unwrap();
        f.svc.delete(job.id).await.unwrap();
        assert!(CacheJob::find().one(&f.db).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_msg_stored_as_json() {
        let f = fixture().await;
        let addr = spawn_fake_node().await;
        f.registry
            .register("node-a", "127.0.0.1", addr.port() as i32, true)
            .await
            .unwrap();
        f.svc.create(&create_req()).await.unwrap();
        let job = CacheJob::find().one(&f.db).await.unwrap().unwrap();
        f.svc
            .update_cache_status(&UpdateJobStatusRequest {
                id: job.id,
                status: JobStatus::Break.code(),
                error_msg: "it's broken".to_string(),
                process: 0.0,
                instance_id: String::new(),
                org: String::new(),
                repo: String::new(),
            })
            .await
            .unwrap();
        let job = CacheJob::find_by_id(job.id).one(&f.db).await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&job.error_msg).unwrap();
        assert_eq!(parsed["msg"], "it's broken");
    }

    #[tokio::test]
    async fn test_illegal_callback_rejected_while_stopping() {
        let f = fixture().await;
        let addr = spawn_fake_node().await;
        f.registry
            .register("node-a", "127.0.0.1", addr.port() as i32, true)
            .await
            .unwrap();
        f.svc.create(&create_req()).await.unwrap();
        let job = CacheJob::find().one(&f.db).await.unwrap().unwrap();
        f.svc.stop(job.id, "node-a").await.unwrap();

        // Completion arriving while Stopping violates the DAG; the row stays
        // Stopping until startup repair moves it to Stop.
        let res = f
            .svc
            .update_cache_status(&UpdateJobStatusRequest {
                id: job.id,
                status: JobStatus::Complete.code(),
                error_msg: String::new(),
                process: 1.0,
                instance_id: String::new(),
                org: String::new(),
                repo: String::new(),
            })
            .await;
        assert!(matches!(res, Err(ServerError::PreconditionFailed(_))));

        let repaired = f.svc.repair_stopping().await.unwrap();
        assert_eq!(repaired, 1);
        let job = CacheJob::find_by_id(job.id).one(&f.db).await.unwrap().unwrap();
        assert_eq!(JobStatus::from_code(job.status), JobStatus::Stop);
    }

    #[tokio::test]
    async fn test_list_merges_realtime_for_running() {
        let f = fixture().await;
        let addr = spawn_fake_node().await;
        f.registry
            .register("node-a", "127.0.0.1", addr.port() as i32, true)
            .await
            .unwrap();
        f.svc.create(&create_req()).await.unwrap();
        let (views, total) = f.svc.list("node-a", 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(views[0].stock_speed, "12MB/s");
        assert_eq!(views[0].stock_process, 0.5);
    }

    #[tokio::test]
    async fn test_realtime_placeholder_for_non_running() {
        let f = fixture().await;
        let addr = spawn_fake_node().await;
        f.registry
            .register("node-a", "127.0.0.1", addr.port() as i32, true)
            .await
            .unwrap();
        f.svc.create(&create_req()).await.unwrap();
        let job = CacheJob::find().one(&f.db).await.unwrap().unwrap();
        f.svc
            .update_cache_status(&UpdateJobStatusRequest {
                id: job.id,
                status: JobStatus::Break.code(),
                error_msg: String::new(),
                process: 0.4,
                instance_id: String::new(),
                org: String::new(),
                repo: String::new(),
            })
            .await
            .unwrap();
        let map = f.svc.realtime_status(&[job.id], "node-a").await.unwrap();
        let entry = &map[&job.id];
        assert_eq!(entry.stock_speed, "-");
        assert!((entry.stock_process - 0.4).abs() < f64::EPSILON);
    }
}
