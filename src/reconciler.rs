//! Reconciler: startup repair, periodic repo persistence, wait-task drain.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use serde::Deserialize;

use crate::config::PersistRepoConfig;
use crate::db::entities::cache_job::{TYPE_MOUNT, TYPE_PREHEAT};
use crate::error::{Result, ServerError};
use crate::jobs::{CacheJobService, JobStatus};
use crate::metrics::Metrics;
use crate::persister::RepoPersister;
use crate::repos::RepositoryService;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitTaskRequest {
    #[serde(rename = "type")]
    pub job_type: i32,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub ids: Vec<i64>,
    #[serde(default)]
    pub limit: u64,
}

pub struct Reconciler {
    jobs: Arc<CacheJobService>,
    repos: Arc<RepositoryService>,
    persister: Arc<RepoPersister>,
    metrics: Arc<Metrics>,
    cfg: PersistRepoConfig,
}

impl Reconciler {
    pub fn new(
        jobs: Arc<CacheJobService>,
        repos: Arc<RepositoryService>,
        persister: Arc<RepoPersister>,
        metrics: Arc<Metrics>,
        cfg: PersistRepoConfig,
    ) -> Self {
        Self {
            jobs,
            repos,
            persister,
            metrics,
            cfg,
        }
    }

    /// Heal state left behind by a dead process: anything still `Stopping`
    /// goes to `Stop`. Idempotent, runs before the servers accept traffic.
    pub async fn startup_repair(&self) -> Result<()> {
        let jobs = self.jobs.repair_stopping().await?;
        let mounts = self.repos.repair_stopping().await?;
        if jobs + mounts > 0 {
            tracing::info!(jobs, mounts, "repaired stale stopping state");
        }
        Ok(())
    }

    /// Background loop driving the periodic persist sweep. Returns
    /// immediately when the sweep is disabled.
    pub fn spawn_cron(self: &Arc<Self>) {
        if !self.cfg.enabled {
            return;
        }
        let schedule = match Schedule::from_str(&self.cfg.cron) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("invalid persistRepo cron {:?}: {e}", self.cfg.cron);
                return;
            }
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    tracing::warn!("persistRepo cron has no upcoming fire time");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                this.run_persist_sweep().await;
            }
        });
    }

    pub async fn run_persist_sweep(&self) {
        let instance_ids = self.cfg.instance_id_list();
        if instance_ids.is_empty() {
            return;
        }
        self.metrics.persist_runs_total.inc();
        match self
            .persister
            .persist_repo(&instance_ids, None, None, false)
            .await
        {
            Ok(n) => {
                for _ in 0..n {
                    self.metrics.repos_persisted_total.inc();
                }
                if n > 0 {
                    tracing::info!(persisted = n, "periodic persist sweep done");
                }
            }
            Err(e) => tracing::error!("periodic persist sweep failed: {e}"),
        }
    }

    /// Drain interrupted/queued work for one instance: resume broken preheat
    /// jobs or re-mount repositories, one by one. Failures are logged and
    /// the drain continues.
    pub async fn exec_wait_task(&self, req: &WaitTaskRequest) -> Result<()> {
        let statuses = [JobStatus::Break, JobStatus::Wait];
        match req.job_type {
            TYPE_PREHEAT => {
                let jobs = self
                    .jobs
                    .waiting_jobs(&req.instance_id, &req.ids, &statuses, req.limit)
                    .await?;
                for job in jobs {
                    if let Err(e) = self.jobs.resume(job.id, &req.instance_id).await {
                        tracing::error!(job_id = job.id, "wait-task resume failed: {e}");
                    }
                }
                Ok(())
            }
            TYPE_MOUNT => {
                let repos = self
                    .repos
                    .unmounted_repositories(&req.instance_id, &req.ids, &statuses, req.limit)
                    .await?;
                for repo in repos {
                    if let Err(e) = self.repos.mount(repo.id).await {
                        tracing::error!(repo_id = repo.id, "wait-task mount failed: {e}");
                    }
                }
                Ok(())
            }
            other => Err(ServerError::InvalidParam(format!(
                "unknown wait-task type: {other}"
            ))),
        }
    }
}
