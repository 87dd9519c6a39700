//! Operator-facing HTTP surface.

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::jobs::CacheJobService;
use crate::metrics::Metrics;
use crate::persister::RepoPersister;
use crate::reconciler::Reconciler;
use crate::repos::RepositoryService;
use crate::tags::TagService;
use crate::tokens::TokenCache;

/// Everything handlers need, carried by dependency injection — no globals.
pub struct AppState {
    pub config: Config,
    pub jobs: Arc<CacheJobService>,
    pub repos: Arc<RepositoryService>,
    pub tags: Arc<TagService>,
    pub persister: Arc<RepoPersister>,
    pub reconciler: Arc<Reconciler>,
    pub tokens: Arc<TokenCache>,
    pub metrics: Arc<Metrics>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/info", get(handlers::info));
    if state.config.server.metrics {
        app = app.route("/metrics", get(handlers::metrics));
    }
    app = app
        // Operator management
        .route("/api/persistRepo", post(handlers::persist_repo))
        .route("/api/refreshToken", get(handlers::refresh_token))
        .route("/api/execWaitTask", post(handlers::exec_wait_task))
        // Node callbacks
        .route("/api/cacheJob/updateStatus", post(handlers::update_job_status))
        .route(
            "/api/repository/updateStatus",
            post(handlers::update_mount_status),
        )
        // Repository catalog
        .route("/api/v1/repositories", get(handlers::repository_list))
        .route("/api/v1/repository/:id", get(handlers::repository_info))
        .route(
            "/api/v1/repository/card/:aidc_code/:id",
            get(handlers::repository_card),
        )
        .route(
            "/api/v1/repository/files/:aidc_code/:id",
            get(handlers::repository_files_root),
        )
        .route(
            "/api/v1/repository/files/:aidc_code/:id/*file_path",
            get(handlers::repository_files),
        )
        .route("/api/v1/repositories/mount", post(handlers::mount_repository))
        // Cache jobs
        .route("/api/v1/cacheJob/list", get(handlers::cache_job_list))
        .route("/api/v1/cacheJob/create", post(handlers::cache_job_create))
        .route("/api/v1/cacheJob/stop", post(handlers::cache_job_stop))
        .route("/api/v1/cacheJob/resume", post(handlers::cache_job_resume))
        .route("/api/v1/cacheJob/:id", delete(handlers::cache_job_delete))
        // Tag reference data
        .route("/api/v1/tags", get(handlers::tag_list))
        .route("/api/v1/task_tags", get(handlers::task_tags))
        .route("/api/v1/main_tags", get(handlers::main_tags));

    app.with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(GlobalConcurrencyLimitLayer::new(
            state.config.scheduler.http_queue_limit,
        ))
}
