//! HTTP request handlers. Responses use the `{code, msg, data}` envelope;
//! errors surface as `{code, msg}` through `ServerError`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Result, ServerError};
use crate::jobs::{CreateCacheJobRequest, UpdateJobStatusRequest};
use crate::db::entities::cache_job::TYPE_PREHEAT;
use crate::reconciler::WaitTaskRequest;
use crate::repos::RepoListQuery;
use crate::speed::RawResponse;

use super::AppState;

const DATATYPES: [&str; 3] = ["models", "datasets", "spaces"];

fn ok<T: serde::Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "code": 200, "msg": "success", "data": data }))
}

fn page<T: serde::Serialize>(total: u64, list: T) -> Json<serde_json::Value> {
    ok(json!({ "total": total, "list": list }))
}

/// Split `org/repo`, rejecting anything that isn't exactly two segments.
fn split_org_repo(org_repo: &str) -> Result<(String, String)> {
    match org_repo.split_once('/') {
        Some((org, repo)) if !org.is_empty() && !repo.is_empty() => {
            Ok((org.to_string(), repo.to_string()))
        }
        _ => Err(ServerError::InvalidParam(format!(
            "orgRepo must be org/repo, got {org_repo:?}"
        ))),
    }
}

fn check_datatype(datatype: &str) -> Result<()> {
    if DATATYPES.contains(&datatype) {
        Ok(())
    } else {
        Err(ServerError::NotFound(format!(
            "unknown datatype {datatype:?}"
        )))
    }
}

/// Forward a captured node response verbatim.
fn forward(raw: RawResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(raw.status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in &raw.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(raw.body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

pub async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ok(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "startTime": state.started_at.timestamp(),
    }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render()
}

// ---------------------------------------------------------------------------
// Management
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistRepoRequest {
    pub instance_ids: Vec<String>,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub off_verify: bool,
}

pub async fn persist_repo(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PersistRepoRequest>,
) -> Result<impl IntoResponse> {
    if req.instance_ids.is_empty() {
        return Err(ServerError::InvalidParam(
            "instanceIds must not be empty".to_string(),
        ));
    }
    let org = Some(req.org.as_str()).filter(|s| !s.is_empty());
    let repo = Some(req.repo.as_str()).filter(|s| !s.is_empty());
    let persisted = state
        .persister
        .persist_repo(&req.instance_ids, org, repo, req.off_verify)
        .await?;
    state.metrics.persist_runs_total.inc();
    Ok(ok(json!({ "persisted": persisted })))
}

pub async fn refresh_token(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let token = state.tokens.refresh().await?;
    Ok(ok(token.unwrap_or_default()))
}

pub async fn exec_wait_task(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<WaitTaskRequest>,
) -> Result<impl IntoResponse> {
    if req.limit == 0 {
        req.limit = 30;
    }
    state.reconciler.exec_wait_task(&req).await?;
    Ok(ok(()))
}

// ---------------------------------------------------------------------------
// Node callbacks
// ---------------------------------------------------------------------------

pub async fn update_job_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateJobStatusRequest>,
) -> Result<impl IntoResponse> {
    state.jobs.update_cache_status(&req).await?;
    Ok(ok(()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMountStatusRequest {
    pub id: i64,
    pub status: i32,
    #[serde(default)]
    pub error_msg: String,
}

pub async fn update_mount_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateMountStatusRequest>,
) -> Result<impl IntoResponse> {
    state
        .repos
        .update_mount_status(req.id, req.status, &req.error_msg)
        .await?;
    Ok(ok(()))
}

// ---------------------------------------------------------------------------
// Repository catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryListParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub page_size: u64,
    #[serde(default)]
    pub sort: String,
    #[serde(default)]
    pub order: String,
}

pub async fn repository_list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RepositoryListParams>,
) -> Result<impl IntoResponse> {
    let (views, total) = state
        .repos
        .list(&RepoListQuery {
            instance_id: params.instance_id,
            name: params.name,
            page: params.page,
            page_size: params.page_size,
            sort: params.sort,
            order: params.order,
        })
        .await?;
    Ok(page(total, views))
}

pub async fn repository_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    Ok(ok(state.repos.get_by_id(id).await?))
}

pub async fn repository_card(
    State(state): State<Arc<AppState>>,
    Path((aidc_code, id)): Path<(String, i64)>,
) -> Result<Response> {
    let instance_id = state.config.resolve_aidc(&aidc_code)?;
    let raw = state.repos.card(&instance_id, id).await?;
    Ok(forward(raw))
}

pub async fn repository_files_root(
    State(state): State<Arc<AppState>>,
    Path((aidc_code, id)): Path<(String, i64)>,
) -> Result<Response> {
    let instance_id = state.config.resolve_aidc(&aidc_code)?;
    let raw = state.repos.files(&instance_id, id, "").await?;
    Ok(forward(raw))
}

pub async fn repository_files(
    State(state): State<Arc<AppState>>,
    Path((aidc_code, id, file_path)): Path<(String, i64, String)>,
) -> Result<Response> {
    let instance_id = state.config.resolve_aidc(&aidc_code)?;
    let raw = state.repos.files(&instance_id, id, &file_path).await?;
    Ok(forward(raw))
}

#[derive(Debug, Deserialize)]
pub struct MountRequest {
    pub id: i64,
}

pub async fn mount_repository(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MountRequest>,
) -> Result<impl IntoResponse> {
    state.repos.mount(req.id).await?;
    Ok(ok(()))
}

// ---------------------------------------------------------------------------
// Cache jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheJobListParams {
    #[serde(default)]
    pub aidc_code: String,
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub page_size: u64,
}

pub async fn cache_job_list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CacheJobListParams>,
) -> Result<impl IntoResponse> {
    let instance_id = state.config.resolve_aidc(&params.aidc_code)?;
    let (views, total) = state
        .jobs
        .list(&instance_id, params.page, params.page_size)
        .await?;
    Ok(page(total, views))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCacheJobParams {
    pub datatype: String,
    pub org_repo: String,
    #[serde(default)]
    pub aidc_code: String,
}

pub async fn cache_job_create(
    State(state): State<Arc<AppState>>,
    Json(params): Json<CreateCacheJobParams>,
) -> Result<Response> {
    check_datatype(&params.datatype)?;
    let (org, repo) = split_org_repo(&params.org_repo)?;
    let instance_id = state.config.resolve_aidc(&params.aidc_code)?;
    let raw = state
        .jobs
        .create(&CreateCacheJobRequest {
            job_type: TYPE_PREHEAT,
            instance_id,
            datatype: params.datatype,
            org,
            repo,
            org_repo: params.org_repo,
        })
        .await?;
    state.metrics.jobs_created_total.inc();
    Ok(forward(raw))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobActionParams {
    pub id: i64,
    #[serde(default)]
    pub aidc_code: String,
}

pub async fn cache_job_stop(
    State(state): State<Arc<AppState>>,
    Json(params): Json<JobActionParams>,
) -> Result<impl IntoResponse> {
    let instance_id = state.config.resolve_aidc(&params.aidc_code)?;
    state.jobs.stop(params.id, &instance_id).await?;
    Ok(ok(()))
}

pub async fn cache_job_resume(
    State(state): State<Arc<AppState>>,
    Json(params): Json<JobActionParams>,
) -> Result<impl IntoResponse> {
    let instance_id = state.config.resolve_aidc(&params.aidc_code)?;
    state.jobs.resume(params.id, &instance_id).await?;
    Ok(ok(()))
}

pub async fn cache_job_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse> {
    state.jobs.delete(id).await?;
    Ok(ok(()))
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TagListParams {
    #[serde(default, rename = "type")]
    pub tag_type: String,
    #[serde(default)]
    pub sub_type: String,
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn tag_list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TagListParams>,
) -> Result<impl IntoResponse> {
    let tags = state
        .tags
        .list(&split_csv(&params.tag_type), &split_csv(&params.sub_type))
        .await?;
    Ok(ok(tags))
}

pub async fn task_tags(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    Ok(ok(state.tags.task_tags().await?))
}

pub async fn main_tags(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    Ok(ok(state.tags.main_tags().await?))
}
