mod cache;
mod config;
mod db;
mod error;
mod grpc;
mod http;
mod jobs;
mod locks;
mod metrics;
mod organization;
mod persister;
mod progress;
mod reconciler;
mod registry;
mod repos;
mod scheduler;
mod speed;
mod tags;
mod tokens;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::TtlCache;
use crate::config::Config;
use crate::http::AppState;
use crate::jobs::CacheJobService;
use crate::locks::LockRegistry;
use crate::metrics::Metrics;
use crate::organization::{HubAvatarSource, OrgLogoService};
use crate::persister::RepoPersister;
use crate::progress::ProgressStore;
use crate::reconciler::Reconciler;
use crate::registry::NodeRegistry;
use crate::repos::RepositoryService;
use crate::scheduler::SchedulerService;
use crate::speed::SpeedClient;
use crate::tags::TagService;
use crate::tokens::TokenCache;

#[derive(Debug, Parser)]
#[command(name = "mirror-scheduler", version)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, short, env = "MIRROR_SCHEDULER_CONFIG", default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirror_scheduler=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config).expect("failed to load configuration");

    let dbc = db::init_database(&cfg.db)
        .await
        .expect("failed to initialize database");
    tracing::info!("database connected");

    // Shared substrate.
    let metrics = Arc::new(Metrics::default());
    let locks = Arc::new(LockRegistry::new());
    let speed_cache = Arc::new(TtlCache::new());
    let card_cache = Arc::new(TtlCache::new());

    let registry = Arc::new(NodeRegistry::new(
        dbc.clone(),
        speed_cache,
        cfg.speed_expiration(),
        cfg.heartbeat_gap(),
    ));
    let progress = Arc::new(ProgressStore::new(dbc.clone()));
    let client = Arc::new(SpeedClient::new(cfg.retry.clone()));
    let tokens = Arc::new(TokenCache::new(
        dbc.clone(),
        cfg.scheduler.global_token.clone(),
    ));
    let logo = Arc::new(OrgLogoService::new(
        dbc.clone(),
        Arc::new(HubAvatarSource::new(cfg.hub_url_base())),
        PathBuf::from(&cfg.avatar.path),
    ));
    let persister = Arc::new(RepoPersister::new(
        dbc.clone(),
        progress.clone(),
        registry.clone(),
        client.clone(),
        tokens.clone(),
        Some(logo),
    ));
    let scheduler_svc = Arc::new(SchedulerService::new(
        dbc.clone(),
        progress.clone(),
        registry.clone(),
        locks.clone(),
        cfg.cache_expiration(),
    ));
    let jobs = Arc::new(CacheJobService::new(
        dbc.clone(),
        registry.clone(),
        client.clone(),
        tokens.clone(),
        locks,
        persister.clone(),
        cfg.job_lock_expiration(),
    ));
    let repos = Arc::new(RepositoryService::new(
        dbc.clone(),
        registry.clone(),
        client,
        tokens.clone(),
        card_cache,
        cfg.cache_expiration(),
        cfg.oss.path.clone(),
    ));
    let tags = Arc::new(TagService::new(dbc.clone()));
    let reconciler = Arc::new(Reconciler::new(
        jobs.clone(),
        repos.clone(),
        persister.clone(),
        metrics.clone(),
        cfg.scheduler.persist_repo.clone(),
    ));

    // Heal anything a dead process left in Stopping before taking traffic.
    reconciler
        .startup_repair()
        .await
        .expect("startup repair failed");
    reconciler.spawn_cron();

    let grpc_addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.scheduler.port)
        .parse()
        .expect("invalid gRPC host:port");
    let http_addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .expect("invalid HTTP host:port");
    let ssl = cfg.server.ssl.clone();

    let state = Arc::new(AppState {
        config: cfg,
        jobs,
        repos,
        tags,
        persister,
        reconciler,
        tokens,
        metrics: metrics.clone(),
        started_at: Utc::now(),
    });

    let grpc_svc = grpc::SchedulerGrpc::new(registry, scheduler_svc, progress, metrics);
    let grpc_task = tokio::spawn(async move {
        grpc::serve(grpc_addr, grpc_svc, &ssl)
            .await
            .expect("grpc server failed");
    });

    let app = http::router(state);
    tracing::info!("HTTP server listening on {http_addr}");
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .expect("failed to bind HTTP listener");
    axum::serve(listener, app).await.expect("http server failed");
    grpc_task.abort();
}
