//! gRPC surface for speed nodes.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use crate::config::SslConfig;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::progress::ProgressStore;
use crate::registry::NodeRegistry;
use crate::scheduler::{SchedulerFileRequest, SchedulerService, SCHEDULER_YES};

pub mod pb {
    tonic::include_proto!("scheduler.v1");
}

use pb::scheduler_server::{Scheduler, SchedulerServer};

pub struct SchedulerGrpc {
    registry: Arc<NodeRegistry>,
    scheduler: Arc<SchedulerService>,
    progress: Arc<ProgressStore>,
    metrics: Arc<Metrics>,
}

impl SchedulerGrpc {
    pub fn new(
        registry: Arc<NodeRegistry>,
        scheduler: Arc<SchedulerService>,
        progress: Arc<ProgressStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            progress,
            metrics,
        }
    }
}

fn internal_req(req: pb::SchedulerFileRequest) -> SchedulerFileRequest {
    SchedulerFileRequest {
        instance_id: req.instance_id,
        datatype: req.datatype,
        org: req.org,
        repo: req.repo,
        name: req.name,
        etag: req.etag,
        file_size: req.file_size,
        start_pos: req.start_pos,
        end_pos: req.end_pos,
    }
}

#[tonic::async_trait]
impl Scheduler for SchedulerGrpc {
    async fn register(
        &self,
        request: Request<pb::RegisterRequest>,
    ) -> Result<Response<pb::RegisterResponse>, Status> {
        let req = request.into_inner();
        let id = self
            .registry
            .register(&req.instance_id, &req.host, req.port, req.online)
            .await
            .map_err(Status::from)?;
        self.metrics.register_total.inc();
        if let Ok(n) = self.registry.count_online().await {
            self.metrics.online_nodes.set(n);
        }
        Ok(Response::new(pb::RegisterResponse { success: true, id }))
    }

    async fn heartbeat(
        &self,
        request: Request<pb::HeartbeatRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        self.registry
            .heartbeat(req.id, &req.instance_id, req.online)
            .await
            .map_err(Status::from)?;
        self.metrics.heartbeat_total.inc();
        Ok(Response::new(pb::Empty {}))
    }

    async fn scheduler_file(
        &self,
        request: Request<pb::SchedulerFileRequest>,
    ) -> Result<Response<pb::SchedulerFileResponse>, Status> {
        let req = internal_req(request.into_inner());
        let resp = self
            .scheduler
            .scheduler_file(&req)
            .await
            .map_err(Status::from)?;
        self.metrics.scheduler_file_total.inc();
        if resp.scheduler_type == SCHEDULER_YES {
            self.metrics.scheduler_peer_hits.inc();
        }
        Ok(Response::new(pb::SchedulerFileResponse {
            scheduler_type: resp.scheduler_type,
            process_id: resp.process_id,
            master_instance_id: resp.master_instance_id,
            host: resp.host,
            port: resp.port,
            max_offset: resp.max_offset,
        }))
    }

    async fn sync_file_process(
        &self,
        request: Request<pb::SchedulerFileRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = internal_req(request.into_inner());
        self.scheduler
            .sync_file_process(&req)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn report_file_process(
        &self,
        request: Request<pb::FileProcessRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        self.progress
            .report_file_process(req.process_id, req.sta_pos, req.end_pos, req.status)
            .await
            .map_err(Status::from)?;
        self.metrics.report_total.inc();
        Ok(Response::new(pb::Empty {}))
    }

    async fn delete_by_etags_and_fields(
        &self,
        request: Request<pb::DeleteByEtagsAndFieldsRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        let req = request.into_inner();
        self.scheduler
            .delete_by_etags_and_fields(&SchedulerFileRequest {
                instance_id: req.instance_id,
                datatype: req.datatype,
                org: req.org,
                repo: req.repo,
                name: req.name,
                etag: req.etag,
                ..Default::default()
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }
}

/// Serve the gRPC endpoint, with mutual TLS when `ssl.enable_ca` is set.
pub async fn serve(
    addr: SocketAddr,
    svc: SchedulerGrpc,
    ssl: &SslConfig,
) -> Result<(), ServerError> {
    let mut builder = Server::builder();
    if ssl.enable_ca {
        let cert = std::fs::read(&ssl.crt_file)?;
        let key = std::fs::read(&ssl.key_file)?;
        let ca = std::fs::read(&ssl.ca_file)?;
        let tls = ServerTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .client_ca_root(Certificate::from_pem(ca));
        builder = builder
            .tls_config(tls)
            .map_err(|e| ServerError::Internal(format!("tls config: {e}")))?;
    }
    tracing::info!("gRPC server listening on {addr}");
    builder
        .add_service(SchedulerServer::new(svc))
        .serve(addr)
        .await
        .map_err(|e| ServerError::Internal(format!("grpc serve: {e}")))
}
