// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The `Maid` service every khaleesi service exposes: batch job control.

use std::sync::Arc;

use async_trait::async_trait;
use khaleesi_proto::common_proto::maid_server::Maid;
use khaleesi_proto::common_proto::{
    EmptyRequest, EmptyResponse, JobExecutionRequest, ObjectMetadataRequest,
};
use khaleesi_proto::methods;
use tonic::{Request, Response, Status};
use tracing::info;

use super::registry::BatchJobRegistry;
use crate::error::{KhaleesiError, Result};
use crate::interceptors::ServerInterceptorChain;

/// Service-specific cleanup hook behind `Maid.Cleanup`.
#[async_trait]
pub trait Broom: Send + Sync {
    /// Start the cleanup job described by `request`.
    async fn cleanup(&self, request: JobExecutionRequest) -> Result<()> {
        let action = request
            .job_execution
            .and_then(|execution| execution.action_configuration)
            .map(|action| action.action)
            .unwrap_or_default();
        Err(KhaleesiError::programming(
            "Cleanup action isn't implemented!",
            format!("Action \"{action}\" has no cleanup job."),
        ))
    }
}

/// A broom for services without cleanup jobs.
#[derive(Debug, Default)]
pub struct NoBroom;

impl Broom for NoBroom {}

/// `Maid` implementation.
pub struct MaidService {
    chain: ServerInterceptorChain,
    registry: Arc<BatchJobRegistry>,
    broom: Arc<dyn Broom>,
}

impl MaidService {
    /// Create the service.
    pub fn new(
        chain: ServerInterceptorChain,
        registry: Arc<BatchJobRegistry>,
        broom: Arc<dyn Broom>,
    ) -> Self {
        Self {
            chain,
            registry,
            broom,
        }
    }
}

#[async_trait]
impl Maid for MaidService {
    async fn abort_batch_job(
        &self,
        request: Request<ObjectMetadataRequest>,
    ) -> std::result::Result<Response<EmptyResponse>, Status> {
        self.chain
            .handle(methods::MAID_ABORT_BATCH_JOB, request, |request| async move {
                let job_id = request.object.map(|object| object.id).unwrap_or_default();
                let stopped = self.registry.stop_job(&job_id);
                info!(%job_id, stopped, "Abort batch job requested");
                Ok(EmptyResponse {})
            })
            .await
    }

    async fn abort_all_batch_jobs(
        &self,
        request: Request<EmptyRequest>,
    ) -> std::result::Result<Response<EmptyResponse>, Status> {
        self.chain
            .handle(methods::MAID_ABORT_ALL_BATCH_JOBS, request, |_| async move {
                let stopped = self.registry.stop_all_jobs();
                info!(stopped = stopped.len(), "Abort all batch jobs requested");
                Ok(EmptyResponse {})
            })
            .await
    }

    async fn cleanup(
        &self,
        request: Request<JobExecutionRequest>,
    ) -> std::result::Result<Response<EmptyResponse>, Status> {
        self.chain
            .handle(methods::MAID_CLEANUP, request, |request| async move {
                self.broom.cleanup(request).await?;
                Ok(EmptyResponse {})
            })
            .await
    }
}
