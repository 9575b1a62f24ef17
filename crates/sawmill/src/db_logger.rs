// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structured log transport of the sink itself.
//!
//! Sawmill cannot call its own `Lumberjack` service to log the requests it
//! serves, so its records go straight to the [`Ingester`].

use std::sync::Arc;

use async_trait::async_trait;
use khaleesi_core::error::Result;
use khaleesi_core::logging::LogTransport;
use khaleesi_proto::common_proto::EmptyRequest;
use khaleesi_proto::sawmill_proto::{
    ErrorRequest, EventRequest, GrpcRequest, GrpcResponseRequest, ResponseRequest,
};

use crate::ingest::Ingester;

/// Writes sink records of sawmill's own requests to the database.
#[derive(Clone)]
pub struct StructuredDbLogger {
    ingester: Arc<Ingester>,
}

impl StructuredDbLogger {
    /// Transport storing through `ingester`.
    pub fn new(ingester: Arc<Ingester>) -> Self {
        Self { ingester }
    }
}

#[async_trait]
impl LogTransport for StructuredDbLogger {
    async fn send_log_http_request(&self, request: EmptyRequest) -> Result<()> {
        self.ingester.log_system_http_request(request).await
    }

    async fn send_log_http_response(&self, request: ResponseRequest) -> Result<()> {
        self.ingester.log_http_response(request).await
    }

    async fn send_log_grpc_request(&self, request: GrpcRequest) -> Result<()> {
        self.ingester.log_grpc_request(request).await
    }

    async fn send_log_grpc_response(&self, request: GrpcResponseRequest) -> Result<()> {
        self.ingester.log_grpc_response(request).await
    }

    async fn send_log_event(&self, request: EventRequest) -> Result<()> {
        self.ingester.log_event(request).await
    }

    async fn send_log_error(&self, request: ErrorRequest) -> Result<()> {
        self.ingester.log_error(request).await
    }
}
