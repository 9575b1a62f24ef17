// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport delivering structured records to the sawmill sink over gRPC.

use std::sync::Arc;

use async_trait::async_trait;
use khaleesi_proto::common_proto::EmptyRequest;
use khaleesi_proto::methods;
use khaleesi_proto::sawmill_proto::forester_client::ForesterClient;
use khaleesi_proto::sawmill_proto::lumberjack_client::LumberjackClient;
use khaleesi_proto::sawmill_proto::{
    ErrorRequest, EventRequest, GrpcRequest, GrpcResponseRequest, ResponseRequest,
    ServiceCallData,
};
use tonic::transport::Channel;

use super::structured::LogTransport;
use crate::channels::ChannelManager;
use crate::error::Result;
use crate::interceptors::ClientInterceptor;
use crate::metrics::initializer::CallDataSource;

/// Gate of the sink.
pub const SINK_GATE: &str = "core";
/// Service name of the sink.
pub const SINK_SERVICE: &str = "sawmill";

/// Sends every record to `core.sawmill` through the `Lumberjack` service.
#[derive(Clone)]
pub struct StructuredGrpcLogger {
    channels: Arc<ChannelManager>,
    interceptor: ClientInterceptor,
}

impl StructuredGrpcLogger {
    /// Create a transport using `channels` to reach the sink.
    pub fn new(channels: Arc<ChannelManager>, interceptor: ClientInterceptor) -> Self {
        Self {
            channels,
            interceptor,
        }
    }

    async fn lumberjack(&self) -> Result<LumberjackClient<Channel>> {
        let channel = self.channels.get_channel(SINK_GATE, SINK_SERVICE).await?;
        Ok(LumberjackClient::new(channel))
    }
}

#[async_trait]
impl LogTransport for StructuredGrpcLogger {
    async fn send_log_http_request(&self, request: EmptyRequest) -> Result<()> {
        let mut client = self.lumberjack().await?;
        self.interceptor
            .call(
                methods::LUMBERJACK_LOG_SYSTEM_HTTP_REQUEST,
                request,
                |request| async move { client.log_system_http_request(request).await },
            )
            .await?;
        Ok(())
    }

    async fn send_log_http_response(&self, request: ResponseRequest) -> Result<()> {
        let mut client = self.lumberjack().await?;
        self.interceptor
            .call(
                methods::LUMBERJACK_LOG_HTTP_REQUEST_RESPONSE,
                request,
                |request| async move { client.log_http_request_response(request).await },
            )
            .await?;
        Ok(())
    }

    async fn send_log_grpc_request(&self, request: GrpcRequest) -> Result<()> {
        let mut client = self.lumberjack().await?;
        self.interceptor
            .call(
                methods::LUMBERJACK_LOG_GRPC_REQUEST,
                request,
                |request| async move { client.log_grpc_request(request).await },
            )
            .await?;
        Ok(())
    }

    async fn send_log_grpc_response(&self, request: GrpcResponseRequest) -> Result<()> {
        let mut client = self.lumberjack().await?;
        self.interceptor
            .call(
                methods::LUMBERJACK_LOG_GRPC_RESPONSE,
                request,
                |request| async move { client.log_grpc_response(request).await },
            )
            .await?;
        Ok(())
    }

    async fn send_log_event(&self, request: EventRequest) -> Result<()> {
        let mut client = self.lumberjack().await?;
        self.interceptor
            .call(
                methods::LUMBERJACK_LOG_EVENT,
                request,
                |request| async move { client.log_event(request).await },
            )
            .await?;
        Ok(())
    }

    async fn send_log_error(&self, request: ErrorRequest) -> Result<()> {
        let mut client = self.lumberjack().await?;
        self.interceptor
            .call(
                methods::LUMBERJACK_LOG_ERROR,
                request,
                |request| async move { client.log_error(request).await },
            )
            .await?;
        Ok(())
    }
}

/// Call data fetched from the sink's `Forester` service.
#[derive(Clone)]
pub struct GrpcCallDataSource {
    channels: Arc<ChannelManager>,
    interceptor: ClientInterceptor,
}

impl GrpcCallDataSource {
    /// Create a source using `channels` to reach the sink.
    pub fn new(channels: Arc<ChannelManager>, interceptor: ClientInterceptor) -> Self {
        Self {
            channels,
            interceptor,
        }
    }
}

#[async_trait]
impl CallDataSource for GrpcCallDataSource {
    async fn service_call_data(&self, request: EmptyRequest) -> Result<ServiceCallData> {
        let channel = self.channels.get_channel(SINK_GATE, SINK_SERVICE).await?;
        let mut client = ForesterClient::new(channel);
        self.interceptor
            .call(
                methods::FORESTER_GET_SERVICE_CALL_DATA,
                request,
                |request| async move { client.get_service_call_data(request).await },
            )
            .await
    }
}
