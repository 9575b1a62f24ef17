// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-side interceptor for outgoing RPCs.

use std::future::Future;
use std::sync::Arc;

use khaleesi_proto::HasRequestMetadata;
use khaleesi_proto::common_proto::GrpcCaller;
use tonic::{Code, Status};
use tracing::{info, warn};

use super::parse_method_path;
use crate::config::KhaleesiSettings;
use crate::error::{KhaleesiError, Result, status_name};
use crate::metadata::add_request_metadata;
use crate::metrics::{KhaleesiMetrics, RequestLabels};
use crate::state;

/// Attaches caller metadata, logs and counts every outgoing RPC.
#[derive(Clone)]
pub struct ClientInterceptor {
    settings: Arc<KhaleesiSettings>,
    metrics: Arc<KhaleesiMetrics>,
}

impl ClientInterceptor {
    /// Create an interceptor for the service described by `settings`.
    pub fn new(settings: Arc<KhaleesiSettings>, metrics: Arc<KhaleesiMetrics>) -> Self {
        Self { settings, metrics }
    }

    /// Send `request` to `method` through `send`.
    ///
    /// Metadata already present on the request is kept. A non-OK status becomes
    /// an upstream error.
    pub async fn call<Req, Resp, F, Fut>(&self, method: &str, mut request: Req, send: F) -> Result<Resp>
    where
        Req: HasRequestMetadata,
        F: FnOnce(tonic::Request<Req>) -> Fut,
        Fut: Future<Output = std::result::Result<tonic::Response<Resp>, Status>>,
    {
        let metadata = request.request_metadata_mut();
        if metadata.is_none() {
            *metadata = Some(add_request_metadata(&self.settings));
        }

        info!(method, "Sending gRPC request");
        let result = send(tonic::Request::new(request)).await;

        let code = match &result {
            Ok(_) => Code::Ok,
            Err(status) => status.code(),
        };
        self.count(method, code);

        match result {
            Ok(response) => {
                info!(method, "gRPC request finished successfully");
                Ok(response.into_inner())
            }
            Err(status) => {
                warn!(method, status = status_name(status.code()), message = status.message(), "gRPC request failed");
                Err(KhaleesiError::upstream_grpc(&status))
            }
        }
    }

    fn count(&self, method: &str, code: Code) {
        let name = parse_method_path(method);
        let current = state::current_request();
        let user = state::current_user();
        let peer = GrpcCaller {
            khaleesi_gate: name.gate,
            khaleesi_service: name.service,
            grpc_service: name.grpc_service,
            grpc_method: name.grpc_method,
            ..Default::default()
        };
        self.metrics.outgoing_requests.inc(&RequestLabels::new(
            status_name(code),
            user.user_type,
            &current.grpc_service,
            &current.grpc_method,
            &peer,
        ));
    }
}
