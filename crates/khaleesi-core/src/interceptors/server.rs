// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server-side interceptor chain.
//!
//! Handlers are wrapped explicitly:
//!
//! ```ignore
//! async fn log_event(&self, request: Request<EventRequest>) -> Result<Response<EmptyResponse>, Status> {
//!     self.chain
//!         .handle(methods::LUMBERJACK_LOG_EVENT, request, |request| self.ingest.log_event(request))
//!         .await
//! }
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use khaleesi_proto::HasRequestMetadata;
use khaleesi_proto::common_proto::{RequestMetadata, user::UserType};
use khaleesi_proto::user_type_from_i32;
use tonic::{Code, Status};

use super::parse_method_path;
use crate::error::{KhaleesiError, Result, status_name};
use crate::logging::StructuredLogger;
use crate::metrics::{KhaleesiMetrics, RequestLabels, string_or_unknown};
use crate::state::{self, UNKNOWN};

enum Outcome<T> {
    Success(T),
    Failure(KhaleesiError),
    // The handler panicked; the error is already masked.
    Unexpected(KhaleesiError),
}

/// Request state, Prometheus and logging interceptors, outermost first.
#[derive(Clone)]
pub struct ServerInterceptorChain {
    metrics: Arc<KhaleesiMetrics>,
    logger: StructuredLogger,
}

impl ServerInterceptorChain {
    /// Create a chain reporting through `logger`.
    pub fn new(logger: StructuredLogger) -> Self {
        Self {
            metrics: logger.metrics().clone(),
            logger,
        }
    }

    /// Run `handler` for the RPC at `method` inside the full chain.
    pub async fn handle<Req, Resp, F, Fut>(
        &self,
        method: &'static str,
        request: tonic::Request<Req>,
        handler: F,
    ) -> std::result::Result<tonic::Response<Resp>, Status>
    where
        Req: HasRequestMetadata + Send,
        Resp: Send,
        F: FnOnce(Req) -> Fut + Send,
        Fut: Future<Output = Result<Resp>> + Send,
    {
        state::scope(async move {
            state::reset();
            let request = request.into_inner();
            let upstream = request.request_metadata().cloned();
            populate_state(method, upstream.as_ref());

            let outcome = self
                .count_request(upstream.as_ref(), request, handler)
                .await;

            state::reset();
            match outcome {
                Outcome::Success(response) => Ok(tonic::Response::new(response)),
                Outcome::Failure(error) | Outcome::Unexpected(error) => Err(error.to_status()),
            }
        })
        .await
    }

    async fn count_request<Req, Resp, F, Fut>(
        &self,
        upstream: Option<&RequestMetadata>,
        request: Req,
        handler: F,
    ) -> Outcome<Resp>
    where
        F: FnOnce(Req) -> Fut,
        Fut: Future<Output = Result<Resp>>,
    {
        let outcome = self.log_request(upstream, request, handler).await;

        let status = match &outcome {
            Outcome::Success(_) => status_name(Code::Ok),
            Outcome::Failure(error) => status_name(error.status),
            Outcome::Unexpected(_) => UNKNOWN,
        };
        let current = state::current_request();
        let user = state::current_user();
        let peer = upstream
            .and_then(|upstream| upstream.grpc_caller.clone())
            .unwrap_or_default();
        self.metrics.incoming_requests.inc(&RequestLabels::new(
            status,
            user.user_type,
            &current.grpc_service,
            &current.grpc_method,
            &peer,
        ));
        outcome
    }

    async fn log_request<Req, Resp, F, Fut>(
        &self,
        upstream: Option<&RequestMetadata>,
        request: Req,
        handler: F,
    ) -> Outcome<Resp>
    where
        F: FnOnce(Req) -> Fut,
        Fut: Future<Output = Result<Resp>>,
    {
        self.logger.log_grpc_request(upstream).await;

        let outcome = match AssertUnwindSafe(handler(request)).catch_unwind().await {
            Ok(Ok(response)) => Outcome::Success(response),
            Ok(Err(error)) => Outcome::Failure(error),
            Err(payload) => Outcome::Unexpected(KhaleesiError::masking_panic(payload)),
        };

        match &outcome {
            Outcome::Success(_) => self.logger.log_grpc_response(Code::Ok).await,
            Outcome::Failure(error) | Outcome::Unexpected(error) => {
                self.logger.log_error(error).await;
                self.logger.log_grpc_response(error.status).await;
            }
        }
        outcome
    }
}

fn populate_state(method: &str, upstream: Option<&RequestMetadata>) {
    let name = parse_method_path(method);
    let http_request_id = upstream
        .and_then(|upstream| upstream.http_caller.as_ref())
        .map(|caller| string_or_unknown(&caller.request_id).to_string())
        .unwrap_or_else(|| UNKNOWN.to_string());
    let (user_id, user_type) = upstream
        .and_then(|upstream| upstream.user.as_ref())
        .map(|user| {
            (
                string_or_unknown(&user.id).to_string(),
                user_type_from_i32(user.r#type),
            )
        })
        .unwrap_or_else(|| (UNKNOWN.to_string(), UserType::Unknown));

    state::update(|state| {
        state.request.http_request_id = http_request_id;
        state.request.grpc_request_id = uuid::Uuid::new_v4().to_string();
        state.request.grpc_service = name.grpc_service;
        state.request.grpc_method = name.grpc_method;
        state.user.id = user_id;
        state.user.user_type = user_type;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KhaleesiSettings;
    use crate::logging::structured::{LogRecord, MemoryTransport};
    use khaleesi_proto::common_proto::{EmptyRequest, GrpcCaller, HttpCaller, User};
    use khaleesi_proto::methods;

    fn chain() -> (ServerInterceptorChain, Arc<MemoryTransport>) {
        let settings = Arc::new(KhaleesiSettings::for_service("core", "sawmill"));
        let metrics = KhaleesiMetrics::new(&settings).unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let logger = StructuredLogger::new(settings, metrics, transport.clone());
        (ServerInterceptorChain::new(logger), transport)
    }

    fn front() -> GrpcCaller {
        GrpcCaller {
            request_id: "r1".to_string(),
            khaleesi_gate: "gw".to_string(),
            khaleesi_service: "front".to_string(),
            grpc_service: "Front".to_string(),
            grpc_method: "Hit".to_string(),
            pod_id: "pod".to_string(),
        }
    }

    fn request() -> tonic::Request<EmptyRequest> {
        tonic::Request::new(EmptyRequest {
            request_metadata: Some(RequestMetadata {
                http_caller: Some(HttpCaller {
                    request_id: "http-1".to_string(),
                    ..Default::default()
                }),
                grpc_caller: Some(front()),
                user: Some(User {
                    id: "u1".to_string(),
                    r#type: UserType::User as i32,
                }),
                timestamp: None,
            }),
        })
    }

    async fn explode(_: EmptyRequest) -> Result<()> {
        panic!("secret failure")
    }

    fn incoming(chain: &ServerInterceptorChain, status: &str) -> u64 {
        chain.metrics.incoming_requests.get(&RequestLabels::new(
            status,
            UserType::User,
            "Lumberjack",
            "LogEvent",
            &front(),
        ))
    }

    #[tokio::test]
    async fn test_success_populates_state_and_counts() {
        let (chain, transport) = chain();

        let response = chain
            .handle(methods::LUMBERJACK_LOG_EVENT, request(), |_| async {
                let current = state::current_request();
                assert_eq!(current.http_request_id, "http-1");
                assert_eq!(current.grpc_service, "Lumberjack");
                assert_eq!(current.grpc_method, "LogEvent");
                assert_eq!(state::current_user().id, "u1");
                Ok(current.grpc_request_id)
            })
            .await
            .unwrap();

        assert_ne!(response.into_inner(), UNKNOWN);
        assert_eq!(incoming(&chain, "OK"), 1);
        assert_eq!(state::current_request().grpc_method, UNKNOWN);

        let records = transport.records();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], LogRecord::GrpcRequest(_)));
        match &records[1] {
            LogRecord::GrpcResponse(response) => {
                assert_eq!(response.response.as_ref().unwrap().status, "OK")
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_khaleesi_error_passes_through() {
        let (chain, transport) = chain();

        let status = chain
            .handle(methods::LUMBERJACK_LOG_EVENT, request(), |_| async {
                Err::<(), _>(KhaleesiError::invalid_argument(
                    "",
                    "Invalid event",
                    "action.details is missing",
                ))
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(!status.message().contains("action.details"));
        assert_eq!(incoming(&chain, "INVALID_ARGUMENT"), 1);

        let errors = transport.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].loglevel, "WARNING");
        assert_eq!(transport.records().len(), 3);
    }

    #[tokio::test]
    async fn test_panic_is_masked() {
        let (chain, transport) = chain();

        let status = chain
            .handle(methods::LUMBERJACK_LOG_EVENT, request(), explode)
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Internal);
        assert!(!status.message().contains("secret"));
        assert_eq!(incoming(&chain, "UNKNOWN"), 1);

        let errors = transport.errors();
        assert_eq!(errors[0].loglevel, "FATAL");
        assert_eq!(errors[0].private_details, "secret failure");
        assert_eq!(errors[0].public_details, "");
    }

    #[tokio::test]
    async fn test_missing_metadata_uses_unknown() {
        let (chain, transport) = chain();

        chain
            .handle(
                methods::LUMBERJACK_LOG_EVENT,
                tonic::Request::new(EmptyRequest::default()),
                |_| async {
                    assert_eq!(state::current_user().user_type, UserType::Unknown);
                    assert_eq!(state::current_request().http_request_id, UNKNOWN);
                    Ok(())
                },
            )
            .await
            .unwrap();

        match &transport.records()[0] {
            LogRecord::GrpcRequest(request) => {
                assert_eq!(request.upstream_request, Some(GrpcCaller::default()))
            }
            other => panic!("unexpected record {other:?}"),
        }
    }
}
