// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gRPC services of the sink.
//!
//! - `Lumberjack` ingests records.
//! - `Forester` serves the call graph.
//! - `Sawyer` pages through stored records.
//!
//! Every handler runs inside the server interceptor chain, so requests to the
//! sink are logged and counted like those of any other service.

use std::sync::Arc;

use async_trait::async_trait;
use khaleesi_core::interceptors::ServerInterceptorChain;
use khaleesi_core::metadata::to_timestamp;
use khaleesi_proto::common_proto::{EmptyRequest, EmptyResponse, GrpcCaller, User, user::UserType};
use khaleesi_proto::methods;
use khaleesi_proto::sawmill_proto::event::{Action, ResultType, Target, action::ActionType};
use khaleesi_proto::sawmill_proto::forester_server::Forester;
use khaleesi_proto::sawmill_proto::lumberjack_server::Lumberjack;
use khaleesi_proto::sawmill_proto::sawyer_server::Sawyer;
use khaleesi_proto::sawmill_proto::{
    Error as ErrorRecord, ErrorList, ErrorRequest, ErrorResponse, Event, EventList, EventRequest,
    EventResponse, GrpcRequest, GrpcRequestList, GrpcRequestResponse, GrpcResponseRequest,
    HttpRequest, HttpRequestList, HttpRequestResponse, LogFilter, Query, QueryList, QueryResponse,
    ResponseRequest, ServiceCallData,
};
use sqlx::SqlitePool;
use tonic::{Request, Response, Status};

use crate::db::{self, ErrorRow, EventRow, GrpcRequestRow, HttpRequestRow, QueryRow};
use crate::ingest::Ingester;
use crate::service_registry::ServiceRegistry;

/// Page size used when a filter leaves it at zero.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

type GrpcResult<T> = std::result::Result<Response<T>, Status>;

// ============================================================================
// Lumberjack
// ============================================================================

/// Record ingestion.
pub struct LumberjackService {
    chain: ServerInterceptorChain,
    ingester: Arc<Ingester>,
}

impl LumberjackService {
    /// Service storing through `ingester`.
    pub fn new(chain: ServerInterceptorChain, ingester: Arc<Ingester>) -> Self {
        Self { chain, ingester }
    }
}

#[async_trait]
impl Lumberjack for LumberjackService {
    async fn log_system_http_request(
        &self,
        request: Request<EmptyRequest>,
    ) -> GrpcResult<EmptyResponse> {
        self.chain
            .handle(
                methods::LUMBERJACK_LOG_SYSTEM_HTTP_REQUEST,
                request,
                |request| async move {
                    self.ingester.log_system_http_request(request).await?;
                    Ok(EmptyResponse {})
                },
            )
            .await
    }

    async fn log_http_request(&self, request: Request<HttpRequest>) -> GrpcResult<EmptyResponse> {
        self.chain
            .handle(methods::LUMBERJACK_LOG_HTTP_REQUEST, request, |request| async move {
                self.ingester.log_http_request(request).await?;
                Ok(EmptyResponse {})
            })
            .await
    }

    async fn log_http_request_response(
        &self,
        request: Request<ResponseRequest>,
    ) -> GrpcResult<EmptyResponse> {
        self.chain
            .handle(
                methods::LUMBERJACK_LOG_HTTP_REQUEST_RESPONSE,
                request,
                |request| async move {
                    self.ingester.log_http_response(request).await?;
                    Ok(EmptyResponse {})
                },
            )
            .await
    }

    async fn log_grpc_request(&self, request: Request<GrpcRequest>) -> GrpcResult<EmptyResponse> {
        self.chain
            .handle(methods::LUMBERJACK_LOG_GRPC_REQUEST, request, |request| async move {
                self.ingester.log_grpc_request(request).await?;
                Ok(EmptyResponse {})
            })
            .await
    }

    async fn log_grpc_response(
        &self,
        request: Request<GrpcResponseRequest>,
    ) -> GrpcResult<EmptyResponse> {
        self.chain
            .handle(methods::LUMBERJACK_LOG_GRPC_RESPONSE, request, |request| async move {
                self.ingester.log_grpc_response(request).await?;
                Ok(EmptyResponse {})
            })
            .await
    }

    async fn log_event(&self, request: Request<EventRequest>) -> GrpcResult<EmptyResponse> {
        self.chain
            .handle(methods::LUMBERJACK_LOG_EVENT, request, |request| async move {
                self.ingester.log_event(request).await?;
                Ok(EmptyResponse {})
            })
            .await
    }

    async fn log_error(&self, request: Request<ErrorRequest>) -> GrpcResult<EmptyResponse> {
        self.chain
            .handle(methods::LUMBERJACK_LOG_ERROR, request, |request| async move {
                self.ingester.log_error(request).await?;
                Ok(EmptyResponse {})
            })
            .await
    }
}

// ============================================================================
// Forester
// ============================================================================

/// Call graph lookups.
pub struct ForesterService {
    chain: ServerInterceptorChain,
    registry: Arc<ServiceRegistry>,
}

impl ForesterService {
    /// Service reading `registry`.
    pub fn new(chain: ServerInterceptorChain, registry: Arc<ServiceRegistry>) -> Self {
        Self { chain, registry }
    }
}

#[async_trait]
impl Forester for ForesterService {
    async fn get_service_call_data(
        &self,
        request: Request<EmptyRequest>,
    ) -> GrpcResult<ServiceCallData> {
        self.chain
            .handle(
                methods::FORESTER_GET_SERVICE_CALL_DATA,
                request,
                |request| async move {
                    let owner = request
                        .request_metadata
                        .and_then(|metadata| metadata.grpc_caller)
                        .unwrap_or_default();
                    self.registry.get_call_data(&owner).await
                },
            )
            .await
    }
}

// ============================================================================
// Sawyer
// ============================================================================

/// Read access to stored records.
pub struct SawyerService {
    chain: ServerInterceptorChain,
    pool: SqlitePool,
}

impl SawyerService {
    /// Service reading from `pool`.
    pub fn new(chain: ServerInterceptorChain, pool: SqlitePool) -> Self {
        Self { chain, pool }
    }
}

/// `(limit, offset)` of a filter. Pages are 1-based; zero means the first page.
pub fn page_bounds(filter: &LogFilter) -> (i64, i64) {
    let page = i64::from(filter.page.max(1));
    let page_size = if filter.page_size == 0 {
        DEFAULT_PAGE_SIZE
    } else {
        filter.page_size
    };
    let limit = i64::from(page_size);
    (limit, (page - 1) * limit)
}

#[async_trait]
impl Sawyer for SawyerService {
    async fn get_events(&self, request: Request<LogFilter>) -> GrpcResult<EventList> {
        self.chain
            .handle(methods::SAWYER_GET_EVENTS, request, |filter| async move {
                let (limit, offset) = page_bounds(&filter);
                let rows = db::list_events(&self.pool, limit, offset).await?;
                Ok(EventList {
                    events: rows.iter().map(event_response).collect(),
                })
            })
            .await
    }

    async fn get_errors(&self, request: Request<LogFilter>) -> GrpcResult<ErrorList> {
        self.chain
            .handle(methods::SAWYER_GET_ERRORS, request, |filter| async move {
                let (limit, offset) = page_bounds(&filter);
                let rows = db::list_errors(&self.pool, limit, offset).await?;
                Ok(ErrorList {
                    errors: rows.iter().map(error_response).collect(),
                })
            })
            .await
    }

    async fn get_http_requests(&self, request: Request<LogFilter>) -> GrpcResult<HttpRequestList> {
        self.chain
            .handle(methods::SAWYER_GET_HTTP_REQUESTS, request, |filter| async move {
                let (limit, offset) = page_bounds(&filter);
                let rows = db::list_http_requests(&self.pool, limit, offset).await?;
                Ok(HttpRequestList {
                    requests: rows.iter().map(http_request_response).collect(),
                })
            })
            .await
    }

    async fn get_grpc_requests(&self, request: Request<LogFilter>) -> GrpcResult<GrpcRequestList> {
        self.chain
            .handle(methods::SAWYER_GET_GRPC_REQUESTS, request, |filter| async move {
                let (limit, offset) = page_bounds(&filter);
                let rows = db::list_grpc_requests(&self.pool, limit, offset).await?;
                Ok(GrpcRequestList {
                    requests: rows.iter().map(grpc_request_response).collect(),
                })
            })
            .await
    }

    async fn get_queries(&self, request: Request<LogFilter>) -> GrpcResult<QueryList> {
        self.chain
            .handle(methods::SAWYER_GET_QUERIES, request, |filter| async move {
                let (limit, offset) = page_bounds(&filter);
                let rows = db::list_queries(&self.pool, limit, offset).await?;
                Ok(QueryList {
                    queries: rows.iter().map(query_response).collect(),
                })
            })
            .await
    }
}

// ============================================================================
// Row to wire conversion
// ============================================================================

fn event_response(row: &EventRow) -> EventResponse {
    let crud_type = ActionType::from_str_name(&row.action_crud_type).unwrap_or(ActionType::Unknown);
    let result = ResultType::from_str_name(&row.action_result).unwrap_or(ResultType::Unknown);
    let owner_type = UserType::from_str_name(&row.target_owner_type).unwrap_or(UserType::Unknown);

    EventResponse {
        event: Some(Event {
            id: row.event_id.clone(),
            request_metadata: Some(row.meta.to_proto()),
            target: Some(Target {
                r#type: row.target_type.clone(),
                id: row.target_id.clone(),
                owner: Some(User {
                    id: row.target_owner_id.clone(),
                    r#type: owner_type as i32,
                }),
            }),
            action: Some(Action {
                crud_type: crud_type as i32,
                custom_type: row.action_custom_type.clone(),
                result: result as i32,
                details: row.action_details.clone(),
            }),
            logger_send_metric: row.logger_send_metric,
        }),
        logging: Some(row.meta.logging()),
    }
}

fn error_response(row: &ErrorRow) -> ErrorResponse {
    ErrorResponse {
        error: Some(ErrorRecord {
            id: row.error_id.clone(),
            request_metadata: Some(row.meta.to_proto()),
            status: row.status.clone(),
            loglevel: row.loglevel.clone(),
            gate: row.gate.clone(),
            service: row.service.clone(),
            public_key: row.public_key.clone(),
            public_details: row.public_details.clone(),
            private_message: row.private_message.clone(),
            private_details: row.private_details.clone(),
            stacktrace: row.stacktrace.clone(),
        }),
        logging: Some(row.meta.logging()),
    }
}

fn http_request_response(row: &HttpRequestRow) -> HttpRequestResponse {
    HttpRequestResponse {
        request: Some(HttpRequest {
            request_metadata: Some(row.meta.to_proto()),
            language: row.language.clone(),
            device_id: row.device_id.clone(),
            language_header: row.language_header.clone(),
            ip: row.ip.clone(),
            useragent: row.useragent.clone(),
        }),
        r#type: row.request_type.clone(),
        logging: Some(row.meta.logging()),
        response: Some(row.response.to_proto(&row.meta)),
    }
}

fn grpc_request_response(row: &GrpcRequestRow) -> GrpcRequestResponse {
    GrpcRequestResponse {
        request: Some(GrpcRequest {
            request_metadata: Some(row.meta.to_proto()),
            upstream_request: Some(GrpcCaller {
                request_id: row.upstream_request_id.clone(),
                khaleesi_gate: row.upstream_khaleesi_gate.clone(),
                khaleesi_service: row.upstream_khaleesi_service.clone(),
                grpc_service: row.upstream_grpc_service.clone(),
                grpc_method: row.upstream_grpc_method.clone(),
                pod_id: row.upstream_pod_id.clone(),
            }),
        }),
        logging: Some(row.meta.logging()),
        response: Some(row.response.to_proto(&row.meta)),
    }
}

fn query_response(row: &QueryRow) -> QueryResponse {
    QueryResponse {
        query: Some(Query {
            id: row.query_id.clone(),
            connection: row.connection.clone(),
            raw: row.raw.clone(),
            start: Some(to_timestamp(row.start_time)),
            end: Some(to_timestamp(row.end_time)),
        }),
        request_metadata: Some(row.meta.to_proto()),
        normalized: row.normalized.clone(),
        tables: split_list(&row.tables),
        columns: split_list(&row.columns),
        reported_duration_seconds: db::seconds(row.reported_duration()),
        logging: Some(row.meta.logging()),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
