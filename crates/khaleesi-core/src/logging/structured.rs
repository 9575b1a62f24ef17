// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Structured logging policy.
//!
//! [`StructuredLogger`] composes sink records from request state and settings and
//! hands them to a [`LogTransport`]. Services talk to the sink over gRPC
//! ([`super::StructuredGrpcLogger`]); the sink itself persists records directly.
//!
//! A failing transport never fails the request being logged: the failure is
//! reported as a warning and the record is dropped.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use khaleesi_proto::common_proto::{EmptyRequest, GrpcCaller, RequestMetadata, User, user::UserType};
use khaleesi_proto::sawmill_proto::event::{Action, ResultType, Target, action::ActionType};
use khaleesi_proto::sawmill_proto::{
    Error as ErrorRecord, ErrorRequest, Event, EventRequest, GrpcRequest, GrpcResponseRequest,
    Query as QueryRecord, Response, ResponseRequest,
};
use khaleesi_proto::user_type_from_i32;
use tonic::Code;
use tracing::warn;

use super::log;
use crate::config::KhaleesiSettings;
use crate::error::{KhaleesiError, LogLevel, Result, status_name};
use crate::metadata::{add_request_metadata, add_system_request_metadata, to_timestamp};
use crate::metrics::{AuditEventLabels, KhaleesiMetrics};
use crate::state;

/// Delivery of sink records.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Deliver a system HTTP request record.
    async fn send_log_http_request(&self, request: EmptyRequest) -> Result<()>;

    /// Deliver an HTTP response record.
    async fn send_log_http_response(&self, request: ResponseRequest) -> Result<()>;

    /// Deliver a gRPC request record.
    async fn send_log_grpc_request(&self, request: GrpcRequest) -> Result<()>;

    /// Deliver a gRPC response record with its queries.
    async fn send_log_grpc_response(&self, request: GrpcResponseRequest) -> Result<()>;

    /// Deliver an event record.
    async fn send_log_event(&self, request: EventRequest) -> Result<()>;

    /// Deliver an error record.
    async fn send_log_error(&self, request: ErrorRequest) -> Result<()>;
}

/// Composes sink records and text log lines.
#[derive(Clone)]
pub struct StructuredLogger {
    settings: Arc<KhaleesiSettings>,
    metrics: Arc<KhaleesiMetrics>,
    transport: Arc<dyn LogTransport>,
}

impl StructuredLogger {
    /// Create a logger sending through `transport`.
    pub fn new(
        settings: Arc<KhaleesiSettings>,
        metrics: Arc<KhaleesiMetrics>,
        transport: Arc<dyn LogTransport>,
    ) -> Self {
        Self {
            settings,
            metrics,
            transport,
        }
    }

    /// Settings of the logging service.
    pub fn settings(&self) -> &Arc<KhaleesiSettings> {
        &self.settings
    }

    /// Metrics of the logging service.
    pub fn metrics(&self) -> &Arc<KhaleesiMetrics> {
        &self.metrics
    }

    // ========================================================================
    // HTTP requests
    // ========================================================================

    /// Open a system HTTP request.
    pub async fn log_http_request(&self, http_request_id: &str, grpc_method: &str) {
        let metadata =
            add_system_request_metadata(&self.settings, http_request_id, "system", grpc_method);
        log(
            &format!("HTTP request {http_request_id} started for {grpc_method}."),
            LogLevel::Info,
        );
        let request = EmptyRequest {
            request_metadata: Some(metadata),
        };
        report(
            self.transport.send_log_http_request(request).await,
            "HTTP request",
        );
    }

    /// Close a system HTTP request with `status`.
    pub async fn log_http_response(&self, http_request_id: &str, grpc_method: &str, status: Code) {
        let metadata =
            add_system_request_metadata(&self.settings, http_request_id, "system", grpc_method);
        log_response_line(&format!("HTTP request {http_request_id}"), status);
        let request = ResponseRequest {
            request_metadata: Some(metadata),
            response: Some(response(status)),
        };
        report(
            self.transport.send_log_http_response(request).await,
            "HTTP response",
        );
    }

    // ========================================================================
    // gRPC requests
    // ========================================================================

    /// Open the gRPC request currently held in request state.
    pub async fn log_grpc_request(&self, upstream: Option<&RequestMetadata>) {
        let metadata = add_request_metadata(&self.settings);
        let upstream_caller = upstream
            .and_then(|upstream| upstream.grpc_caller.clone())
            .unwrap_or_default();
        self.send_grpc_request(metadata, upstream_caller).await;
    }

    /// Open a gRPC request the service makes on its own behalf.
    pub async fn log_system_grpc_request(
        &self,
        http_request_id: &str,
        grpc_request_id: &str,
        grpc_method: &str,
    ) {
        let metadata = add_system_request_metadata(
            &self.settings,
            http_request_id,
            grpc_request_id,
            grpc_method,
        );
        self.send_grpc_request(metadata, GrpcCaller::default()).await;
    }

    async fn send_grpc_request(&self, metadata: RequestMetadata, upstream: GrpcCaller) {
        let own = metadata.grpc_caller.clone().unwrap_or_default();
        log(
            &format!(
                "gRPC request {} started for {}.{}.",
                own.request_id, own.grpc_service, own.grpc_method
            ),
            LogLevel::Info,
        );
        log(
            &format!(
                "Upstream request {} from {}/{}/{}/{}.",
                upstream.request_id,
                upstream.khaleesi_gate,
                upstream.khaleesi_service,
                upstream.grpc_service,
                upstream.grpc_method
            ),
            LogLevel::Info,
        );
        let request = GrpcRequest {
            request_metadata: Some(metadata),
            upstream_request: Some(upstream),
        };
        report(
            self.transport.send_log_grpc_request(request).await,
            "gRPC request",
        );
    }

    /// Close the gRPC request held in request state, attaching its queries.
    pub async fn log_grpc_response(&self, status: Code) {
        let metadata = add_request_metadata(&self.settings);
        let queries = state::snapshot()
            .queries
            .into_values()
            .flatten()
            .map(|query| QueryRecord {
                id: query.id,
                connection: query.connection,
                raw: query.raw,
                start: Some(to_timestamp(query.start)),
                end: Some(to_timestamp(query.end)),
            })
            .collect::<Vec<_>>();
        log(
            &format!("Reporting {} queries.", queries.len()),
            LogLevel::Debug,
        );
        self.send_grpc_response(metadata, status, queries).await;
    }

    /// Close a gRPC request the service made on its own behalf.
    pub async fn log_system_grpc_response(
        &self,
        http_request_id: &str,
        grpc_request_id: &str,
        grpc_method: &str,
        status: Code,
    ) {
        let metadata = add_system_request_metadata(
            &self.settings,
            http_request_id,
            grpc_request_id,
            grpc_method,
        );
        self.send_grpc_response(metadata, status, Vec::new()).await;
    }

    async fn send_grpc_response(
        &self,
        metadata: RequestMetadata,
        status: Code,
        queries: Vec<QueryRecord>,
    ) {
        let own = metadata.grpc_caller.clone().unwrap_or_default();
        log_response_line(
            &format!(
                "gRPC request {} for {}.{}",
                own.request_id, own.grpc_service, own.grpc_method
            ),
            status,
        );
        let request = GrpcResponseRequest {
            request_metadata: Some(metadata),
            response: Some(response(status)),
            queries,
        };
        report(
            self.transport.send_log_grpc_response(request).await,
            "gRPC response",
        );
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Report an event raised while handling the current request.
    pub async fn log_event(&self, event: Event) {
        let metadata = add_request_metadata(&self.settings);
        self.send_event(metadata, event).await;
    }

    /// Report an event the service raised on its own behalf.
    pub async fn log_system_event(
        &self,
        http_request_id: &str,
        grpc_request_id: &str,
        grpc_method: &str,
        event: Event,
    ) {
        let metadata = add_system_request_metadata(
            &self.settings,
            http_request_id,
            grpc_request_id,
            grpc_method,
        );
        self.send_event(metadata, event).await;
    }

    async fn send_event(&self, metadata: RequestMetadata, mut event: Event) {
        if event.id.is_empty() {
            event.id = uuid::Uuid::new_v4().to_string();
        }
        event.request_metadata = Some(metadata.clone());
        event.logger_send_metric = true;

        self.metrics
            .audit_event
            .inc(&audit_event_labels(&metadata, &event));

        let result = event_result(&event);
        log(&event_line(&event), event_log_level(result));

        let request = EventRequest {
            request_metadata: Some(metadata),
            event: Some(event),
        };
        report(self.transport.send_log_event(request).await, "event");
    }

    // ========================================================================
    // Errors
    // ========================================================================

    /// Report an error raised while handling the current request.
    pub async fn log_error(&self, error: &KhaleesiError) {
        let metadata = add_request_metadata(&self.settings);
        self.send_error(metadata, error).await;
    }

    /// Report an error the service raised on its own behalf.
    pub async fn log_system_error(
        &self,
        http_request_id: &str,
        grpc_request_id: &str,
        grpc_method: &str,
        error: &KhaleesiError,
    ) {
        let metadata = add_system_request_metadata(
            &self.settings,
            http_request_id,
            grpc_request_id,
            grpc_method,
        );
        self.send_error(metadata, error).await;
    }

    async fn send_error(&self, metadata: RequestMetadata, error: &KhaleesiError) {
        let error = error
            .clone()
            .with_origin(&self.settings.gate, &self.settings.service);
        log(&error.to_json(), error.loglevel);
        if !error.stacktrace.is_empty() {
            log(&error.stacktrace, error.loglevel);
        }

        let record = ErrorRecord {
            id: uuid::Uuid::new_v4().to_string(),
            request_metadata: Some(metadata.clone()),
            status: status_name(error.status).to_string(),
            loglevel: error.loglevel.as_str().to_string(),
            gate: error.gate,
            service: error.service,
            public_key: error.public_key,
            public_details: error.public_details,
            private_message: error.private_message,
            private_details: error.private_details,
            stacktrace: error.stacktrace,
        };
        let request = ErrorRequest {
            request_metadata: Some(metadata),
            error: Some(record),
        };
        report(self.transport.send_log_error(request).await, "error");
    }
}

/// Audit labels of `event` reported under `metadata`.
///
/// The origin is the reporting service, the user is the reporting request's user.
pub fn audit_event_labels(metadata: &RequestMetadata, event: &Event) -> AuditEventLabels {
    let caller = metadata.grpc_caller.clone().unwrap_or_default();
    let user = metadata
        .user
        .as_ref()
        .map(|user| user_type_from_i32(user.r#type))
        .unwrap_or(UserType::Unknown);
    let target = event.target.clone().unwrap_or_default();
    let action = event.action.clone().unwrap_or_default();
    AuditEventLabels::new(
        &caller.khaleesi_gate,
        &caller.khaleesi_service,
        user,
        &caller.grpc_service,
        &caller.grpc_method,
        &target.r#type,
        ActionType::try_from(action.crud_type).unwrap_or(ActionType::Unknown),
        &action.custom_type,
        ResultType::try_from(action.result).unwrap_or(ResultType::Unknown),
    )
}

/// A system-owned event.
pub fn system_event(
    settings: &KhaleesiSettings,
    target_type: &str,
    target_id: &str,
    crud_type: ActionType,
    result: ResultType,
    details: impl Into<String>,
) -> Event {
    Event {
        id: uuid::Uuid::new_v4().to_string(),
        request_metadata: None,
        target: Some(Target {
            r#type: target_type.to_string(),
            id: target_id.to_string(),
            owner: Some(User {
                id: settings.owner_id(),
                r#type: UserType::System as i32,
            }),
        }),
        action: Some(Action {
            crud_type: crud_type as i32,
            custom_type: String::new(),
            result: result as i32,
            details: details.into(),
        }),
        logger_send_metric: false,
    }
}

/// Text log level for an event result.
pub fn event_log_level(result: ResultType) -> LogLevel {
    match result {
        ResultType::Success => LogLevel::Info,
        ResultType::Warning => LogLevel::Warning,
        ResultType::Error => LogLevel::Error,
        ResultType::Fatal | ResultType::Unknown => LogLevel::Fatal,
    }
}

fn event_result(event: &Event) -> ResultType {
    event
        .action
        .as_ref()
        .and_then(|action| ResultType::try_from(action.result).ok())
        .unwrap_or(ResultType::Unknown)
}

fn event_line(event: &Event) -> String {
    let target = event.target.clone().unwrap_or_default();
    let owner = target.owner.clone().unwrap_or_default();
    let action = event.action.clone().unwrap_or_default();
    let action_name = if action.custom_type.is_empty() {
        ActionType::try_from(action.crud_type)
            .unwrap_or(ActionType::Unknown)
            .as_str_name()
            .to_string()
    } else {
        action.custom_type.clone()
    };
    format!(
        "Event targeting \"{}\": \"{}\" owned by \"{}\". {} with result {}. {}",
        target.r#type,
        target.id,
        owner.id,
        action_name,
        event_result(event).as_str_name(),
        action.details
    )
}

fn response(status: Code) -> Response {
    Response {
        status: status_name(status).to_string(),
        timestamp: Some(to_timestamp(Utc::now())),
    }
}

fn log_response_line(name: &str, status: Code) {
    if status == Code::Ok {
        log(&format!("{name} finished successfully."), LogLevel::Info);
    } else {
        log(
            &format!("{name} finished with error code {}.", status_name(status)),
            LogLevel::Warning,
        );
    }
}

fn report(result: Result<()>, record: &str) {
    if let Err(e) = result {
        warn!(record, error = %e, "Failed to deliver structured log record");
    }
}

// ============================================================================
// In-memory transport
// ============================================================================

/// A record delivered to a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// System HTTP request.
    HttpRequest(EmptyRequest),
    /// HTTP response.
    HttpResponse(ResponseRequest),
    /// gRPC request.
    GrpcRequest(GrpcRequest),
    /// gRPC response.
    GrpcResponse(GrpcResponseRequest),
    /// Event.
    Event(EventRequest),
    /// Error.
    Error(ErrorRequest),
}

/// Keeps every record in memory. For services running without a sink.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record received so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<Event> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                LogRecord::Event(request) => request.event,
                _ => None,
            })
            .collect()
    }

    /// Errors received so far.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                LogRecord::Error(request) => request.error,
                _ => None,
            })
            .collect()
    }

    fn push(&self, record: LogRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[async_trait]
impl LogTransport for MemoryTransport {
    async fn send_log_http_request(&self, request: EmptyRequest) -> Result<()> {
        self.push(LogRecord::HttpRequest(request));
        Ok(())
    }

    async fn send_log_http_response(&self, request: ResponseRequest) -> Result<()> {
        self.push(LogRecord::HttpResponse(request));
        Ok(())
    }

    async fn send_log_grpc_request(&self, request: GrpcRequest) -> Result<()> {
        self.push(LogRecord::GrpcRequest(request));
        Ok(())
    }

    async fn send_log_grpc_response(&self, request: GrpcResponseRequest) -> Result<()> {
        self.push(LogRecord::GrpcResponse(request));
        Ok(())
    }

    async fn send_log_event(&self, request: EventRequest) -> Result<()> {
        self.push(LogRecord::Event(request));
        Ok(())
    }

    async fn send_log_error(&self, request: ErrorRequest) -> Result<()> {
        self.push(LogRecord::Error(request));
        Ok(())
    }
}
