// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ingestion of log records.
//!
//! Every record is stored even when incomplete: missing values are replaced by
//! placeholders and the parsing notes are kept with the row. After the row is
//! written, a record with notes is rejected with `INVALID_ARGUMENT` so the
//! reporter learns about it.
//!
//! Responses close their request with a versioned update. gRPC responses also
//! carry the queries the request ran; their summed duration becomes the
//! request's child duration, and the request's own duration is added to the
//! child duration of the HTTP request it belongs to.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use khaleesi_core::config::KhaleesiSettings;
use khaleesi_core::error::{KhaleesiError, Result};
use khaleesi_core::logging::structured::audit_event_labels;
use khaleesi_core::metrics::KhaleesiMetrics;
use khaleesi_core::state::UNKNOWN;
use khaleesi_proto::common_proto::{EmptyRequest, RequestMetadata, user::UserType};
use khaleesi_proto::sawmill_proto::event::{ResultType, action::ActionType};
use khaleesi_proto::sawmill_proto::{
    ErrorRequest, Event, EventRequest, GrpcRequest, GrpcResponseRequest, HttpRequest, Query,
    Response, ResponseRequest,
};
use khaleesi_proto::{user_type_from_i32, user_type_name};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::db::{
    self, ErrorRow, EventRow, GrpcRequestRow, HttpRequestRow, MetadataColumns, QueryRow,
    RequestTable, ResponseColumns,
};
use crate::parse_util::{Parser, max_datetime, min_datetime, or_unknown};
use crate::service_registry::ServiceRegistry;
use crate::sql;

/// `request_type` of HTTP requests started by a service itself.
pub const SYSTEM_REQUEST: &str = "SYSTEM";
/// `request_type` of HTTP requests received from a user.
pub const USER_REQUEST: &str = "USER";

/// Stores incoming records.
pub struct Ingester {
    pool: SqlitePool,
    registry: Arc<ServiceRegistry>,
    settings: Arc<KhaleesiSettings>,
    metrics: Arc<KhaleesiMetrics>,
}

impl Ingester {
    /// Ingester writing to `pool`.
    pub fn new(
        pool: SqlitePool,
        registry: Arc<ServiceRegistry>,
        settings: Arc<KhaleesiSettings>,
        metrics: Arc<KhaleesiMetrics>,
    ) -> Self {
        Self {
            pool,
            registry,
            settings,
            metrics,
        }
    }

    /// Store an HTTP request a service started on its own.
    pub async fn log_system_http_request(&self, request: EmptyRequest) -> Result<()> {
        let mut parser = Parser::new();
        let mut row = HttpRequestRow {
            meta: parse_metadata(request.request_metadata.as_ref(), &mut parser),
            request_type: SYSTEM_REQUEST.to_string(),
            language: UNKNOWN.to_string(),
            device_id: UNKNOWN.to_string(),
            language_header: UNKNOWN.to_string(),
            ip: UNKNOWN.to_string(),
            useragent: UNKNOWN.to_string(),
            ..Default::default()
        };
        row.meta.meta_logging_errors = parser.joined();

        db::insert_http_request(&self.pool, &row).await?;
        parser.into_result("system HTTP request")
    }

    /// Store an HTTP request received by a gate.
    pub async fn log_http_request(&self, request: HttpRequest) -> Result<()> {
        let mut parser = Parser::new();
        let meta = parse_metadata(request.request_metadata.as_ref(), &mut parser);
        let mut row = HttpRequestRow {
            meta,
            request_type: USER_REQUEST.to_string(),
            language: parser.string(&request.language, "language"),
            device_id: parser.string(&request.device_id, "device_id"),
            language_header: parser.string(&request.language_header, "language_header"),
            ip: parser.string(&request.ip, "ip"),
            useragent: parser.string(&request.useragent, "useragent"),
            ..Default::default()
        };
        row.meta.meta_logging_errors = parser.joined();

        db::insert_http_request(&self.pool, &row).await?;
        parser.into_result("HTTP request")
    }

    /// Close the HTTP request the response belongs to.
    pub async fn log_http_response(&self, request: ResponseRequest) -> Result<()> {
        let mut parser = Parser::new();
        let meta = parse_metadata(request.request_metadata.as_ref(), &mut parser);
        let mut response = parse_response(request.response.as_ref(), &mut parser);
        response.response_logging_errors = parser.joined();

        let http_request_id = &meta.meta_caller_http_request_id;
        let mut tx = self.pool.begin().await?;
        let handle = db::find_in_progress(&mut tx, RequestTable::Http, http_request_id)
            .await?
            .ok_or_else(|| {
                KhaleesiError::db_object_not_found(format!(
                    "No HTTP request {http_request_id} in progress."
                ))
            })?;
        if !db::close_request(&mut tx, RequestTable::Http, &handle, &response, 0).await? {
            return Err(KhaleesiError::db_outdated_information(format!(
                "HTTP request {http_request_id} changed while storing its response."
            )));
        }
        tx.commit().await?;

        parser.into_result("HTTP response")
    }

    /// Store a gRPC request and record the call in the service registry.
    pub async fn log_grpc_request(&self, request: GrpcRequest) -> Result<()> {
        let mut parser = Parser::new();
        let meta = parse_metadata(request.request_metadata.as_ref(), &mut parser);
        let upstream = request.upstream_request.unwrap_or_default();
        let mut row = GrpcRequestRow {
            meta,
            upstream_request_id: or_unknown(&upstream.request_id),
            upstream_khaleesi_gate: or_unknown(&upstream.khaleesi_gate),
            upstream_khaleesi_service: or_unknown(&upstream.khaleesi_service),
            upstream_grpc_service: or_unknown(&upstream.grpc_service),
            upstream_grpc_method: or_unknown(&upstream.grpc_method),
            upstream_pod_id: or_unknown(&upstream.pod_id),
            ..Default::default()
        };
        row.meta.meta_logging_errors = parser.joined();

        db::insert_grpc_request(&self.pool, &row).await?;

        let own = request
            .request_metadata
            .and_then(|metadata| metadata.grpc_caller)
            .unwrap_or_default();
        self.registry.add_call(&upstream, &own).await?;

        parser.into_result("gRPC request")
    }

    /// Close a gRPC request, store its queries and charge its duration to the
    /// HTTP request it belongs to.
    pub async fn log_grpc_response(&self, request: GrpcResponseRequest) -> Result<()> {
        let mut parser = Parser::new();
        let meta = parse_metadata(request.request_metadata.as_ref(), &mut parser);
        let mut response = parse_response(request.response.as_ref(), &mut parser);
        response.response_logging_errors = parser.joined();

        let mut query_notes = Parser::new();
        let queries: Vec<QueryRow> = request
            .queries
            .iter()
            .map(|query| query_row(query, &meta, &mut query_notes))
            .collect();
        let query_nanos = queries
            .iter()
            .map(|query| db::nanos(query.reported_duration()))
            .fold(0_i64, i64::saturating_add);

        let grpc_request_id = &meta.meta_caller_grpc_request_id;
        let mut tx = self.pool.begin().await?;
        let handle = db::find_in_progress(&mut tx, RequestTable::Grpc, grpc_request_id)
            .await?
            .ok_or_else(|| {
                KhaleesiError::db_object_not_found(format!(
                    "No gRPC request {grpc_request_id} in progress."
                ))
            })?;
        if !db::close_request(&mut tx, RequestTable::Grpc, &handle, &response, query_nanos).await?
        {
            return Err(KhaleesiError::db_outdated_information(format!(
                "gRPC request {grpc_request_id} changed while storing its response."
            )));
        }
        tx.commit().await?;

        db::insert_queries(&self.pool, &queries).await?;

        let duration = reported_between(
            handle.meta_reported_timestamp,
            response.response_reported_timestamp,
        );
        self.charge_http_request(&meta.meta_caller_http_request_id, duration)
            .await?;

        parser.extend(query_notes);
        parser.into_result("gRPC response")
    }

    /// Store an event.
    ///
    /// Lifecycle events of other services also count towards the audit metric,
    /// which keeps their uptime visible from the sink.
    pub async fn log_event(&self, request: EventRequest) -> Result<()> {
        let mut parser = Parser::new();
        let event = request.event.unwrap_or_else(|| {
            parser.note("event is missing");
            Event::default()
        });
        let metadata = event
            .request_metadata
            .clone()
            .or(request.request_metadata)
            .unwrap_or_else(|| {
                parser.note("request_metadata is missing");
                RequestMetadata::default()
            });
        let meta = parse_metadata(Some(&metadata), &mut parser);
        let target = event.target.clone().unwrap_or_default();
        let owner = target.owner.unwrap_or_default();
        let action = event.action.clone().unwrap_or_default();

        let mut row = EventRow {
            id: 0,
            meta,
            event_id: parser.string(&event.id, "id"),
            target_type: parser.string(&target.r#type, "target.type"),
            target_id: parser.string(&target.id, "target.id"),
            target_owner_id: parser.string(&owner.id, "target.owner.id"),
            target_owner_type: user_type_name(user_type_from_i32(owner.r#type)).to_string(),
            action_crud_type: ActionType::try_from(action.crud_type)
                .unwrap_or(ActionType::Unknown)
                .as_str_name()
                .to_string(),
            action_custom_type: or_unknown(&action.custom_type),
            action_result: ResultType::try_from(action.result)
                .unwrap_or(ResultType::Unknown)
                .as_str_name()
                .to_string(),
            action_details: parser.string(&action.details, "action.details"),
            logger_send_metric: event.logger_send_metric,
        };
        row.meta.meta_logging_errors = parser.joined();

        db::insert_event(&self.pool, &row).await?;
        if let Some(caller) = &metadata.grpc_caller {
            self.registry.add_service(caller).await?;
        }
        self.count_foreign_lifecycle_event(&metadata, &event);

        parser.into_result("event")
    }

    /// Store an error.
    pub async fn log_error(&self, request: ErrorRequest) -> Result<()> {
        let mut parser = Parser::new();
        let error = request.error.unwrap_or_else(|| {
            parser.note("error is missing");
            Default::default()
        });
        let metadata = error
            .request_metadata
            .as_ref()
            .or(request.request_metadata.as_ref());
        let meta = parse_metadata(metadata, &mut parser);

        let mut row = ErrorRow {
            id: 0,
            meta,
            error_id: parser.string(&error.id, "id"),
            status: parser.string(&error.status, "status"),
            loglevel: parser.string(&error.loglevel, "loglevel"),
            gate: parser.string(&error.gate, "gate"),
            service: parser.string(&error.service, "service"),
            public_key: error.public_key.clone(),
            public_details: error.public_details.clone(),
            private_message: parser.string(&error.private_message, "private_message"),
            private_details: error.private_details.clone(),
            stacktrace: error.stacktrace.clone(),
        };
        row.meta.meta_logging_errors = parser.joined();

        db::insert_error(&self.pool, &row).await?;
        parser.into_result("error")
    }

    async fn charge_http_request(&self, http_request_id: &str, duration: TimeDelta) -> Result<()> {
        if http_request_id == UNKNOWN {
            debug!("gRPC response without HTTP request, no child duration to propagate");
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let Some(handle) = db::find_request(&mut tx, RequestTable::Http, http_request_id).await?
        else {
            warn!(
                http_request_id,
                "HTTP request not found, child duration not propagated"
            );
            return Ok(());
        };
        if !db::add_child_duration(&mut tx, RequestTable::Http, &handle, db::nanos(duration)).await?
        {
            return Err(KhaleesiError::db_outdated_information(format!(
                "HTTP request {http_request_id} changed while adding child duration."
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    fn count_foreign_lifecycle_event(&self, metadata: &RequestMetadata, event: &Event) {
        let system = &self.settings.system;
        let is_lifecycle = event
            .target
            .as_ref()
            .is_some_and(|target| target.r#type == system.lifecycle_target);
        let crud_type = event
            .action
            .as_ref()
            .and_then(|action| ActionType::try_from(action.crud_type).ok());
        if !is_lifecycle || !matches!(crud_type, Some(ActionType::Start | ActionType::End)) {
            return;
        }
        let origin = metadata.grpc_caller.clone().unwrap_or_default();
        if origin.khaleesi_gate == self.settings.gate
            && origin.khaleesi_service == self.settings.service
        {
            return;
        }
        self.metrics
            .audit_event
            .inc(&audit_event_labels(metadata, event));
    }
}

/// Metadata columns of a record; `logged` is now, `logging_errors` is left empty.
fn parse_metadata(metadata: Option<&RequestMetadata>, parser: &mut Parser) -> MetadataColumns {
    let metadata = match metadata {
        Some(metadata) => metadata.clone(),
        None => {
            parser.note("request_metadata is missing");
            RequestMetadata::default()
        }
    };
    let http = metadata.http_caller.unwrap_or_default();
    let grpc = metadata.grpc_caller.unwrap_or_default();
    let user = metadata.user.unwrap_or_default();
    let user_type = user_type_from_i32(user.r#type);

    MetadataColumns {
        meta_caller_http_request_id: parser
            .string(&http.request_id, "request_metadata.http_caller.request_id"),
        meta_caller_http_site: or_unknown(&http.site),
        meta_caller_http_path: or_unknown(&http.path),
        meta_caller_http_pod_id: or_unknown(&http.pod_id),
        meta_caller_grpc_request_id: parser
            .string(&grpc.request_id, "request_metadata.grpc_caller.request_id"),
        meta_caller_khaleesi_gate: parser
            .string(&grpc.khaleesi_gate, "request_metadata.grpc_caller.khaleesi_gate"),
        meta_caller_khaleesi_service: parser.string(
            &grpc.khaleesi_service,
            "request_metadata.grpc_caller.khaleesi_service",
        ),
        meta_caller_grpc_service: parser
            .string(&grpc.grpc_service, "request_metadata.grpc_caller.grpc_service"),
        meta_caller_grpc_method: parser
            .string(&grpc.grpc_method, "request_metadata.grpc_caller.grpc_method"),
        meta_caller_pod_id: or_unknown(&grpc.pod_id),
        meta_user_id: parser.string(&user.id, "request_metadata.user.id"),
        meta_user_type: if user_type == UserType::Unknown {
            UNKNOWN.to_string()
        } else {
            user_type_name(user_type).to_string()
        },
        meta_reported_timestamp: parser
            .timestamp(metadata.timestamp.as_ref(), "request_metadata.timestamp"),
        meta_logged_timestamp: Utc::now(),
        meta_logging_errors: String::new(),
    }
}

fn parse_response(response: Option<&Response>, parser: &mut Parser) -> ResponseColumns {
    let response = match response {
        Some(response) => response.clone(),
        None => {
            parser.note("response is missing");
            Response::default()
        }
    };
    ResponseColumns {
        response_status: parser.string(&response.status, "response.status"),
        response_reported_timestamp: parser
            .timestamp(response.timestamp.as_ref(), "response.timestamp"),
        response_logged_timestamp: Utc::now(),
        child_duration_nanos: 0,
        response_logging_errors: String::new(),
    }
}

/// Query row sharing the response's metadata. SQL that cannot be analyzed is
/// stored raw with empty analysis.
fn query_row(query: &Query, meta: &MetadataColumns, notes: &mut Parser) -> QueryRow {
    let mut parser = Parser::new();
    let raw = parser.string(&query.raw, "query.raw");
    let analysis = sql::analyze(&query.raw).unwrap_or_else(|e| {
        warn!(query_id = %query.id, error = %e, "Could not analyze query");
        Default::default()
    });
    let end_time = parser
        .timestamp(query.end.as_ref(), "query.end")
        .min(max_datetime());

    let mut row = QueryRow {
        id: 0,
        meta: meta.clone(),
        query_id: parser.string(&query.id, "query.id"),
        connection: parser.string(&query.connection, "query.connection"),
        raw,
        normalized: analysis.normalized,
        tables: analysis.tables.join(","),
        columns: analysis.columns.join(","),
        start_time: parser.timestamp(query.start.as_ref(), "query.start"),
        end_time,
    };
    row.meta.meta_logging_errors = [meta.meta_logging_errors.as_str(), &parser.joined()]
        .into_iter()
        .filter(|notes| !notes.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    notes.extend(parser);
    row
}

fn reported_between(start: DateTime<Utc>, end: DateTime<Utc>) -> TimeDelta {
    let min = min_datetime();
    if start == min || end == min || end < start {
        return TimeDelta::zero();
    }
    end - start
}
