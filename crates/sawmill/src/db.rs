// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database operations for sawmill.
//!
//! One table per record type (HTTP requests, gRPC requests, events, errors,
//! queries) plus the five service registry tables. Every log table carries the
//! same `meta_*` columns, mapped through [`MetadataColumns`]; request tables also
//! carry the `response_*` columns of [`ResponseColumns`] and a `version` for
//! optimistic concurrency.

use chrono::{DateTime, TimeDelta, Utc};
use khaleesi_core::metadata::to_timestamp;
use khaleesi_proto::common_proto::{GrpcCaller, HttpCaller, RequestMetadata, User, user::UserType};
use khaleesi_proto::sawmill_proto::{LoggingMetadata, ResponseMetadata};
use sqlx::query_builder::Separated;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::parse_util::min_datetime;

/// Response status of a request that has not been answered yet.
pub const IN_PROGRESS: &str = "IN_PROGRESS";

/// Rows per bulk insert. Keeps a query batch well below SQLite's bind limit.
pub const BULK_BATCH_SIZE: usize = 1000;

const METADATA_COLUMNS: &str = "meta_caller_http_request_id, meta_caller_http_site, \
    meta_caller_http_path, meta_caller_http_pod_id, meta_caller_grpc_request_id, \
    meta_caller_khaleesi_gate, meta_caller_khaleesi_service, meta_caller_grpc_service, \
    meta_caller_grpc_method, meta_caller_pod_id, meta_user_id, meta_user_type, \
    meta_reported_timestamp, meta_logged_timestamp, meta_logging_errors";

// ============================================================================
// Shared column groups
// ============================================================================

/// Caller identity and sink bookkeeping stored with every record.
#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct MetadataColumns {
    /// Correlating HTTP request.
    pub meta_caller_http_request_id: String,
    /// Site the HTTP request came in through.
    pub meta_caller_http_site: String,
    /// Path of the HTTP request.
    pub meta_caller_http_path: String,
    /// Pod that handled the HTTP request.
    pub meta_caller_http_pod_id: String,
    /// Reporting gRPC request.
    pub meta_caller_grpc_request_id: String,
    /// Reporting gate.
    pub meta_caller_khaleesi_gate: String,
    /// Reporting service.
    pub meta_caller_khaleesi_service: String,
    /// Reporting gRPC service.
    pub meta_caller_grpc_service: String,
    /// Reporting gRPC method.
    pub meta_caller_grpc_method: String,
    /// Reporting pod.
    pub meta_caller_pod_id: String,
    /// User on whose behalf the request ran.
    pub meta_user_id: String,
    /// User type name (`SYSTEM`, `USER`, ...).
    pub meta_user_type: String,
    /// Reporter-side timestamp.
    pub meta_reported_timestamp: DateTime<Utc>,
    /// When the sink stored the record.
    pub meta_logged_timestamp: DateTime<Utc>,
    /// Parsing notes, one per line.
    pub meta_logging_errors: String,
}

impl MetadataColumns {
    /// The stored metadata in wire form.
    pub fn to_proto(&self) -> RequestMetadata {
        RequestMetadata {
            http_caller: Some(HttpCaller {
                request_id: self.meta_caller_http_request_id.clone(),
                site: self.meta_caller_http_site.clone(),
                path: self.meta_caller_http_path.clone(),
                pod_id: self.meta_caller_http_pod_id.clone(),
            }),
            grpc_caller: Some(GrpcCaller {
                request_id: self.meta_caller_grpc_request_id.clone(),
                khaleesi_gate: self.meta_caller_khaleesi_gate.clone(),
                khaleesi_service: self.meta_caller_khaleesi_service.clone(),
                grpc_service: self.meta_caller_grpc_service.clone(),
                grpc_method: self.meta_caller_grpc_method.clone(),
                pod_id: self.meta_caller_pod_id.clone(),
            }),
            user: Some(User {
                id: self.meta_user_id.clone(),
                r#type: UserType::from_str_name(&self.meta_user_type)
                    .unwrap_or(UserType::Unknown) as i32,
            }),
            timestamp: Some(to_timestamp(self.meta_reported_timestamp)),
        }
    }

    /// Sink bookkeeping in wire form.
    pub fn logging(&self) -> LoggingMetadata {
        LoggingMetadata {
            logged_timestamp: Some(to_timestamp(self.meta_logged_timestamp)),
            logging_errors: self.meta_logging_errors.clone(),
        }
    }
}

fn push_metadata(row: &mut Separated<'_, '_, Sqlite, &'static str>, meta: &MetadataColumns) {
    row.push_bind(meta.meta_caller_http_request_id.clone())
        .push_bind(meta.meta_caller_http_site.clone())
        .push_bind(meta.meta_caller_http_path.clone())
        .push_bind(meta.meta_caller_http_pod_id.clone())
        .push_bind(meta.meta_caller_grpc_request_id.clone())
        .push_bind(meta.meta_caller_khaleesi_gate.clone())
        .push_bind(meta.meta_caller_khaleesi_service.clone())
        .push_bind(meta.meta_caller_grpc_service.clone())
        .push_bind(meta.meta_caller_grpc_method.clone())
        .push_bind(meta.meta_caller_pod_id.clone())
        .push_bind(meta.meta_user_id.clone())
        .push_bind(meta.meta_user_type.clone())
        .push_bind(meta.meta_reported_timestamp)
        .push_bind(meta.meta_logged_timestamp)
        .push_bind(meta.meta_logging_errors.clone());
}

/// Response state of a request record.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ResponseColumns {
    /// gRPC status name, or `IN_PROGRESS`.
    pub response_status: String,
    /// Reporter-side timestamp of the response.
    pub response_reported_timestamp: DateTime<Utc>,
    /// When the sink stored the response.
    pub response_logged_timestamp: DateTime<Utc>,
    /// Summed reported duration of the calls this request spawned.
    pub child_duration_nanos: i64,
    /// Parsing notes of the response, one per line.
    pub response_logging_errors: String,
}

impl Default for ResponseColumns {
    fn default() -> Self {
        Self {
            response_status: IN_PROGRESS.to_string(),
            response_reported_timestamp: min_datetime(),
            response_logged_timestamp: min_datetime(),
            child_duration_nanos: 0,
            response_logging_errors: String::new(),
        }
    }
}

impl ResponseColumns {
    /// Whether no response has been stored yet.
    pub fn is_in_progress(&self) -> bool {
        self.response_status == IN_PROGRESS
    }

    /// Response minus request, both reporter-side.
    ///
    /// Zero while in progress or when either timestamp is missing.
    pub fn reported_duration(&self, meta: &MetadataColumns) -> TimeDelta {
        let min = min_datetime();
        if self.is_in_progress()
            || self.response_reported_timestamp == min
            || meta.meta_reported_timestamp == min
        {
            return TimeDelta::zero();
        }
        self.response_reported_timestamp - meta.meta_reported_timestamp
    }

    /// Response minus request, both sink-side. Zero while in progress.
    pub fn logged_duration(&self, meta: &MetadataColumns) -> TimeDelta {
        if self.is_in_progress() {
            return TimeDelta::zero();
        }
        self.response_logged_timestamp - meta.meta_logged_timestamp
    }

    /// Time spent in downstream calls.
    pub fn child_duration(&self) -> TimeDelta {
        TimeDelta::nanoseconds(self.child_duration_nanos)
    }

    /// Child duration as a share of the logged duration.
    pub fn child_duration_relative(&self, meta: &MetadataColumns) -> f64 {
        let logged = self.logged_duration(meta);
        if self.is_in_progress() || logged.is_zero() {
            return 0.0;
        }
        seconds(self.child_duration()) / seconds(logged)
    }

    /// Response state and derived durations in wire form.
    pub fn to_proto(&self, meta: &MetadataColumns) -> ResponseMetadata {
        ResponseMetadata {
            status: self.response_status.clone(),
            reported_timestamp: Some(to_timestamp(self.response_reported_timestamp)),
            logged_timestamp: Some(to_timestamp(self.response_logged_timestamp)),
            logging_errors: self.response_logging_errors.clone(),
            reported_duration_seconds: seconds(self.reported_duration(meta)),
            logged_duration_seconds: seconds(self.logged_duration(meta)),
            child_duration_seconds: seconds(self.child_duration()),
            child_duration_relative: self.child_duration_relative(meta),
            in_progress: self.is_in_progress(),
        }
    }
}

/// A duration in fractional seconds.
pub fn seconds(duration: TimeDelta) -> f64 {
    duration.num_nanoseconds().map_or_else(
        || duration.num_milliseconds() as f64 / 1e3,
        |nanos| nanos as f64 / 1e9,
    )
}

/// Saturating nanoseconds of a duration.
pub fn nanos(duration: TimeDelta) -> i64 {
    duration.num_nanoseconds().unwrap_or(if duration < TimeDelta::zero() {
        i64::MIN
    } else {
        i64::MAX
    })
}

// ============================================================================
// Record rows
// ============================================================================

/// HTTP request record.
#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct HttpRequestRow {
    /// Row id; ignored on insert.
    pub id: i64,
    /// Caller metadata.
    #[sqlx(flatten)]
    pub meta: MetadataColumns,
    /// `USER` or `SYSTEM`.
    pub request_type: String,
    /// Language selected by the user.
    pub language: String,
    /// Device identifier.
    pub device_id: String,
    /// Raw `Accept-Language` header.
    pub language_header: String,
    /// Client address.
    pub ip: String,
    /// Client user agent.
    pub useragent: String,
    /// Response state.
    #[sqlx(flatten)]
    pub response: ResponseColumns,
    /// Optimistic concurrency version.
    pub version: i64,
}

/// gRPC request record.
#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct GrpcRequestRow {
    /// Row id; ignored on insert.
    pub id: i64,
    /// Caller metadata.
    #[sqlx(flatten)]
    pub meta: MetadataColumns,
    /// Upstream gRPC request.
    pub upstream_request_id: String,
    /// Upstream gate.
    pub upstream_khaleesi_gate: String,
    /// Upstream service.
    pub upstream_khaleesi_service: String,
    /// Upstream gRPC service.
    pub upstream_grpc_service: String,
    /// Upstream gRPC method.
    pub upstream_grpc_method: String,
    /// Upstream pod.
    pub upstream_pod_id: String,
    /// Response state.
    #[sqlx(flatten)]
    pub response: ResponseColumns,
    /// Optimistic concurrency version.
    pub version: i64,
}

/// Event record.
#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct EventRow {
    /// Row id; ignored on insert.
    pub id: i64,
    /// Caller metadata.
    #[sqlx(flatten)]
    pub meta: MetadataColumns,
    /// Reporter-assigned event id.
    pub event_id: String,
    /// Target type.
    pub target_type: String,
    /// Target id.
    pub target_id: String,
    /// Owner of the target.
    pub target_owner_id: String,
    /// Owner type name.
    pub target_owner_type: String,
    /// CRUD action name.
    pub action_crud_type: String,
    /// Custom action.
    pub action_custom_type: String,
    /// Result name.
    pub action_result: String,
    /// Free-form details.
    pub action_details: String,
    /// Whether the reporter already counted the event.
    pub logger_send_metric: bool,
}

/// Error record.
#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct ErrorRow {
    /// Row id; ignored on insert.
    pub id: i64,
    /// Caller metadata.
    #[sqlx(flatten)]
    pub meta: MetadataColumns,
    /// Reporter-assigned error id.
    pub error_id: String,
    /// gRPC status name.
    pub status: String,
    /// Log level name.
    pub loglevel: String,
    /// Raising gate.
    pub gate: String,
    /// Raising service.
    pub service: String,
    /// Public error key.
    pub public_key: String,
    /// Details safe to return to callers.
    pub public_details: String,
    /// Internal message.
    pub private_message: String,
    /// Internal details.
    pub private_details: String,
    /// Captured backtrace.
    pub stacktrace: String,
}

/// Query record.
#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct QueryRow {
    /// Row id; ignored on insert.
    pub id: i64,
    /// Metadata of the gRPC response that reported the query.
    #[sqlx(flatten)]
    pub meta: MetadataColumns,
    /// Reporter-assigned query id.
    pub query_id: String,
    /// Connection (database alias) the query ran on.
    pub connection: String,
    /// Statement as reported.
    pub raw: String,
    /// Statement with literals replaced.
    pub normalized: String,
    /// Comma-separated tables.
    pub tables: String,
    /// Comma-separated columns.
    pub columns: String,
    /// When the query started.
    pub start_time: DateTime<Utc>,
    /// When the query ended.
    pub end_time: DateTime<Utc>,
}

impl QueryRow {
    /// End minus start. Queries still running at report time end at the
    /// reporting timestamp.
    pub fn reported_duration(&self) -> TimeDelta {
        let min = min_datetime();
        if self.start_time == min {
            return TimeDelta::zero();
        }
        let end = if self.end_time == min || self.end_time > self.meta.meta_reported_timestamp {
            self.meta.meta_reported_timestamp
        } else {
            self.end_time
        };
        if end == min || end < self.start_time {
            return TimeDelta::zero();
        }
        end - self.start_time
    }
}

/// Handle on a stored request, enough for a versioned update.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct RequestHandle {
    /// Row id.
    pub id: i64,
    /// Version observed.
    pub version: i64,
    /// Reporter-side request timestamp.
    pub meta_reported_timestamp: DateTime<Utc>,
}

/// Tables holding request records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTable {
    /// `http_requests`, keyed by the HTTP request id.
    Http,
    /// `grpc_requests`, keyed by the gRPC request id.
    Grpc,
}

impl RequestTable {
    fn table(self) -> &'static str {
        match self {
            RequestTable::Http => "http_requests",
            RequestTable::Grpc => "grpc_requests",
        }
    }

    fn key(self) -> &'static str {
        match self {
            RequestTable::Http => "meta_caller_http_request_id",
            RequestTable::Grpc => "meta_caller_grpc_request_id",
        }
    }
}

/// Log tables a cleanup job can empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTable {
    /// HTTP requests.
    HttpRequests,
    /// gRPC requests.
    GrpcRequests,
    /// Events.
    Events,
    /// Errors.
    Errors,
    /// Queries.
    Queries,
}

impl LogTable {
    /// SQL table name.
    pub fn as_str(self) -> &'static str {
        match self {
            LogTable::HttpRequests => "http_requests",
            LogTable::GrpcRequests => "grpc_requests",
            LogTable::Events => "events",
            LogTable::Errors => "errors",
            LogTable::Queries => "queries",
        }
    }
}

// ============================================================================
// Inserts
// ============================================================================

/// Insert an HTTP request; returns the new row id.
pub async fn insert_http_request(
    pool: &SqlitePool,
    row: &HttpRequestRow,
) -> Result<i64, sqlx::Error> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "INSERT INTO http_requests ({METADATA_COLUMNS}, request_type, language, device_id, \
         language_header, ip, useragent, response_status, response_reported_timestamp, \
         response_logged_timestamp) "
    ));
    builder.push_values(std::iter::once(row), |mut b, row| {
        push_metadata(&mut b, &row.meta);
        b.push_bind(row.request_type.clone())
            .push_bind(row.language.clone())
            .push_bind(row.device_id.clone())
            .push_bind(row.language_header.clone())
            .push_bind(row.ip.clone())
            .push_bind(row.useragent.clone())
            .push_bind(IN_PROGRESS)
            .push_bind(min_datetime())
            .push_bind(min_datetime());
    });
    let result = builder.build().execute(pool).await?;
    Ok(result.last_insert_rowid())
}

/// Insert a gRPC request; returns the new row id.
pub async fn insert_grpc_request(
    pool: &SqlitePool,
    row: &GrpcRequestRow,
) -> Result<i64, sqlx::Error> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "INSERT INTO grpc_requests ({METADATA_COLUMNS}, upstream_request_id, \
         upstream_khaleesi_gate, upstream_khaleesi_service, upstream_grpc_service, \
         upstream_grpc_method, upstream_pod_id, response_status, response_reported_timestamp, \
         response_logged_timestamp) "
    ));
    builder.push_values(std::iter::once(row), |mut b, row| {
        push_metadata(&mut b, &row.meta);
        b.push_bind(row.upstream_request_id.clone())
            .push_bind(row.upstream_khaleesi_gate.clone())
            .push_bind(row.upstream_khaleesi_service.clone())
            .push_bind(row.upstream_grpc_service.clone())
            .push_bind(row.upstream_grpc_method.clone())
            .push_bind(row.upstream_pod_id.clone())
            .push_bind(IN_PROGRESS)
            .push_bind(min_datetime())
            .push_bind(min_datetime());
    });
    let result = builder.build().execute(pool).await?;
    Ok(result.last_insert_rowid())
}

/// Insert an event; returns the new row id.
pub async fn insert_event(pool: &SqlitePool, row: &EventRow) -> Result<i64, sqlx::Error> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "INSERT INTO events ({METADATA_COLUMNS}, event_id, target_type, target_id, \
         target_owner_id, target_owner_type, action_crud_type, action_custom_type, \
         action_result, action_details, logger_send_metric) "
    ));
    builder.push_values(std::iter::once(row), |mut b, row| {
        push_metadata(&mut b, &row.meta);
        b.push_bind(row.event_id.clone())
            .push_bind(row.target_type.clone())
            .push_bind(row.target_id.clone())
            .push_bind(row.target_owner_id.clone())
            .push_bind(row.target_owner_type.clone())
            .push_bind(row.action_crud_type.clone())
            .push_bind(row.action_custom_type.clone())
            .push_bind(row.action_result.clone())
            .push_bind(row.action_details.clone())
            .push_bind(row.logger_send_metric);
    });
    let result = builder.build().execute(pool).await?;
    Ok(result.last_insert_rowid())
}

/// Insert an error; returns the new row id.
pub async fn insert_error(pool: &SqlitePool, row: &ErrorRow) -> Result<i64, sqlx::Error> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "INSERT INTO errors ({METADATA_COLUMNS}, error_id, status, loglevel, gate, service, \
         public_key, public_details, private_message, private_details, stacktrace) "
    ));
    builder.push_values(std::iter::once(row), |mut b, row| {
        push_metadata(&mut b, &row.meta);
        b.push_bind(row.error_id.clone())
            .push_bind(row.status.clone())
            .push_bind(row.loglevel.clone())
            .push_bind(row.gate.clone())
            .push_bind(row.service.clone())
            .push_bind(row.public_key.clone())
            .push_bind(row.public_details.clone())
            .push_bind(row.private_message.clone())
            .push_bind(row.private_details.clone())
            .push_bind(row.stacktrace.clone());
    });
    let result = builder.build().execute(pool).await?;
    Ok(result.last_insert_rowid())
}

/// Insert queries in batches of [`BULK_BATCH_SIZE`]; returns the number inserted.
pub async fn insert_queries(pool: &SqlitePool, rows: &[QueryRow]) -> Result<u64, sqlx::Error> {
    let mut inserted = 0;
    for chunk in rows.chunks(BULK_BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO queries ({METADATA_COLUMNS}, query_id, connection, raw, normalized, \
             tables, columns, start_time, end_time) "
        ));
        builder.push_values(chunk, |mut b, row| {
            push_metadata(&mut b, &row.meta);
            b.push_bind(row.query_id.clone())
                .push_bind(row.connection.clone())
                .push_bind(row.raw.clone())
                .push_bind(row.normalized.clone())
                .push_bind(row.tables.clone())
                .push_bind(row.columns.clone())
                .push_bind(row.start_time)
                .push_bind(row.end_time);
        });
        inserted += builder.build().execute(pool).await?.rows_affected();
    }
    Ok(inserted)
}

// ============================================================================
// Request updates
// ============================================================================

/// Latest in-progress request with the given request id.
pub async fn find_in_progress(
    conn: &mut SqliteConnection,
    table: RequestTable,
    request_id: &str,
) -> Result<Option<RequestHandle>, sqlx::Error> {
    let sql = format!(
        "SELECT id, version, meta_reported_timestamp FROM {} \
         WHERE {} = ? AND response_status = ? ORDER BY id DESC LIMIT 1",
        table.table(),
        table.key()
    );
    sqlx::query_as(&sql)
        .bind(request_id)
        .bind(IN_PROGRESS)
        .fetch_optional(conn)
        .await
}

/// Latest request with the given request id, answered or not.
pub async fn find_request(
    conn: &mut SqliteConnection,
    table: RequestTable,
    request_id: &str,
) -> Result<Option<RequestHandle>, sqlx::Error> {
    let sql = format!(
        "SELECT id, version, meta_reported_timestamp FROM {} WHERE {} = ? ORDER BY id DESC LIMIT 1",
        table.table(),
        table.key()
    );
    sqlx::query_as(&sql)
        .bind(request_id)
        .fetch_optional(conn)
        .await
}

/// Store the response of a request and add `child_nanos` to its child duration.
///
/// Returns false if the row moved past `handle.version` in the meantime.
pub async fn close_request(
    conn: &mut SqliteConnection,
    table: RequestTable,
    handle: &RequestHandle,
    response: &ResponseColumns,
    child_nanos: i64,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET response_status = ?, response_reported_timestamp = ?, \
         response_logged_timestamp = ?, response_logging_errors = ?, \
         child_duration_nanos = child_duration_nanos + ?, version = version + 1 \
         WHERE id = ? AND version = ?",
        table.table()
    );
    let result = sqlx::query(&sql)
        .bind(&response.response_status)
        .bind(response.response_reported_timestamp)
        .bind(response.response_logged_timestamp)
        .bind(&response.response_logging_errors)
        .bind(child_nanos)
        .bind(handle.id)
        .bind(handle.version)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Add `child_nanos` to a request's child duration.
///
/// Returns false if the row moved past `handle.version` in the meantime.
pub async fn add_child_duration(
    conn: &mut SqliteConnection,
    table: RequestTable,
    handle: &RequestHandle,
    child_nanos: i64,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET child_duration_nanos = child_duration_nanos + ?, version = version + 1 \
         WHERE id = ? AND version = ?",
        table.table()
    );
    let result = sqlx::query(&sql)
        .bind(child_nanos)
        .bind(handle.id)
        .bind(handle.version)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

// ============================================================================
// Read side
// ============================================================================

/// A page of HTTP requests, ordered by id.
pub async fn list_http_requests(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
) -> Result<Vec<HttpRequestRow>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM http_requests ORDER BY id LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
}

/// A page of gRPC requests, ordered by id.
pub async fn list_grpc_requests(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
) -> Result<Vec<GrpcRequestRow>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM grpc_requests ORDER BY id LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
}

/// A page of events, ordered by id.
pub async fn list_events(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
) -> Result<Vec<EventRow>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM events ORDER BY id LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
}

/// A page of errors, ordered by id.
pub async fn list_errors(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
) -> Result<Vec<ErrorRow>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM errors ORDER BY id LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
}

/// A page of queries, ordered by id.
pub async fn list_queries(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
) -> Result<Vec<QueryRow>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM queries ORDER BY id LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
}

// ============================================================================
// Cleanup
// ============================================================================

/// Rows of `table` logged before `cutoff`.
pub async fn count_logged_before(
    pool: &SqlitePool,
    table: LogTable,
    cutoff: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE meta_logged_timestamp < ?",
        table.as_str()
    );
    sqlx::query_scalar(&sql).bind(cutoff).fetch_one(pool).await
}

/// Ids of the `limit` oldest rows of `table` logged before `cutoff`.
pub async fn oldest_logged_before(
    pool: &SqlitePool,
    table: LogTable,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    let sql = format!(
        "SELECT id FROM {} WHERE meta_logged_timestamp < ? ORDER BY id LIMIT ?",
        table.as_str()
    );
    sqlx::query_scalar(&sql)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(pool)
        .await
}

/// Delete rows of `table` by id; returns the number deleted.
pub async fn delete_by_ids(
    pool: &SqlitePool,
    table: LogTable,
    ids: &[i64],
) -> Result<u64, sqlx::Error> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("DELETE FROM {} WHERE id IN (", table.as_str()));
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
    Ok(builder.build().execute(pool).await?.rows_affected())
}

// ============================================================================
// Service registry
// ============================================================================

/// A gRPC method with its full naming coordinate.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct MethodRow {
    /// Method row id.
    pub id: i64,
    /// Gate name.
    pub gate: String,
    /// Service name.
    pub service: String,
    /// gRPC service name.
    pub grpc_service: String,
    /// gRPC method name.
    pub grpc_method: String,
}

/// A call edge between two methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct CallRow {
    /// Calling method.
    pub caller_id: i64,
    /// Called method.
    pub called_id: i64,
}

async fn get_or_create(
    conn: &mut SqliteConnection,
    insert: &str,
    select: &str,
    parent: Option<i64>,
    name: &str,
) -> Result<(i64, bool), sqlx::Error> {
    let mut query = sqlx::query(insert);
    if let Some(parent) = parent {
        query = query.bind(parent);
    }
    let created = query.bind(name).execute(&mut *conn).await?.rows_affected() == 1;

    let mut query = sqlx::query_scalar(select);
    if let Some(parent) = parent {
        query = query.bind(parent);
    }
    let id = query.bind(name).fetch_one(&mut *conn).await?;
    Ok((id, created))
}

/// Id of the gate `name`, and whether it was just created.
pub async fn get_or_create_gate(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<(i64, bool), sqlx::Error> {
    get_or_create(
        conn,
        "INSERT INTO khaleesi_gates (name) VALUES (?) ON CONFLICT (name) DO NOTHING",
        "SELECT id FROM khaleesi_gates WHERE name = ?",
        None,
        name,
    )
    .await
}

/// Id of the service `name` within `gate_id`, and whether it was just created.
pub async fn get_or_create_service(
    conn: &mut SqliteConnection,
    gate_id: i64,
    name: &str,
) -> Result<(i64, bool), sqlx::Error> {
    get_or_create(
        conn,
        "INSERT INTO khaleesi_services (gate_id, name) VALUES (?, ?) \
         ON CONFLICT (gate_id, name) DO NOTHING",
        "SELECT id FROM khaleesi_services WHERE gate_id = ? AND name = ?",
        Some(gate_id),
        name,
    )
    .await
}

/// Id of the gRPC service `name` within `service_id`, and whether it was just created.
pub async fn get_or_create_grpc_service(
    conn: &mut SqliteConnection,
    service_id: i64,
    name: &str,
) -> Result<(i64, bool), sqlx::Error> {
    get_or_create(
        conn,
        "INSERT INTO grpc_services (service_id, name) VALUES (?, ?) \
         ON CONFLICT (service_id, name) DO NOTHING",
        "SELECT id FROM grpc_services WHERE service_id = ? AND name = ?",
        Some(service_id),
        name,
    )
    .await
}

/// Id of the gRPC method `name` within `grpc_service_id`, and whether it was just created.
pub async fn get_or_create_grpc_method(
    conn: &mut SqliteConnection,
    grpc_service_id: i64,
    name: &str,
) -> Result<(i64, bool), sqlx::Error> {
    get_or_create(
        conn,
        "INSERT INTO grpc_methods (grpc_service_id, name) VALUES (?, ?) \
         ON CONFLICT (grpc_service_id, name) DO NOTHING",
        "SELECT id FROM grpc_methods WHERE grpc_service_id = ? AND name = ?",
        Some(grpc_service_id),
        name,
    )
    .await
}

/// Record the edge `caller_id → called_id`; returns whether it was new.
pub async fn get_or_create_call(
    conn: &mut SqliteConnection,
    caller_id: i64,
    called_id: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO grpc_calls (caller_id, called_id) VALUES (?, ?) \
         ON CONFLICT (caller_id, called_id) DO NOTHING",
    )
    .bind(caller_id)
    .bind(called_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Every method with its gate, service and gRPC service names.
pub async fn load_methods(pool: &SqlitePool) -> Result<Vec<MethodRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT m.id, g.name AS gate, s.name AS service, gs.name AS grpc_service,
               m.name AS grpc_method
        FROM grpc_methods m
        JOIN grpc_services gs ON gs.id = m.grpc_service_id
        JOIN khaleesi_services s ON s.id = gs.service_id
        JOIN khaleesi_gates g ON g.id = s.gate_id
        ORDER BY m.id
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Every call edge.
pub async fn load_calls(pool: &SqlitePool) -> Result<Vec<CallRow>, sqlx::Error> {
    sqlx::query_as("SELECT caller_id, called_id FROM grpc_calls ORDER BY id")
        .fetch_all(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrations::run(&pool).await.unwrap();
        pool
    }

    fn meta(grpc_request_id: &str) -> MetadataColumns {
        MetadataColumns {
            meta_caller_http_request_id: "http-1".to_string(),
            meta_caller_grpc_request_id: grpc_request_id.to_string(),
            meta_user_type: "USER".to_string(),
            meta_reported_timestamp: Utc::now(),
            meta_logged_timestamp: Utc::now(),
            ..Default::default()
        }
    }

    #[test]
    fn test_in_progress_durations_are_zero() {
        let meta = meta("g1");
        let response = ResponseColumns::default();

        assert!(response.is_in_progress());
        assert!(response.reported_duration(&meta).is_zero());
        assert!(response.logged_duration(&meta).is_zero());
        assert_eq!(response.child_duration_relative(&meta), 0.0);
    }

    #[test]
    fn test_closed_durations() {
        let meta = meta("g1");
        let response = ResponseColumns {
            response_status: "OK".to_string(),
            response_reported_timestamp: meta.meta_reported_timestamp + TimeDelta::seconds(2),
            response_logged_timestamp: meta.meta_logged_timestamp + TimeDelta::seconds(4),
            child_duration_nanos: 1_000_000_000,
            response_logging_errors: String::new(),
        };

        assert_eq!(response.reported_duration(&meta), TimeDelta::seconds(2));
        assert_eq!(response.logged_duration(&meta), TimeDelta::seconds(4));
        assert_eq!(response.child_duration_relative(&meta), 0.25);
        assert!(!response.to_proto(&meta).in_progress);
    }

    #[test]
    fn test_running_query_ends_at_report_time() {
        let reported = Utc::now();
        let query = QueryRow {
            meta: MetadataColumns {
                meta_reported_timestamp: reported,
                ..Default::default()
            },
            start_time: reported - TimeDelta::milliseconds(30),
            end_time: crate::parse_util::max_datetime(),
            ..Default::default()
        };

        assert_eq!(query.reported_duration(), TimeDelta::milliseconds(30));
    }

    #[tokio::test]
    async fn test_close_request_is_versioned() {
        let pool = pool().await;
        insert_grpc_request(
            &pool,
            &GrpcRequestRow {
                meta: meta("g1"),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let handle = find_in_progress(&mut conn, RequestTable::Grpc, "g1")
            .await
            .unwrap()
            .unwrap();
        let response = ResponseColumns {
            response_status: "OK".to_string(),
            ..Default::default()
        };

        assert!(close_request(&mut conn, RequestTable::Grpc, &handle, &response, 5).await.unwrap());
        assert!(!close_request(&mut conn, RequestTable::Grpc, &handle, &response, 5).await.unwrap());
        assert!(find_in_progress(&mut conn, RequestTable::Grpc, "g1").await.unwrap().is_none());
        drop(conn);

        let rows = list_grpc_requests(&pool, 10, 0).await.unwrap();
        assert_eq!(rows[0].response.response_status, "OK");
        assert_eq!(rows[0].response.child_duration_nanos, 5);
        assert_eq!(rows[0].version, 1);
        assert_eq!(rows[0].meta.meta_user_type, "USER");
    }

    #[tokio::test]
    async fn test_bulk_queries_and_cleanup() {
        let pool = pool().await;
        let old = Utc::now() - TimeDelta::hours(2);
        let rows: Vec<QueryRow> = (0..1500)
            .map(|i| QueryRow {
                meta: MetadataColumns {
                    meta_logged_timestamp: if i % 2 == 0 { old } else { Utc::now() },
                    ..meta("g1")
                },
                query_id: format!("q{i}"),
                start_time: old,
                end_time: old,
                ..Default::default()
            })
            .collect();

        assert_eq!(insert_queries(&pool, &rows).await.unwrap(), 1500);

        let cutoff = Utc::now() - TimeDelta::hours(1);
        assert_eq!(count_logged_before(&pool, LogTable::Queries, cutoff).await.unwrap(), 750);
        let ids = oldest_logged_before(&pool, LogTable::Queries, cutoff, 100).await.unwrap();
        assert_eq!(ids.len(), 100);
        assert_eq!(delete_by_ids(&pool, LogTable::Queries, &ids).await.unwrap(), 100);
        assert_eq!(count_logged_before(&pool, LogTable::Queries, cutoff).await.unwrap(), 650);
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let (gate, created) = get_or_create_gate(&mut conn, "core").await.unwrap();
        assert!(created);
        assert_eq!(get_or_create_gate(&mut conn, "core").await.unwrap(), (gate, false));

        let (service, _) = get_or_create_service(&mut conn, gate, "sawmill").await.unwrap();
        let (grpc_service, _) = get_or_create_grpc_service(&mut conn, service, "Lumberjack")
            .await
            .unwrap();
        let (a, _) = get_or_create_grpc_method(&mut conn, grpc_service, "LogEvent").await.unwrap();
        let (b, _) = get_or_create_grpc_method(&mut conn, grpc_service, "LogError").await.unwrap();

        assert!(get_or_create_call(&mut conn, a, b).await.unwrap());
        assert!(!get_or_create_call(&mut conn, a, b).await.unwrap());
        drop(conn);

        let methods = load_methods(&pool).await.unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].grpc_service, "Lumberjack");
        assert_eq!(load_calls(&pool).await.unwrap(), vec![CallRow { caller_id: a, called_id: b }]);
    }
}
