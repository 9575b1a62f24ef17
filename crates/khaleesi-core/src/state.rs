// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ambient per-request state.
//!
//! Each RPC and each batch job runs inside its own task-local [`RequestState`].
//! Code outside any scope observes the all-UNKNOWN default and writes are dropped.
//!
//! ```ignore
//! state::scope(async {
//!     state::update(|s| s.request.grpc_method = "LogEvent".to_string());
//!     let _query = state::log_query("sawmill", "SELECT 1");
//! })
//! .await;
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use khaleesi_proto::common_proto::user::UserType;

/// Placeholder for every field that has not been populated.
pub const UNKNOWN: &str = "UNKNOWN";

tokio::task_local! {
    static STATE: RefCell<RequestState>;
}

/// One SQL statement executed while handling a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Unique id of the execution.
    pub id: String,
    /// Database connection alias.
    pub connection: String,
    /// Raw SQL.
    pub raw: String,
    /// When execution started.
    pub start: DateTime<Utc>,
    /// When execution ended; `DateTime::<Utc>::MAX_UTC` while still running.
    pub end: DateTime<Utc>,
}

/// Identity of the request being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Correlation id of the originating HTTP request.
    pub http_request_id: String,
    /// Id of this gRPC request.
    pub grpc_request_id: String,
    /// gRPC service being executed.
    pub grpc_service: String,
    /// gRPC method being executed.
    pub grpc_method: String,
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self {
            http_request_id: UNKNOWN.to_string(),
            grpc_request_id: UNKNOWN.to_string(),
            grpc_service: UNKNOWN.to_string(),
            grpc_method: UNKNOWN.to_string(),
        }
    }
}

/// User on whose behalf the request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// User id.
    pub id: String,
    /// Kind of user.
    pub user_type: UserType,
}

impl Default for UserInfo {
    fn default() -> Self {
        Self {
            id: UNKNOWN.to_string(),
            user_type: UserType::Unknown,
        }
    }
}

/// Request-scoped record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestState {
    /// Request identity.
    pub request: RequestInfo,
    /// Acting user.
    pub user: UserInfo,
    /// Executed SQL statements, grouped by connection.
    pub queries: BTreeMap<String, Vec<Query>>,
}

impl RequestState {
    /// Back to the all-UNKNOWN default.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Adopt another request's identity, user and queries.
    pub fn copy_from(&mut self, other: &RequestState) {
        self.request = other.request.clone();
        self.user = other.user.clone();
        self.queries = other.queries.clone();
    }

    /// Number of recorded queries across all connections.
    pub fn query_count(&self) -> usize {
        self.queries.values().map(Vec::len).sum()
    }
}

/// Run `future` inside a fresh state scope.
pub async fn scope<F: Future>(future: F) -> F::Output {
    STATE.scope(RefCell::new(RequestState::default()), future).await
}

/// Run `future` inside a scope seeded with a copy of `snapshot`.
pub async fn scope_with<F: Future>(snapshot: &RequestState, future: F) -> F::Output {
    let mut state = RequestState::default();
    state.copy_from(snapshot);
    STATE.scope(RefCell::new(state), future).await
}

/// Whether the caller runs inside a state scope.
pub fn in_scope() -> bool {
    STATE.try_with(|_| ()).is_ok()
}

/// Copy of the current state, or the default outside any scope.
pub fn snapshot() -> RequestState {
    STATE
        .try_with(|state| state.borrow().clone())
        .unwrap_or_default()
}

/// Copy of the current request identity.
pub fn current_request() -> RequestInfo {
    STATE
        .try_with(|state| state.borrow().request.clone())
        .unwrap_or_default()
}

/// Copy of the current user.
pub fn current_user() -> UserInfo {
    STATE
        .try_with(|state| state.borrow().user.clone())
        .unwrap_or_default()
}

/// Mutate the current state. Returns false outside any scope.
pub fn update(f: impl FnOnce(&mut RequestState)) -> bool {
    STATE.try_with(|state| f(&mut state.borrow_mut())).is_ok()
}

/// Reset the current state.
pub fn reset() {
    update(RequestState::reset);
}

/// Record the start of a query; the returned guard records its end.
pub fn log_query(connection: &str, raw: &str) -> QueryLog {
    let id = uuid::Uuid::new_v4().to_string();
    let query = Query {
        id: id.clone(),
        connection: connection.to_string(),
        raw: raw.to_string(),
        start: Utc::now(),
        end: DateTime::<Utc>::MAX_UTC,
    };
    let recorded = update(|state| {
        state
            .queries
            .entry(connection.to_string())
            .or_default()
            .push(query)
    });
    QueryLog {
        connection: connection.to_string(),
        id,
        recorded,
    }
}

/// Guard for a query in flight. Dropping it marks the query as finished.
#[derive(Debug)]
pub struct QueryLog {
    connection: String,
    id: String,
    recorded: bool,
}

impl QueryLog {
    /// Mark the query as finished now.
    pub fn finish(self) {}
}

impl Drop for QueryLog {
    fn drop(&mut self) {
        if !self.recorded {
            return;
        }
        let end = Utc::now();
        update(|state| {
            if let Some(query) = state
                .queries
                .get_mut(&self.connection)
                .and_then(|queries| queries.iter_mut().find(|q| q.id == self.id))
            {
                query.end = end;
            }
        });
    }
}
