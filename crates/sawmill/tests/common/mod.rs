// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for sawmill integration tests.
//!
//! Provides TestContext: a migrated in-memory SQLite database and a [`Sawmill`]
//! running on it, plus builders for well-formed records.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use khaleesi_core::config::KhaleesiSettings;
use khaleesi_core::metadata::to_timestamp;
use khaleesi_proto::common_proto::{GrpcCaller, HttpCaller, RequestMetadata, User, user::UserType};
use khaleesi_proto::sawmill_proto::event::{Action, ResultType, Target, action::ActionType};
use khaleesi_proto::sawmill_proto::{Event, EventRequest};
use sawmill::Sawmill;

/// Test context with a migrated database and the sink on top of it.
pub struct TestContext {
    pub pool: SqlitePool,
    pub settings: Arc<KhaleesiSettings>,
    pub sawmill: Sawmill,
}

impl TestContext {
    /// Create a new test context for `core.sawmill`.
    pub async fn new() -> Self {
        Self::with_settings(KhaleesiSettings::for_service("core", "sawmill")).await
    }

    /// Create a new test context with custom settings.
    pub async fn with_settings(settings: KhaleesiSettings) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory database");
        sawmill::migrations::run(&pool)
            .await
            .expect("sawmill migrations");

        let settings = Arc::new(settings);
        let sawmill = Sawmill::new(pool.clone(), settings.clone()).expect("sawmill");

        Self {
            pool,
            settings,
            sawmill,
        }
    }
}

/// The `gw.front` caller used as upstream in most tests.
pub fn front() -> GrpcCaller {
    GrpcCaller {
        request_id: "r1".to_string(),
        khaleesi_gate: "gw".to_string(),
        khaleesi_service: "front".to_string(),
        grpc_service: "Front".to_string(),
        grpc_method: "Hit".to_string(),
        pod_id: "front-pod".to_string(),
    }
}

/// Metadata of a request sent by `caller` on behalf of user `u1`.
pub fn metadata(
    http_request_id: Option<&str>,
    caller: GrpcCaller,
    at: DateTime<Utc>,
) -> RequestMetadata {
    RequestMetadata {
        http_caller: http_request_id.map(|request_id| HttpCaller {
            request_id: request_id.to_string(),
            site: "gw".to_string(),
            path: "/hit".to_string(),
            pod_id: "front-pod".to_string(),
        }),
        grpc_caller: Some(caller),
        user: Some(User {
            id: "u1".to_string(),
            r#type: UserType::User as i32,
        }),
        timestamp: Some(to_timestamp(at)),
    }
}

/// A complete event request as `gw.front` would send it.
pub fn event_request(details: &str) -> EventRequest {
    let metadata = metadata(Some("h0"), front(), Utc::now());
    EventRequest {
        request_metadata: Some(metadata.clone()),
        event: Some(Event {
            id: uuid::Uuid::new_v4().to_string(),
            request_metadata: Some(metadata),
            target: Some(Target {
                r#type: "gw.front.hit".to_string(),
                id: "hit-1".to_string(),
                owner: Some(User {
                    id: "u1".to_string(),
                    r#type: UserType::User as i32,
                }),
            }),
            action: Some(Action {
                crud_type: ActionType::Create as i32,
                custom_type: String::new(),
                result: ResultType::Success as i32,
                details: details.to_string(),
            }),
            logger_send_metric: false,
        }),
    }
}
