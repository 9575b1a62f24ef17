// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service registry bootstrap and the `Forester` service.

mod common;

use chrono::Utc;
use common::{TestContext, metadata};
use khaleesi_proto::common_proto::{EmptyRequest, GrpcCaller};
use khaleesi_proto::sawmill_proto::forester_server::Forester;
use sawmill::db;
use sawmill::handlers::ForesterService;
use sawmill::service_registry::MethodKey;
use sqlx::SqlitePool;
use tonic::Request;

fn key(gate: &str, service: &str, grpc_service: &str, grpc_method: &str) -> MethodKey {
    MethodKey {
        gate: gate.to_string(),
        service: service.to_string(),
        grpc_service: grpc_service.to_string(),
        grpc_method: grpc_method.to_string(),
    }
}

fn caller(key: &MethodKey) -> GrpcCaller {
    GrpcCaller {
        request_id: "r1".to_string(),
        pod_id: "pod".to_string(),
        ..key.to_caller()
    }
}

/// Two gates, three services, four gRPC services, five methods and `m1 → m2`.
async fn preload(pool: &SqlitePool) {
    let mut conn = pool.acquire().await.unwrap();

    let (gate_a, _) = db::get_or_create_gate(&mut conn, "a").await.unwrap();
    let (gate_b, _) = db::get_or_create_gate(&mut conn, "b").await.unwrap();
    let (s1, _) = db::get_or_create_service(&mut conn, gate_a, "s1").await.unwrap();
    let (s2, _) = db::get_or_create_service(&mut conn, gate_a, "s2").await.unwrap();
    let (s3, _) = db::get_or_create_service(&mut conn, gate_b, "s3").await.unwrap();
    let (g1, _) = db::get_or_create_grpc_service(&mut conn, s1, "G1").await.unwrap();
    let (g2, _) = db::get_or_create_grpc_service(&mut conn, s1, "G2").await.unwrap();
    let (g3, _) = db::get_or_create_grpc_service(&mut conn, s2, "G3").await.unwrap();
    let (g4, _) = db::get_or_create_grpc_service(&mut conn, s3, "G4").await.unwrap();
    let (m1, _) = db::get_or_create_grpc_method(&mut conn, g1, "m1").await.unwrap();
    let (m2, _) = db::get_or_create_grpc_method(&mut conn, g1, "m2").await.unwrap();
    db::get_or_create_grpc_method(&mut conn, g2, "m3").await.unwrap();
    db::get_or_create_grpc_method(&mut conn, g3, "m4").await.unwrap();
    db::get_or_create_grpc_method(&mut conn, g4, "m5").await.unwrap();

    assert!(db::get_or_create_call(&mut conn, m1, m2).await.unwrap());
    assert!(!db::get_or_create_call(&mut conn, m1, m2).await.unwrap());
}

#[tokio::test]
async fn test_registry_bootstraps_from_database() {
    let ctx = TestContext::new().await;
    preload(&ctx.pool).await;

    ctx.sawmill.registry().reload().await.unwrap();

    let tree = ctx.sawmill.registry().snapshot();
    assert_eq!(tree.method_count(), 5);
    assert_eq!(tree.services().len(), 3);

    let m1 = key("a", "s1", "G1", "m1");
    let m2 = key("a", "s1", "G1", "m2");
    assert!(tree.method(&m1).unwrap().calls.contains(&m2));
    assert!(tree.method(&m2).unwrap().called_by.contains(&m1));

    // Methods without edges are loaded too.
    for isolated in [
        key("a", "s1", "G2", "m3"),
        key("a", "s2", "G3", "m4"),
        key("b", "s3", "G4", "m5"),
    ] {
        let node = tree.method(&isolated).unwrap();
        assert!(node.calls.is_empty());
        assert!(node.called_by.is_empty());
    }
}

#[tokio::test]
async fn test_known_calls_are_not_duplicated() {
    let ctx = TestContext::new().await;
    preload(&ctx.pool).await;
    let registry = ctx.sawmill.registry();
    registry.reload().await.unwrap();

    let m1 = key("a", "s1", "G1", "m1");
    let m2 = key("a", "s1", "G1", "m2");
    registry.add_call(&caller(&m1), &caller(&m2)).await.unwrap();

    assert_eq!(db::load_calls(&ctx.pool).await.unwrap().len(), 1);

    let m5 = key("b", "s3", "G4", "m5");
    registry.add_call(&caller(&m2), &caller(&m5)).await.unwrap();

    assert_eq!(db::load_calls(&ctx.pool).await.unwrap().len(), 2);
    assert!(registry.snapshot().method(&m5).unwrap().called_by.contains(&m2));
}

#[tokio::test]
async fn test_get_service_call_data_lists_methods_of_the_caller() {
    let ctx = TestContext::new().await;
    preload(&ctx.pool).await;
    ctx.sawmill.registry().reload().await.unwrap();
    let forester = ForesterService::new(ctx.sawmill.chain(), ctx.sawmill.registry().clone());

    let m1 = key("a", "s1", "G1", "m1");
    let call_data = forester
        .get_service_call_data(Request::new(EmptyRequest {
            request_metadata: Some(metadata(Some("h0"), caller(&m1), Utc::now())),
        }))
        .await
        .unwrap()
        .into_inner();

    let methods: Vec<String> = call_data
        .call_list
        .iter()
        .map(|data| data.call.as_ref().unwrap().grpc_method.clone())
        .collect();
    assert_eq!(methods, vec!["m1", "m2", "m3"]);

    let m1_data = &call_data.call_list[0];
    assert!(m1_data.calls.iter().any(|called| called.grpc_method == "m2"));
    // The request itself registered m1 as a caller of sawmill.
    assert!(
        m1_data
            .calls
            .iter()
            .any(|called| called.khaleesi_service == "sawmill"
                && called.grpc_method == "GetServiceCallData")
    );
    assert!(m1_data.called_by.is_empty());

    let m2_data = &call_data.call_list[1];
    assert_eq!(m2_data.called_by.len(), 1);
    assert_eq!(m2_data.called_by[0].grpc_method, "m1");
}

#[tokio::test]
async fn test_unknown_service_is_registered_on_request() {
    let ctx = TestContext::new().await;
    let forester = ForesterService::new(ctx.sawmill.chain(), ctx.sawmill.registry().clone());

    let fresh = key("c", "new", "Fresh", "Start");
    let call_data = forester
        .get_service_call_data(Request::new(EmptyRequest {
            request_metadata: Some(metadata(Some("h0"), caller(&fresh), Utc::now())),
        }))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(call_data.call_list.len(), 1);
    assert!(ctx.sawmill.registry().snapshot().contains(&fresh));
}
