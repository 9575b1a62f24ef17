// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Paging through stored records with the `Sawyer` service.

mod common;

use chrono::Utc;
use common::{TestContext, event_request, front, metadata};
use khaleesi_core::metadata::to_timestamp;
use khaleesi_proto::sawmill_proto::sawyer_server::Sawyer;
use khaleesi_proto::sawmill_proto::{
    GrpcRequest, GrpcResponseRequest, LogFilter, Query, Response,
};
use sawmill::handlers::SawyerService;
use tonic::Request;

fn sawyer(ctx: &TestContext) -> SawyerService {
    SawyerService::new(ctx.sawmill.chain(), ctx.pool.clone())
}

fn filter(page: u32, page_size: u32) -> Request<LogFilter> {
    Request::new(LogFilter {
        request_metadata: Some(metadata(Some("h0"), front(), Utc::now())),
        page,
        page_size,
    })
}

#[tokio::test]
async fn test_events_are_paged() {
    let ctx = TestContext::new().await;
    let mut ids = Vec::new();
    for _ in 0..5 {
        let request = event_request("Hit recorded.");
        ids.push(request.event.as_ref().unwrap().id.clone());
        ctx.sawmill.ingester().log_event(request).await.unwrap();
    }

    let page = sawyer(&ctx)
        .get_events(filter(2, 2))
        .await
        .unwrap()
        .into_inner();
    let page_ids: Vec<String> = page
        .events
        .iter()
        .map(|event| event.event.as_ref().unwrap().id.clone())
        .collect();
    assert_eq!(page_ids, ids[2..4].to_vec());

    let last = sawyer(&ctx)
        .get_events(filter(3, 2))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(last.events.len(), 1);

    let all = sawyer(&ctx)
        .get_events(filter(0, 0))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(all.events.len(), 5);
    let logging = all.events[0].logging.as_ref().unwrap();
    assert_eq!(logging.logging_errors, "");
    assert!(logging.logged_timestamp.is_some());
}

#[tokio::test]
async fn test_queries_carry_their_analysis() {
    let ctx = TestContext::new().await;
    let now = Utc::now();
    let caller = front();
    ctx.sawmill
        .ingester()
        .log_grpc_request(GrpcRequest {
            request_metadata: Some(metadata(Some("h1"), caller.clone(), now)),
            upstream_request: None,
        })
        .await
        .unwrap();
    ctx.sawmill
        .ingester()
        .log_grpc_response(GrpcResponseRequest {
            request_metadata: Some(metadata(Some("h1"), caller, now)),
            response: Some(Response {
                status: "OK".to_string(),
                timestamp: Some(to_timestamp(now)),
            }),
            queries: vec![Query {
                id: "q1".to_string(),
                connection: "default".to_string(),
                raw: "UPDATE hits SET count = count + 1 WHERE id = 'x'".to_string(),
                start: Some(to_timestamp(now)),
                end: Some(to_timestamp(now)),
            }],
        })
        .await
        .unwrap();

    let queries = sawyer(&ctx)
        .get_queries(filter(1, 10))
        .await
        .unwrap()
        .into_inner()
        .queries;

    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].tables, vec!["hits"]);
    assert_eq!(queries[0].columns, vec!["count"]);
    assert_eq!(
        queries[0].normalized,
        "UPDATE hits SET count = count + ? WHERE id = ?"
    );
    assert_eq!(queries[0].reported_duration_seconds, 0.0);
}

#[tokio::test]
async fn test_grpc_requests_include_response_metadata() {
    let ctx = TestContext::new().await;

    let requests = sawyer(&ctx)
        .get_grpc_requests(filter(1, 10))
        .await
        .unwrap()
        .into_inner()
        .requests;
    // Only the request just finished listing itself exists, still in progress.
    assert_eq!(requests.len(), 1);
    let response = requests[0].response.as_ref().unwrap();
    assert!(response.in_progress);
    assert_eq!(response.status, "IN_PROGRESS");

    let requests = sawyer(&ctx)
        .get_grpc_requests(filter(1, 10))
        .await
        .unwrap()
        .into_inner()
        .requests;
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].response.as_ref().unwrap().in_progress);
}
