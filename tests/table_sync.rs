//! Table sync: the HTTP listener in-process and the push loop end to end.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

use edged::listen::{router, TableListener};
use edged::push::send_update;
use edged::runtime::StaticServices;
use edged::{Edge, EdgeSite, Forwarder, Service, ServiceTable, ServiceTableUpdate};

const ADD_SVC_A: &str = r#"{"Meta":{"IP":"10.0.0.2","GeoCoords":{"Lat":1,"Lon":2}},"Event":{"Type":"add","Service":{"name":"svcA"}}}"#;
const DELETE_SVC_A: &str = r#"{"Meta":{"IP":"10.0.0.2","GeoCoords":{"Lat":1,"Lon":2}},"Event":{"Type":"delete","Service":{"name":"svcA"}}}"#;

fn post(body: &'static str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn svc_a() -> Service {
    Service::new(json!({ "name": "svcA" }))
}

/// Poll `site`'s entry in `table` until `check` holds or `limit` passes.
async fn wait_for(
    table: &ServiceTable,
    site: &EdgeSite,
    limit: Duration,
    check: impl Fn(Option<HashSet<Service>>) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check(table.services(site).await) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn add_event_is_applied() {
    let table = ServiceTable::new();
    let resp = router(table.clone()).oneshot(post(ADD_SVC_A)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let services = table.services_by_ip("10.0.0.2").await.unwrap();
    assert!(services.contains(&svc_a()));
}

#[tokio::test]
async fn delete_event_leaves_empty_site() {
    let table = ServiceTable::new();
    let app = router(table.clone());

    let resp = app.clone().oneshot(post(ADD_SVC_A)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = app.oneshot(post(DELETE_SVC_A)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(table.services_by_ip("10.0.0.2").await, Some(HashSet::new()));
}

#[tokio::test]
async fn malformed_body_is_rejected_without_changes() {
    let table = ServiceTable::new();
    let app = router(table.clone());
    app.clone().oneshot(post(ADD_SVC_A)).await.unwrap();
    let before = table.snapshot().await;

    for body in ["{not json", r#"{"Meta":{"IP":"10.0.0.2"}}"#, r#"{"Event":{"Type":"rename"}}"#] {
        let resp = app.clone().oneshot(post(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body {}", body);
    }
    assert_eq!(table.snapshot().await, before);
}

#[tokio::test]
async fn large_update_is_accepted_whole() {
    let table = ServiceTable::new();
    let blob = "x".repeat(3 * 1024 * 1024);
    let service = Service::new(json!({ "name": "big", "blob": blob }));
    let update = ServiceTableUpdate::add(EdgeSite::new("10.0.0.3", 0.0, 0.0), service.clone());
    let body = serde_json::to_vec(&update).unwrap();

    let resp = router(table.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let services = table.services_by_ip("10.0.0.3").await.unwrap();
    assert!(services.contains(&service));
}

#[tokio::test]
async fn only_post_is_accepted() {
    let app = router(ServiceTable::new());
    let resp = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn push_over_loopback() {
    let table = ServiceTable::new();
    let mut listener = TableListener::bind("127.0.0.1:0".parse().unwrap(), table.clone())
        .await
        .unwrap();
    let site = EdgeSite::new("10.0.0.2", 1.0, 2.0);

    send_update(
        listener.local_addr(),
        &ServiceTableUpdate::add(site.clone(), svc_a()),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    assert!(table.services(&site).await.unwrap().contains(&svc_a()));

    send_update(
        listener.local_addr(),
        &ServiceTableUpdate::delete(site.clone(), svc_a()),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    assert_eq!(table.services(&site).await, Some(HashSet::new()));

    listener.stop().await;
}

#[tokio::test]
async fn edges_replicate_local_services() {
    // Receiving edge.
    let receiver = Edge::new(EdgeSite::new("10.0.0.9", 0.0, 0.0))
        .with_push_addr("127.0.0.1:0".parse().unwrap(), 0);
    let receiver_addr = receiver.on_startup().await.unwrap();

    // Sending edge: its only upstream is the receiver's host.
    let source = StaticServices::new([svc_a()]);
    let upstream: SocketAddr = "127.0.0.1:53".parse().unwrap();
    let sender_site = EdgeSite::new("10.0.0.2", 1.0, 2.0);
    let sender = Edge::new(sender_site.clone())
        .with_forwarder(Forwarder::from_addrs(&[upstream]).with_health_check(Duration::ZERO))
        .with_source(Arc::new(source.clone()))
        .with_intervals(Duration::from_millis(50), Duration::from_millis(100))
        .with_push_addr("127.0.0.1:0".parse().unwrap(), receiver_addr.port());
    sender.on_startup().await.unwrap();

    // The sender reads its own services immediately.
    let read = wait_for(sender.table(), &sender_site, Duration::from_secs(2), |s| s.is_some()).await;
    assert!(read, "sender never read its own services");

    let arrived = wait_for(receiver.table(), &sender_site, Duration::from_secs(3), |s| {
        s.is_some_and(|s| s.contains(&svc_a()))
    })
    .await;
    assert!(arrived, "service never reached the receiving edge");

    // Withdrawing the service locally propagates a delete.
    source.set([]);
    let withdrawn = wait_for(receiver.table(), &sender_site, Duration::from_secs(3), |s| {
        s == Some(HashSet::new())
    })
    .await;
    assert!(withdrawn, "deletion never reached the receiving edge");

    sender.on_shutdown().await;
    receiver.on_shutdown().await;
}

#[tokio::test]
async fn shutdown_without_startup() {
    let edge = Edge::new(EdgeSite::new("10.0.0.1", 0.0, 0.0))
        .with_forwarder(Forwarder::from_addrs(&["127.0.0.1:53".parse().unwrap()]));
    edge.on_shutdown().await;
    edge.close().await;
}
