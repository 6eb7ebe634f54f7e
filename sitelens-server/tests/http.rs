use std::time::Duration;

use axum::http::StatusCode;
use serde_json::Value;

use sitelens_core::RouteId;
use sitelens_core::testing::ScriptedAuditEngine;
use sitelens_server::routes::paths;

mod common;
use common::{finished_app, site};

fn paths_of(reports: &Value) -> Vec<String> {
    reports
        .as_array()
        .unwrap()
        .iter()
        .map(|report| report["route"]["path"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn reports_lists_every_route_in_discovery_order() {
    let app = finished_app(site(&["/", "/about", "/blog"]), ScriptedAuditEngine::new(), |_| {}).await;

    let response = app.server.get(paths::REPORTS).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(paths_of(&body), vec!["/", "/about", "/blog"]);
    assert!(
        body.as_array()
            .unwrap()
            .iter()
            .all(|report| report["score"]["categories"]["performance"] == 0.9)
    );
}

#[tokio::test]
async fn single_report_by_id() {
    let app = finished_app(site(&["/", "/about"]), ScriptedAuditEngine::new(), |_| {}).await;
    let id = RouteId::from_path("/about");

    let response = app.server.get(&paths::report(id.as_str())).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["route"]["id"], id.as_str());
    assert_eq!(body["route"]["path"], "/about");

    let unknown = RouteId::from_path("/nowhere");
    app.server
        .get(&paths::report(unknown.as_str()))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    app.server
        .get(&paths::report("not-an-id"))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn rescan_route_runs_the_audit_again() {
    let audit = ScriptedAuditEngine::new();
    let app = finished_app(site(&["/", "/about"]), audit, |_| {}).await;
    let id = RouteId::from_path("/about");
    let before = app.runtime.report(&id).unwrap().audited_at.unwrap();
    assert_eq!(app.audit.calls("/about"), 1);

    let response = app.server.post(&paths::rescan_route(id.as_str())).await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["route"]["path"], "/about");

    app.wait_until_idle().await;
    let after = app.runtime.report(&id).unwrap();
    assert!(after.is_complete());
    assert!(!after.from_cache);
    assert!(after.audited_at.unwrap() > before);
    assert_eq!(app.audit.calls("/about"), 2);
    assert_eq!(app.audit.calls("/"), 1);
}

#[tokio::test]
async fn rescan_of_unknown_route_is_not_found() {
    let app = finished_app(site(&["/"]), ScriptedAuditEngine::new(), |_| {}).await;
    let unknown = RouteId::from_path("/missing");

    let response = app.server.post(&paths::rescan_route(unknown.as_str())).await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["error"]["status"], 404);
}

#[tokio::test]
async fn rescan_all_accepts_every_idle_route() {
    let app = finished_app(site(&["/", "/about", "/blog"]), ScriptedAuditEngine::new(), |_| {}).await;

    let response = app.server.post(paths::RESCAN_ALL).await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body.as_array().unwrap().len(), 3);

    app.wait_until_idle().await;
    assert_eq!(app.audit.total_calls(), 6);
}

#[tokio::test]
async fn scan_meta_reports_means_and_budget() {
    let audit = ScriptedAuditEngine::new().with_scores(
        "/about",
        &[
            ("performance", 0.7),
            ("accessibility", 1.0),
            ("best-practices", 1.0),
            ("seo", 1.0),
        ],
    );
    let app = finished_app(site(&["/", "/about"]), audit, |_| {}).await;

    let response = app.server.get(paths::SCAN_META).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["site"], "https://example.com");
    assert_eq!(body["routeCount"], 2);
    assert_eq!(body["categoryMeans"]["performance"], 80);
    assert_eq!(body["budget"]["passed"], true);
    assert_eq!(body["session"]["status"], "complete");
    assert_eq!(body["settings"]["maxConcurrency"], 2);
    assert_eq!(body["configSource"]["kind"], "defaults");
}

#[tokio::test]
async fn scan_status_counts_outcomes() {
    let fetcher = site(&["/", "/about"]).with_document(
        "https://example.com/broken",
        500,
        "text/html",
        "",
    );
    let app = finished_app(fetcher, ScriptedAuditEngine::new(), |scan| {
        scan.discovery.urls.push("/broken".into());
    })
    .await;

    let response = app.server.get(paths::SCAN_STATUS).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "complete");
    assert_eq!(body["routeCount"], 3);
    assert_eq!(body["scannedCount"], 2);
    assert_eq!(body["failedCount"], 1);
    assert_eq!(body["pendingCount"], 0);
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn health_is_ok() {
    let app = finished_app(site(&["/"]), ScriptedAuditEngine::new(), |_| {}).await;

    let response = app.server.get(paths::HEALTH).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["scan"], "complete");
}

#[tokio::test]
async fn websocket_sends_snapshot_then_live_frames() {
    let app = finished_app(site(&["/", "/about"]), ScriptedAuditEngine::new(), |_| {}).await;

    let mut socket = app
        .server
        .get_websocket(paths::WEBSOCKET)
        .await
        .into_websocket()
        .await;

    let mut snapshot = Vec::new();
    for _ in 0..2 {
        let frame: Value = tokio::time::timeout(Duration::from_secs(5), socket.receive_json())
            .await
            .expect("snapshot frame");
        snapshot.push(frame["response"]["route"]["path"].as_str().unwrap().to_string());
    }
    assert_eq!(snapshot, vec!["/", "/about"]);

    app.runtime
        .rescan_route(&RouteId::from_path("/about"))
        .unwrap();
    let live: Value = tokio::time::timeout(Duration::from_secs(5), socket.receive_json())
        .await
        .expect("live frame");
    assert_eq!(live["response"]["route"]["path"], "/about");

    app.wait_until_idle().await;
    app.shutdown.cancel();
}
