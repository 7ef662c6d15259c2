// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP surface tests for the controller.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use flc_controller::{AppState, InfluxSink, ResultSink, build_app};
use flc_core::{ResultRecord, sha256_hex};
use http_body_util::BodyExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Sink that records batches and answers with a configured verdict.
struct RecordingSink {
    accept: bool,
    batches: Mutex<Vec<Vec<ResultRecord>>>,
}

impl RecordingSink {
    fn new(accept: bool) -> Arc<RecordingSink> {
        Arc::new(RecordingSink {
            accept,
            batches: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn write_points(&self, batch: &[ResultRecord]) -> bool {
        self.batches.lock().unwrap().push(batch.to_vec());
        self.accept
    }
}

fn write_fixture(dir: &Path) {
    let checks = dir.join("checks");
    std::fs::create_dir_all(&checks).unwrap();
    std::fs::write(checks.join("cpu"), b"#!/bin/sh\necho 1\n").unwrap();
    std::fs::write(checks.join("cpu.sig"), b"deadbeef").unwrap();
    std::fs::write(checks.join("mem"), b"#!/bin/sh\necho 2\n").unwrap();

    let config = serde_json::json!({
        "groups": {
            "admins": ["A", "B"],
            "all": ["*"]
        },
        "tests": {
            "t1": {
                "name": "t1",
                "check": "cpu",
                "args": "",
                "interval": 60,
                "retries": 3,
                "groups": ["admins"]
            },
            "t2": {
                "name": "t2",
                "check": "mem",
                "args": "-v",
                "interval": 30,
                "retries": 1,
                "groups": ["all"]
            }
        },
        "clients": {
            "A": { "alias": "alpha" }
        }
    });
    std::fs::write(
        dir.join("config.json"),
        serde_json::to_vec_pretty(&config).unwrap(),
    )
    .unwrap();
}

fn app_with_sink(dir: &Path, sink: Arc<dyn ResultSink>) -> axum::Router {
    build_app(Arc::new(AppState {
        config_path: dir.join("config.json"),
        checks_dir: dir.join("checks"),
        sink,
    }))
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let resp = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn post_json(
    app: axum::Router,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

// ---------------------------------------------------------------------------
// GET /config
// ---------------------------------------------------------------------------

#[tokio::test]
async fn config_without_uuid_is_400() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let (status, body) = get(app, "/config").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn config_with_empty_uuid_is_400() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let (status, _) = get(app, "/config?uuid=").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn config_with_unreadable_file_is_500() {
    let tmp = tempfile::tempdir().unwrap();
    // No config.json written.
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let (status, body) = get(app, "/config?uuid=A").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn admin_uuid_gets_both_tests() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let (status, body) = get(app, "/config?uuid=A").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["t1", "t2"]);
}

#[tokio::test]
async fn outsider_uuid_gets_wildcard_tests_only() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let (status, body) = get(app, "/config?uuid=C").await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["t2"]);
}

#[tokio::test]
async fn served_descriptors_carry_current_artifact_hash() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let (_, body) = get(app, "/config?uuid=A").await;
    let t1 = &body["data"][0];
    assert_eq!(t1["name"], "t1");
    assert_eq!(
        t1["hash"].as_str().unwrap(),
        sha256_hex(b"#!/bin/sh\necho 1\n")
    );
}

#[tokio::test]
async fn uuid_with_no_tests_gets_error_body_on_200() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    // Strip the wildcard group so an unknown uuid matches nothing.
    let raw = std::fs::read_to_string(tmp.path().join("config.json")).unwrap();
    let mut config: serde_json::Value = serde_json::from_str(&raw).unwrap();
    config["groups"].as_object_mut().unwrap().remove("all");
    std::fs::write(
        tmp.path().join("config.json"),
        serde_json::to_vec(&config).unwrap(),
    )
    .unwrap();

    let app = app_with_sink(tmp.path(), RecordingSink::new(true));
    let (status, body) = get(app, "/config?uuid=Z").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");
}

// ---------------------------------------------------------------------------
// POST /callhome
// ---------------------------------------------------------------------------

fn result_batch() -> serde_json::Value {
    serde_json::json!([
        {
            "measurement": "t1",
            "tags": {},
            "fields": { "success": true, "result": 42.5 }
        }
    ])
}

#[tokio::test]
async fn callhome_annotates_uuid_and_alias_tags() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let sink = RecordingSink::new(true);
    let app = app_with_sink(tmp.path(), sink.clone());

    let (status, body) = post_json(app, "/callhome?uuid=A", &result_batch()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let batches = sink.batches.lock().unwrap();
    let record = &batches[0][0];
    assert_eq!(record.tags["uuid"], "A");
    assert_eq!(record.tags["alias"], "alpha");
}

#[tokio::test]
async fn callhome_alias_falls_back_to_uuid() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let sink = RecordingSink::new(true);
    let app = app_with_sink(tmp.path(), sink.clone());

    let (status, _) = post_json(app, "/callhome?uuid=B", &result_batch()).await;
    assert_eq!(status, StatusCode::OK);

    let batches = sink.batches.lock().unwrap();
    assert_eq!(batches[0][0].tags["alias"], "B");
}

#[tokio::test]
async fn callhome_without_uuid_is_400() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let (status, _) = post_json(app, "/callhome", &result_batch()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callhome_from_groupless_uuid_is_400() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let raw = std::fs::read_to_string(tmp.path().join("config.json")).unwrap();
    let mut config: serde_json::Value = serde_json::from_str(&raw).unwrap();
    config["groups"].as_object_mut().unwrap().remove("all");
    std::fs::write(
        tmp.path().join("config.json"),
        serde_json::to_vec(&config).unwrap(),
    )
    .unwrap();

    let sink = RecordingSink::new(true);
    let app = app_with_sink(tmp.path(), sink.clone());

    let (status, _) = post_json(app, "/callhome?uuid=nobody", &result_batch()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(sink.batches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn callhome_maps_backend_failure_to_400() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(false));

    let (status, body) = post_json(app, "/callhome?uuid=A", &result_batch()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
}

// ---------------------------------------------------------------------------
// GET /checks/{filename}
// ---------------------------------------------------------------------------

#[tokio::test]
async fn artifact_bytes_are_served_verbatim() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let resp = app
        .oneshot(Request::builder().uri("/checks/cpu").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"#!/bin/sh\necho 1\n");
}

#[tokio::test]
async fn sig_companion_is_served_from_the_same_route() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/checks/cpu.sig")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"deadbeef");
}

#[tokio::test]
async fn missing_artifact_is_404() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let (status, _) = get(app, "/checks/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn traversal_attempts_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    write_fixture(tmp.path());
    let app = app_with_sink(tmp.path(), RecordingSink::new(true));

    let (status, _) = get(app, "/checks/..%2Fconfig.json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// InfluxSink
// ---------------------------------------------------------------------------

#[tokio::test]
async fn influx_sink_posts_line_protocol_to_write_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/write"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let addr = server.address();
    let sink = InfluxSink::new(&addr.ip().to_string(), addr.port(), "testdb");
    let batch: Vec<ResultRecord> =
        serde_json::from_value(result_batch()).expect("fixture parses");
    assert!(sink.write_points(&batch).await);
}

#[tokio::test]
async fn influx_sink_reports_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/write"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let addr = server.address();
    let sink = InfluxSink::new(&addr.ip().to_string(), addr.port(), "testdb");
    let batch: Vec<ResultRecord> =
        serde_json::from_value(result_batch()).expect("fixture parses");
    assert!(!sink.write_points(&batch).await);
}

#[tokio::test]
async fn influx_sink_reports_unreachable_backend() {
    // Nothing listens on this port.
    let sink = InfluxSink::new("127.0.0.1", 1, "testdb");
    let batch: Vec<ResultRecord> =
        serde_json::from_value(result_batch()).expect("fixture parses");
    assert!(!sink.write_points(&batch).await);
}
