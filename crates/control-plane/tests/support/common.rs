#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{HeaderName, Request as HttpRequest, Response, StatusCode},
};
use common::api;
use control_plane::{
    app_state::{AppState, OperatorAuth},
    config::{DistributionConfig, LimitsConfig},
    metrics::{init_metrics_recorder, record_build_info},
    persistence::{self as db, KvRef, SqliteKv, migrations},
    registry::Registry,
    routes::{build_metrics_router, build_router},
};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_OPERATOR_TOKEN: &str = "test-operator-token";

#[derive(Clone, Default)]
pub struct TestAppConfig {
    pub operator_tokens: Option<Vec<String>>,
    pub operator_header: Option<HeaderName>,
    pub limits: Option<LimitsConfig>,
    pub distribution: Option<DistributionConfig>,
}

pub async fn setup_app() -> (Router, AppState) {
    setup_app_with_config(TestAppConfig::default()).await
}

pub async fn setup_apps() -> (Router, Router, AppState) {
    let (app, state) = setup_app().await;
    let metrics_app = build_metrics_router().with_state(state.clone());
    (app, metrics_app, state)
}

pub async fn setup_app_with_config(config: TestAppConfig) -> (Router, AppState) {
    let db = migrations::init_pool("sqlite::memory:")
        .await
        .expect("db init");
    let migration_outcome = migrations::run_migrations(&db).await.expect("migrations");
    let state = make_state(db, &config, migration_outcome.snapshot);
    let app = build_router(state.clone()).with_state(state.clone());
    (app, state)
}

pub fn make_state(db: db::Db, config: &TestAppConfig, schema: db::MigrationSnapshot) -> AppState {
    let metrics_handle = init_metrics_recorder();
    record_build_info(&schema);
    let kv: KvRef = Arc::new(SqliteKv::new(db.clone()));

    AppState {
        db,
        kv,
        registry: Arc::new(Registry::builtin()),
        operator_auth: OperatorAuth {
            tokens: config
                .operator_tokens
                .clone()
                .unwrap_or_else(|| vec![TEST_OPERATOR_TOKEN.into()]),
            header_name: config
                .operator_header
                .clone()
                .unwrap_or_else(|| HeaderName::from_static("authorization")),
        },
        token_pepper: "test-pepper".into(),
        limits: config.limits.clone().unwrap_or_default(),
        distribution: config.distribution.clone().unwrap_or_default(),
        metrics_handle,
        schema,
    }
}

fn request(method: &str, uri: &str, bearer: Option<&str>, body: Option<&Value>) -> HttpRequest<Body> {
    let mut builder = HttpRequest::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Sends an operator-authenticated request.
pub async fn operator(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response<Body> {
    app.clone()
        .oneshot(request(method, uri, Some(TEST_OPERATOR_TOKEN), body.as_ref()))
        .await
        .unwrap()
}

/// Sends a host-protocol request authenticated with the given host token.
pub async fn agent(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Response<Body> {
    app.clone()
        .oneshot(request(method, uri, token, body.as_ref()))
        .await
        .unwrap()
}

pub async fn anonymous(app: &Router, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(request("GET", uri, None, None))
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes()
        .to_vec()
}

pub async fn json_body<T: DeserializeOwned>(response: Response<Body>) -> T {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).unwrap_or_else(|err| {
        panic!(
            "decode body: {err}: {}",
            String::from_utf8_lossy(&bytes)
        )
    })
}

/// Asserts status and machine-readable code of an error response.
pub async fn expect_error(response: Response<Body>, status: StatusCode, code: &str) {
    assert_eq!(response.status(), status);
    let body: api::ErrorBody = json_body(response).await;
    assert_eq!(body.code, code, "unexpected error: {}", body.error);
}

/// Creates a host over the API and returns it with its plaintext token.
pub async fn create_host(app: &Router, payload: Value) -> api::HostCreateResponse {
    let response = operator(app, "POST", "/api/v1/hosts", Some(payload)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await
}

pub async fn deploy(app: &Router, host_ids: &[Uuid], profile_ids: &[&str], params: Value) -> api::DeployRecord {
    let payload = serde_json::json!({
        "host_ids": host_ids,
        "profile_ids": profile_ids,
        "params": params,
    });
    let response = operator(app, "POST", "/api/v1/deploys", Some(payload)).await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

pub async fn report(
    app: &Router,
    host: &api::HostCreateResponse,
    version: u64,
    status: &str,
    message: &str,
) -> Response<Body> {
    agent(
        app,
        "POST",
        &format!("/api/v1/agent/{}/apply-result", host.host.id),
        Some(&host.host_token),
        Some(serde_json::json!({
            "version": version,
            "status": status,
            "message": message,
            "protocols": ["vless"],
        })),
    )
    .await
}
