//! Shared fixtures for handler tests.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use safebox_core::types::{BoxLot, ContractType, Role, User, Worker, WorkerStatus};
use safebox_storage::{Database, NewBox, NewUser, NewWorker};

use crate::auth::TokenKeys;
use crate::router::{app_router, AppState};
use crate::telemetry;

/// Monday 2025-03-10, 12:00 in America/Santiago.
pub const NOW: &str = "2025-03-10T15:00:00Z";

pub fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub async fn setup_state() -> (AppState, TempDir) {
    setup_state_at(ts(NOW)).await
}

pub async fn setup_state_at(now: DateTime<Utc>) -> (AppState, TempDir) {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let dir = TempDir::new().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("app.db").display());
    let database = Database::connect(&url).await.expect("connect");
    database.run_migrations().await.expect("migrations");

    let tokens = TokenKeys::new(b"test-secret", Duration::from_secs(3600));
    let timezone = "America/Santiago".parse().expect("timezone");
    let state = AppState::new(metrics, database, tokens, timezone).with_clock(Arc::new(move || now));
    (state, dir)
}

pub async fn seed_user(state: &AppState, username: &str, role: Role, branch: &str) -> User {
    state
        .storage()
        .users()
        .insert(
            &NewUser {
                username: username.to_string(),
                password_hash: "v1$1$00$00".into(),
                first_name: username.to_string(),
                last_name: "Staff".into(),
                email: String::new(),
                phone: String::new(),
                role,
                branch: branch.to_string(),
                active: true,
            },
            state.now(),
        )
        .await
        .expect("insert user")
}

pub fn new_worker(rut: &str, branch: &str, contract_type: ContractType) -> NewWorker {
    NewWorker {
        rut: rut.to_string(),
        first_name: "Luis".into(),
        paternal_surname: "Pérez".into(),
        maternal_surname: "Mora".into(),
        position: "Operator".into(),
        contract_type,
        period: "2025".into(),
        branch: branch.to_string(),
        area: Some("produccion_manufactura".into()),
        email: None,
        phone: None,
        status: WorkerStatus::Pending,
        active: true,
    }
}

pub async fn seed_worker(
    state: &AppState,
    rut: &str,
    branch: &str,
    contract_type: ContractType,
) -> Worker {
    state
        .storage()
        .workers()
        .insert(&new_worker(rut, branch, contract_type), state.now())
        .await
        .expect("insert worker")
}

pub async fn seed_box(
    state: &AppState,
    code: &str,
    branch: &str,
    contract_type: ContractType,
    quantity: i64,
) -> BoxLot {
    state
        .storage()
        .boxes()
        .insert(
            &NewBox {
                code: code.to_string(),
                contract_type,
                branch: branch.to_string(),
                available_quantity: quantity,
                active: true,
            },
            state.now(),
        )
        .await
        .expect("insert box")
}

pub fn bearer(state: &AppState, user: &User) -> String {
    state
        .tokens()
        .issue(user, state.now())
        .expect("issue token")
        .0
}

/// Sends one request through the full router and returns the status and raw body.
pub async fn send_raw(
    state: &AppState,
    method: Method,
    uri: &str,
    token: Option<&str>,
    content_type: Option<&str>,
    body: Body,
) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    let response = app_router(state.clone())
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("handler should respond");

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should read")
        .to_bytes()
        .to_vec();
    (status, headers, bytes)
}

/// JSON request and response. Empty bodies decode as `Value::Null`.
pub async fn send(
    state: &AppState,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (content_type, body) = match body {
        Some(value) => (Some("application/json"), Body::from(value.to_string())),
        None => (None, Body::empty()),
    };
    let (status, _, bytes) = send_raw(state, method, uri, token, content_type, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}
