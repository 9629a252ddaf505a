use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use metrics_exporter_prometheus::PrometheusHandle;
use safebox_storage::Database;

use crate::auth::TokenKeys;
use crate::hub::NotificationHub;
use crate::{
    auth, boxes, calendar, campaigns, deliveries, incidents, notifications, organization, qr,
    reports, supervisor, telemetry, workers,
};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    tokens: TokenKeys,
    timezone: Tz,
    hub: NotificationHub,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database, tokens: TokenKeys, timezone: Tz) -> Self {
        Self {
            metrics,
            storage,
            tokens,
            timezone,
            hub: NotificationHub::new(),
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn tokens(&self) -> &TokenKeys {
        &self.tokens
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Current date in the business timezone.
    pub fn today(&self) -> NaiveDate {
        calendar::local_today(self.timezone, self.now())
    }
}

pub fn app_router(state: AppState) -> Router {
    let api = Router::new()
        .nest("/auth", auth::routes())
        .nest("/branches", organization::branch_routes())
        .nest("/areas", organization::area_routes())
        .nest("/workers", workers::routes())
        .nest("/boxes", boxes::routes())
        .nest("/deliveries", deliveries::routes())
        .nest("/campaigns", campaigns::routes())
        .nest("/incidents", incidents::routes())
        .nest("/supervisor", supervisor::routes())
        .nest("/notifications", notifications::routes())
        .nest("/qr", qr::routes())
        .nest("/reports", reports::routes());

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/api", api)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::test_support::setup_state;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (state, _dir) = setup_state().await;
        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let (state, _dir) = setup_state().await;
        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let collected = response
            .into_body()
            .collect()
            .await
            .expect("body should read");
        let body = String::from_utf8(collected.to_bytes().to_vec()).expect("utf-8");
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn unknown_api_routes_are_not_found() {
        let (state, _dir) = setup_state().await;
        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/nowhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
