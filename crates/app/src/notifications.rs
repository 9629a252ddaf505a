use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::Stream;
use tracing::info;

use safebox_core::humanize::time_ago;
use safebox_core::notification::{NewNotification, READ_RETENTION_DAYS};
use safebox_core::types::{Notification, NotificationKind, NotificationPriority, Role};
use safebox_storage::NotificationFilter;

use crate::auth::AuthUser;
use crate::hub;
use crate::problem::{bad_request, ProblemResponse};
use crate::router::AppState;
use crate::workers::parse_param;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/unread", get(unread))
        .route("/stats", get(stats))
        .route("/read-all", post(read_all))
        .route("/cleanup", post(cleanup))
        .route("/stream", get(stream))
        .route("/:id", delete(remove))
        .route("/:id/read", post(mark_read))
}

/// Notification as shown to a reader, with its age rendered in the business timezone.
#[derive(Debug, Serialize)]
pub struct NotificationView {
    #[serde(flatten)]
    notification: Notification,
    time_ago: String,
}

impl NotificationView {
    pub fn new(notification: Notification, now: DateTime<Utc>, timezone: Tz) -> Self {
        let time_ago = time_ago(
            notification.created_at.with_timezone(&timezone),
            now.with_timezone(&timezone),
        );
        Self {
            notification,
            time_ago,
        }
    }
}

fn views(state: &AppState, rows: Vec<Notification>) -> Vec<NotificationView> {
    let now = state.now();
    rows.into_iter()
        .map(|n| NotificationView::new(n, now, state.timezone()))
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    kind: Option<String>,
    read: Option<bool>,
    priority: Option<String>,
    limit: Option<i64>,
}

async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<NotificationView>>, ProblemResponse> {
    let filter = NotificationFilter {
        kind: parse_param(query.kind.as_deref(), "kind")?,
        read: query.read,
        priority: parse_param(query.priority.as_deref(), "priority")?,
        limit: query.limit,
    };
    let rows = state
        .storage()
        .notifications()
        .list(&auth.viewer(), &filter)
        .await?;
    Ok(Json(views(&state, rows)))
}

#[derive(Debug, Serialize)]
struct UnreadView {
    count: usize,
    notifications: Vec<NotificationView>,
}

async fn unread(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<UnreadView>, ProblemResponse> {
    let filter = NotificationFilter {
        read: Some(false),
        ..NotificationFilter::default()
    };
    let rows = state
        .storage()
        .notifications()
        .list(&auth.viewer(), &filter)
        .await?;
    Ok(Json(UnreadView {
        count: rows.len(),
        notifications: views(&state, rows),
    }))
}

#[derive(Debug, Serialize)]
struct KindStats {
    label: &'static str,
    count: i64,
    unread: i64,
}

#[derive(Debug, Serialize)]
struct StatsView {
    total: i64,
    unread: i64,
    by_kind: BTreeMap<&'static str, KindStats>,
    by_priority: BTreeMap<&'static str, i64>,
}

async fn stats(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<StatsView>, ProblemResponse> {
    let stats = state.storage().notifications().stats(&auth.viewer()).await?;
    Ok(Json(StatsView {
        total: stats.total,
        unread: stats.unread,
        by_kind: stats
            .by_kind
            .into_iter()
            .map(|(kind, count, unread)| {
                let entry = KindStats {
                    label: kind.label(),
                    count,
                    unread,
                };
                (kind.as_str(), entry)
            })
            .collect(),
        by_priority: stats
            .by_priority
            .into_iter()
            .map(|(priority, count)| (priority.as_str(), count))
            .collect(),
    }))
}

async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<NotificationView>, ProblemResponse> {
    let notification = state
        .storage()
        .notifications()
        .mark_read(id, &auth.viewer(), state.now())
        .await?;
    Ok(Json(NotificationView::new(
        notification,
        state.now(),
        state.timezone(),
    )))
}

#[derive(Debug, Serialize)]
struct Affected {
    total: u64,
}

async fn read_all(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Affected>, ProblemResponse> {
    let total = state
        .storage()
        .notifications()
        .mark_all_read(&auth.viewer(), state.now())
        .await?;
    Ok(Json(Affected { total }))
}

async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    state
        .storage()
        .notifications()
        .delete(id, &auth.viewer())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cleanup(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Affected>, ProblemResponse> {
    let threshold = state.now() - Duration::days(READ_RETENTION_DAYS);
    let total = state
        .storage()
        .notifications()
        .cleanup(&auth.viewer(), threshold)
        .await?;
    info!(stage = "notify", user_id = auth.id(), deleted = total, "read notifications cleaned up");
    Ok(Json(Affected { total }))
}

#[derive(Debug, Deserialize)]
struct CreatePayload {
    kind: Option<NotificationKind>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    message: String,
    priority: Option<NotificationPriority>,
    recipient_user_id: Option<i64>,
    worker_id: Option<i64>,
    branch: Option<String>,
    extra: Option<Value>,
}

async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<CreatePayload>,
) -> Result<(StatusCode, Json<NotificationView>), ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let title = payload.title.trim().to_string();
    if title.is_empty() {
        return Err(bad_request("invalid_title", "title is required"));
    }
    let extra = payload.extra.unwrap_or_else(|| Value::Object(Default::default()));
    if !extra.is_object() {
        return Err(bad_request("invalid_extra", "extra must be a JSON object"));
    }

    let notification = state
        .storage()
        .notifications()
        .create(
            &NewNotification {
                kind: payload.kind.unwrap_or(NotificationKind::Info),
                title,
                message: payload.message.trim().to_string(),
                priority: payload.priority.unwrap_or(NotificationPriority::Medium),
                recipient_user_id: payload.recipient_user_id,
                worker_id: payload.worker_id,
                branch: payload.branch.filter(|b| !b.trim().is_empty()),
                extra,
            },
            state.now(),
        )
        .await?;
    info!(
        stage = "notify",
        notification_id = notification.id,
        kind = notification.kind.as_str(),
        created_by = auth.id(),
        "notification created"
    );
    state.hub().publish(notification.clone());

    let view = NotificationView::new(notification, state.now(), state.timezone());
    Ok((StatusCode::CREATED, Json(view)))
}

async fn stream(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Sse<impl Stream<Item = Result<Event, serde_json::Error>>> {
    info!(stage = "notify", user_id = auth.id(), "notification stream opened");
    Sse::new(hub::notification_stream(
        state.hub(),
        auth.viewer(),
        state.timezone(),
    ))
    .keep_alive(hub::keep_alive())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
    };
    use chrono::Duration;
    use serde_json::json;
    use tower::ServiceExt;

    use safebox_core::notification::NewNotification;
    use safebox_core::types::{NotificationKind, NotificationPriority, Role};

    use crate::router::{app_router, AppState};
    use crate::test_support::{bearer, seed_user, send, setup_state};

    async fn store(
        state: &AppState,
        kind: NotificationKind,
        branch: Option<&str>,
        recipient: Option<i64>,
        age: Duration,
    ) -> i64 {
        state
            .storage()
            .notifications()
            .create(
                &NewNotification {
                    kind,
                    title: "t".into(),
                    message: "m".into(),
                    priority: NotificationPriority::Medium,
                    recipient_user_id: recipient,
                    worker_id: None,
                    branch: branch.map(str::to_string),
                    extra: json!({}),
                },
                state.now() - age,
            )
            .await
            .expect("store notification")
            .id
    }

    #[tokio::test]
    async fn list_is_scoped_and_humanized() {
        let (state, _dir) = setup_state().await;
        let guard = seed_user(&state, "guard", Role::Guard, "casablanca").await;
        let other = seed_user(&state, "other", Role::Guard, "casablanca").await;
        store(&state, NotificationKind::Info, None, None, Duration::hours(2)).await;
        store(&state, NotificationKind::LowStock, Some("casablanca"), None, Duration::zero()).await;
        store(&state, NotificationKind::LowStock, Some("valparaiso_bif"), None, Duration::zero()).await;
        store(&state, NotificationKind::Info, None, Some(other.id), Duration::zero()).await;
        let token = bearer(&state, &guard);

        let (status, body) = send(&state, Method::GET, "/api/notifications", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        let items = body.as_array().expect("array");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["time_ago"], "just now");
        assert_eq!(items[1]["time_ago"], "2 hours ago");

        let (_, body) = send(
            &state,
            Method::GET,
            "/api/notifications?kind=stock_bajo",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let (_, body) = send(&state, Method::GET, "/api/notifications/stats", Some(&token), None).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["unread"], 2);
        assert_eq!(body["by_kind"]["low_stock"]["label"], "Low stock");
        assert_eq!(body["by_kind"]["info"]["count"], 1);
        assert_eq!(body["by_priority"]["medium"], 2);
    }

    #[tokio::test]
    async fn read_flow_and_cleanup() {
        let (state, _dir) = setup_state().await;
        let guard = seed_user(&state, "guard", Role::Guard, "casablanca").await;
        let token = bearer(&state, &guard);
        let old = store(&state, NotificationKind::Info, None, None, Duration::days(40)).await;
        let recent = store(&state, NotificationKind::Warning, None, None, Duration::zero()).await;
        let foreign = store(&state, NotificationKind::Info, Some("valparaiso_bic"), None, Duration::zero()).await;

        let (status, body) = send(
            &state,
            Method::POST,
            &format!("/api/notifications/{recent}/read"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["read"], true);

        let (status, _) = send(
            &state,
            Method::POST,
            &format!("/api/notifications/{foreign}/read"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(&state, Method::GET, "/api/notifications/unread", Some(&token), None).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["notifications"][0]["id"], old);

        let (_, body) = send(&state, Method::POST, "/api/notifications/read-all", Some(&token), None).await;
        assert_eq!(body["total"], 1);

        let (_, body) = send(&state, Method::POST, "/api/notifications/cleanup", Some(&token), None).await;
        assert_eq!(body["total"], 1);

        let (status, _) = send(
            &state,
            Method::DELETE,
            &format!("/api/notifications/{recent}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = send(&state, Method::GET, "/api/notifications", Some(&token), None).await;
        assert_eq!(body.as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn hr_broadcasts_reach_the_hub() {
        let (state, _dir) = setup_state().await;
        let hr = seed_user(&state, "hr", Role::Hr, "casablanca").await;
        let guard = seed_user(&state, "guard", Role::Guard, "casablanca").await;
        let mut receiver = state.hub().subscribe();
        let payload = json!({"title": " Stock arrives Friday ", "message": "bring id", "kind": "info"});

        let (status, _) = send(
            &state,
            Method::POST,
            "/api/notifications",
            Some(&bearer(&state, &guard)),
            Some(payload.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &state,
            Method::POST,
            "/api/notifications",
            Some(&bearer(&state, &hr)),
            Some(payload),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["title"], "Stock arrives Friday");
        assert_eq!(body["priority"], "medium");

        let published = receiver.try_recv().expect("published");
        assert_eq!(published.title, "Stock arrives Friday");
    }

    #[tokio::test]
    async fn stream_responds_with_event_stream() {
        let (state, _dir) = setup_state().await;
        let guard = seed_user(&state, "guard", Role::Guard, "casablanca").await;
        let token = bearer(&state, &guard);
        let response = app_router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/notifications/stream")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("text/event-stream"));
    }
}
