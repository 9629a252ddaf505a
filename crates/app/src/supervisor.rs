//! Supervisor console: incident queue, SLA counters and status changes.

use axum::{
    extract::{Path, Query, State},
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use safebox_core::incident::IncidentAction;
use safebox_core::types::{IncidentStatus, Role};
use safebox_storage::IncidentStatusCounts;

use crate::auth::{AuthUser, UserView};
use crate::incidents::{load_view, IncidentView, ListQuery};
use crate::problem::{bad_request, not_found, ProblemResponse};
use crate::router::AppState;

const MAX_COMMENT_CHARS: usize = 500;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/info", get(info_handler))
        .route("/stats", get(stats))
        .route("/incidents", get(incidents))
        .route("/incidents/:id", get(incident_detail))
        .route("/incidents/:id/update", patch(update_incident))
        .route("/incidents/:id/reopen", patch(reopen_incident))
}

const CONSOLE_ROLES: &[Role] = &[Role::Supervisor, Role::Hr];

async fn info_handler(auth: AuthUser) -> Result<Json<UserView>, ProblemResponse> {
    auth.require(CONSOLE_ROLES)?;
    Ok(Json(auth.0.into()))
}

#[derive(Debug, Serialize)]
struct StatsView {
    total: i64,
    pending: i64,
    in_progress: i64,
    resolved: i64,
    rejected: i64,
    overdue: i64,
}

impl From<IncidentStatusCounts> for StatsView {
    fn from(counts: IncidentStatusCounts) -> Self {
        Self {
            total: counts.total,
            pending: counts.pending,
            in_progress: counts.in_progress,
            resolved: counts.resolved,
            rejected: counts.rejected,
            overdue: counts.overdue,
        }
    }
}

async fn stats(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<StatsView>, ProblemResponse> {
    auth.require(CONSOLE_ROLES)?;
    let counts = state.storage().incidents().status_counts(state.now()).await?;
    Ok(Json(counts.into()))
}

#[derive(Debug, Serialize)]
struct IncidentPage {
    data: Vec<IncidentView>,
    total: usize,
}

async fn incidents(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<IncidentPage>, ProblemResponse> {
    auth.require(CONSOLE_ROLES)?;
    let filter = query.filter(None)?;
    let now = state.now();
    let data: Vec<IncidentView> = state
        .storage()
        .incidents()
        .list(&filter)
        .await?
        .into_iter()
        .map(|detail| IncidentView::new(detail, now))
        .collect();
    Ok(Json(IncidentPage {
        total: data.len(),
        data,
    }))
}

async fn incident_detail(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<IncidentView>, ProblemResponse> {
    auth.require(CONSOLE_ROLES)?;
    Ok(Json(load_view(&state, id).await?))
}

#[derive(Debug, Deserialize)]
struct UpdatePayload {
    status: IncidentStatus,
    #[serde(default)]
    comment: String,
}

async fn transition(
    state: &AppState,
    auth: &AuthUser,
    id: i64,
    action: IncidentAction,
) -> Result<IncidentView, ProblemResponse> {
    let repo = state.storage().incidents();
    let mut incident = repo
        .find(id)
        .await?
        .ok_or_else(|| not_found("incident not found"))?
        .incident;
    let from = incident.status;
    incident.apply(action, auth.id(), state.now())?;
    repo.save(&incident, from).await?;
    info!(
        stage = "incident",
        incident_id = id,
        from = from.as_str(),
        to = incident.status.as_str(),
        supervisor_id = auth.id(),
        "incident status changed"
    );
    load_view(state, id).await
}

async fn update_incident(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<UpdatePayload>,
) -> Result<Json<IncidentView>, ProblemResponse> {
    auth.require(&[Role::Supervisor])?;
    let comment = payload.comment.trim().to_string();
    if comment.is_empty() {
        return Err(bad_request("invalid_comment", "a comment is required"));
    }
    if comment.chars().count() > MAX_COMMENT_CHARS {
        return Err(bad_request(
            "invalid_comment",
            format!("comment must be at most {MAX_COMMENT_CHARS} characters"),
        ));
    }

    let action = match payload.status {
        IncidentStatus::InProgress => IncidentAction::Take {
            note: Some(comment),
        },
        IncidentStatus::Resolved => IncidentAction::Resolve { solution: comment },
        IncidentStatus::Rejected => IncidentAction::Reject { reason: comment },
        IncidentStatus::Pending => {
            return Err(bad_request(
                "invalid_status",
                "use the reopen action to move an incident back to pending",
            ))
        }
    };
    Ok(Json(transition(&state, &auth, id, action).await?))
}

async fn reopen_incident(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<IncidentView>, ProblemResponse> {
    auth.require(&[Role::Supervisor])?;
    Ok(Json(
        transition(&state, &auth, id, IncidentAction::Reopen).await?,
    ))
}
