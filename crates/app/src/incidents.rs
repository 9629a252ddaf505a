use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use safebox_core::incident::default_priority;
use safebox_core::notification::new_incident_alert;
use safebox_core::rut::normalize_rut;
use safebox_core::types::{Incident, IncidentKind, IncidentPriority, Role};
use safebox_storage::{IncidentDetail, IncidentFilter, NewIncident};

use crate::auth::AuthUser;
use crate::problem::{bad_request, not_found, ProblemResponse};
use crate::router::AppState;
use crate::workers::parse_param;

const MINE_LIMIT: i64 = 10;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(report))
        .route("/mine", get(mine))
        .route("/kinds", get(kinds))
        .route("/:id", get(detail))
}

#[derive(Debug, Serialize)]
pub struct PersonSummary {
    pub id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IncidentWorker {
    pub id: i64,
    pub rut: Option<String>,
    pub name: Option<String>,
}

/// Incident with people, labels and SLA state resolved for display.
#[derive(Debug, Serialize)]
pub struct IncidentView {
    #[serde(flatten)]
    pub incident: Incident,
    pub kind_label: &'static str,
    pub priority_label: &'static str,
    pub status_label: &'static str,
    pub worker: Option<IncidentWorker>,
    pub guard: Option<PersonSummary>,
    pub supervisor: Option<PersonSummary>,
    pub overdue: bool,
    pub unresolved_for: Option<String>,
}

impl IncidentView {
    pub fn new(detail: IncidentDetail, now: DateTime<Utc>) -> Self {
        let incident = detail.incident;
        let worker = incident.worker_id.map(|id| IncidentWorker {
            id,
            rut: detail.worker_rut,
            name: detail.worker_name,
        });
        let guard = incident.guard_id.map(|id| PersonSummary {
            id,
            username: detail.guard_username,
            name: detail.guard_name,
        });
        let supervisor = incident.supervisor_id.map(|id| PersonSummary {
            id,
            username: detail.supervisor_username,
            name: detail.supervisor_name,
        });
        Self {
            kind_label: incident.kind.label(),
            priority_label: incident.priority.label(),
            status_label: incident.status.label(),
            overdue: incident.is_overdue(now),
            unresolved_for: incident.unresolved_for(now),
            worker,
            guard,
            supervisor,
            incident,
        }
    }
}

pub(crate) async fn load_view(state: &AppState, id: i64) -> Result<IncidentView, ProblemResponse> {
    let detail = state
        .storage()
        .incidents()
        .find(id)
        .await?
        .ok_or_else(|| not_found("incident not found"))?;
    Ok(IncidentView::new(detail, state.now()))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    pub status: Option<String>,
    pub search: Option<String>,
    pub limit: Option<i64>,
}

impl ListQuery {
    pub(crate) fn filter(&self, guard_id: Option<i64>) -> Result<IncidentFilter, ProblemResponse> {
        Ok(IncidentFilter {
            guard_id,
            status: parse_param(self.status.as_deref(), "status")?,
            search: self.search.clone(),
            limit: self.limit,
        })
    }
}

fn own_scope(auth: &AuthUser) -> Option<i64> {
    (auth.role() == Role::Guard).then(|| auth.id())
}

async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<IncidentView>>, ProblemResponse> {
    let filter = query.filter(own_scope(&auth))?;
    let now = state.now();
    let rows = state.storage().incidents().list(&filter).await?;
    Ok(Json(rows.into_iter().map(|d| IncidentView::new(d, now)).collect()))
}

async fn mine(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<IncidentView>>, ProblemResponse> {
    let now = state.now();
    let rows = state
        .storage()
        .incidents()
        .list(&IncidentFilter {
            guard_id: Some(auth.id()),
            limit: Some(MINE_LIMIT),
            ..IncidentFilter::default()
        })
        .await?;
    Ok(Json(rows.into_iter().map(|d| IncidentView::new(d, now)).collect()))
}

async fn detail(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<IncidentView>, ProblemResponse> {
    let view = load_view(&state, id).await?;
    if let Some(own) = own_scope(&auth) {
        if view.incident.guard_id != Some(own) {
            return Err(not_found("incident not found"));
        }
    }
    Ok(Json(view))
}

#[derive(Debug, Serialize)]
struct KindEntry {
    value: IncidentKind,
    label: &'static str,
    default_priority: IncidentPriority,
}

async fn kinds(_auth: AuthUser) -> Json<Vec<KindEntry>> {
    Json(
        IncidentKind::ALL
            .iter()
            .map(|&kind| KindEntry {
                value: kind,
                label: kind.label(),
                default_priority: default_priority(kind),
            })
            .collect(),
    )
}

#[derive(Debug, Default, Deserialize)]
struct ReportPayload {
    worker_rut: Option<String>,
    kind: Option<IncidentKind>,
    #[serde(default)]
    description: String,
    priority: Option<IncidentPriority>,
    delivery_id: Option<i64>,
}

async fn report(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<ReportPayload>,
) -> Result<(StatusCode, Json<IncidentView>), ProblemResponse> {
    let description = payload.description.trim().to_string();
    if description.is_empty() {
        return Err(bad_request("invalid_description", "description is required"));
    }
    let kind = payload.kind.unwrap_or(IncidentKind::Other);

    let mut worker_id = None;
    let mut manual_worker_rut = String::new();
    if let Some(raw) = payload.worker_rut.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        let rut = normalize_rut(raw).unwrap_or_else(|_| raw.to_string());
        match state.storage().workers().find_by_rut(&rut).await? {
            Some(worker) => worker_id = Some(worker.id),
            None => manual_worker_rut = rut,
        }
    }

    let incident = NewIncident {
        worker_id,
        guard_id: Some(auth.id()),
        delivery_id: payload.delivery_id,
        kind,
        description,
        priority: payload.priority.unwrap_or_else(|| default_priority(kind)),
        manual_worker_rut,
    };
    let reporter = auth.user().full_name();
    let branch = auth.user().branch.clone();
    let (stored, alert) = state
        .storage()
        .incidents()
        .insert_with_alert(
            &incident,
            |stored| new_incident_alert(stored, &reporter, &branch),
            state.now(),
        )
        .await?;

    counter!("incidents_reported_total", "kind" => stored.kind.as_str()).increment(1);
    info!(
        stage = "incident",
        incident_id = stored.id,
        kind = stored.kind.as_str(),
        priority = stored.priority.as_str(),
        guard_id = auth.id(),
        "incident reported"
    );
    state.hub().publish(alert);

    Ok((StatusCode::CREATED, Json(load_view(&state, stored.id).await?)))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use safebox_core::types::{ContractType, NotificationKind, Role};

    use crate::test_support::{bearer, seed_user, seed_worker, send, setup_state};

    #[tokio::test]
    async fn report_assigns_priority_and_raises_alert() {
        let (state, _dir) = setup_state().await;
        let guard = seed_user(&state, "guard", Role::Guard, "casablanca").await;
        let worker = seed_worker(&state, "11111111-1", "casablanca", ContractType::Indefinite).await;
        let mut receiver = state.hub().subscribe();
        let token = bearer(&state, &guard);

        let (status, body) = send(
            &state,
            Method::POST,
            "/api/incidents",
            Some(&token),
            Some(json!({"worker_rut": "11.111.111-1", "kind": "stock_insuficiente",
                        "description": "  no boxes left  "})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["priority"], "critical");
        assert_eq!(body["status"], "pending");
        assert_eq!(body["description"], "no boxes left");
        assert_eq!(body["notified"], true);
        assert_eq!(body["worker"]["id"], worker.id);
        assert_eq!(body["overdue"], false);
        assert_eq!(body["unresolved_for"], "0 min");

        let alert = receiver.try_recv().expect("alert published");
        assert_eq!(alert.kind, NotificationKind::NewIncident);
        assert_eq!(alert.branch.as_deref(), Some("casablanca"));
        assert_eq!(alert.extra["incident_id"], body["id"]);

        let (status, body) = send(
            &state,
            Method::POST,
            "/api/incidents",
            Some(&token),
            Some(json!({"worker_rut": "99.999.999-9", "description": "unknown person"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["kind"], "other");
        assert_eq!(body["priority"], "medium");
        assert_eq!(body["manual_worker_rut"], "99999999-9");
        assert_eq!(body["worker"], serde_json::Value::Null);

        let (status, body) = send(
            &state,
            Method::POST,
            "/api/incidents",
            Some(&token),
            Some(json!({"description": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_description");
    }

    #[tokio::test]
    async fn guards_only_see_their_own_reports() {
        let (state, _dir) = setup_state().await;
        let first = seed_user(&state, "first", Role::Guard, "casablanca").await;
        let second = seed_user(&state, "second", Role::Guard, "casablanca").await;
        let supervisor = seed_user(&state, "boss", Role::Supervisor, "casablanca").await;

        let (_, body) = send(
            &state,
            Method::POST,
            "/api/incidents",
            Some(&bearer(&state, &first)),
            Some(json!({"kind": "system_down", "description": "tablet offline"})),
        )
        .await;
        let uri = format!("/api/incidents/{}", body["id"]);

        let (status, _) = send(&state, Method::GET, &uri, Some(&bearer(&state, &second)), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) =
            send(&state, Method::GET, &uri, Some(&bearer(&state, &supervisor)), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["guard"]["username"], "first");

        let (_, body) = send(&state, Method::GET, "/api/incidents", Some(&bearer(&state, &second)), None).await;
        assert_eq!(body.as_array().map(Vec::len), Some(0));
        let (_, body) = send(&state, Method::GET, "/api/incidents/mine", Some(&bearer(&state, &first)), None).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn kinds_lists_catalog_with_default_priorities() {
        let (state, _dir) = setup_state().await;
        let guard = seed_user(&state, "guard", Role::Guard, "casablanca").await;
        let (status, body) =
            send(&state, Method::GET, "/api/incidents/kinds", Some(&bearer(&state, &guard)), None).await;
        assert_eq!(status, StatusCode::OK);
        let kinds = body.as_array().expect("array");
        assert_eq!(kinds.len(), 8);
        assert_eq!(kinds[0]["value"], "qr_not_working");
        assert_eq!(kinds[0]["default_priority"], "medium");
        assert_eq!(kinds[3]["value"], "insufficient_stock");
        assert_eq!(kinds[3]["default_priority"], "critical");
    }
}
