use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use safebox_core::campaign::{completion_percent, CampaignDraft};
use safebox_core::rut::normalize_rut;
use safebox_core::types::{Campaign, ContractType, DeliveryMode, Role, WorkerStatus};
use safebox_storage::{CampaignState, NewCampaign};

use crate::auth::AuthUser;
use crate::calendar;
use crate::problem::{bad_request, not_found, ProblemResponse};
use crate::router::AppState;
use crate::workers::WorkerView;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/check-worker", post(check_worker))
        .route("/:id", get(detail).patch(update).delete(remove))
        .route("/:id/finish", post(finish))
        .route("/:id/reactivate", post(reactivate))
        .route("/:id/stats", get(stats))
}

#[derive(Debug, Serialize)]
pub struct CampaignView {
    #[serde(flatten)]
    campaign: Campaign,
    is_current: bool,
    areas_display: String,
    contract_types_display: String,
    eligible_workers: i64,
    deliveries_made: i64,
}

/// Area catalog as `(active codes, code to name)`.
async fn area_catalog(state: &AppState) -> Result<(Vec<String>, HashMap<String, String>), ProblemResponse> {
    let entries = state.storage().areas().list(None).await?;
    let active = entries
        .iter()
        .filter(|summary| summary.entry.active)
        .map(|summary| summary.entry.code.clone())
        .collect();
    let names = entries
        .into_iter()
        .map(|summary| (summary.entry.code, summary.entry.name))
        .collect();
    Ok((active, names))
}

async fn deliveries_made(state: &AppState, campaign: &Campaign) -> Result<i64, ProblemResponse> {
    let (from, to) =
        calendar::range_bounds(state.timezone(), campaign.start_date, campaign.end_date);
    Ok(state
        .storage()
        .campaigns()
        .count_deliveries_made(campaign, from, to)
        .await?)
}

async fn view(
    state: &AppState,
    campaign: Campaign,
    names: &HashMap<String, String>,
) -> Result<CampaignView, ProblemResponse> {
    let eligible_workers = state.storage().campaigns().count_eligible(&campaign).await?;
    let deliveries_made = deliveries_made(state, &campaign).await?;
    Ok(CampaignView {
        is_current: campaign.is_current(state.today()),
        areas_display: campaign.areas_display(names),
        contract_types_display: campaign.contract_types_display(),
        eligible_workers,
        deliveries_made,
        campaign,
    })
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    state: Option<String>,
}

async fn list(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<CampaignView>>, ProblemResponse> {
    let selector = match query.state.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(CampaignState::parse(raw).ok_or_else(|| {
            bad_request("invalid_parameter", format!("state: unknown value '{raw}'"))
        })?),
        None => None,
    };
    let campaigns = state
        .storage()
        .campaigns()
        .list(selector, state.today())
        .await?;
    let (_, names) = area_catalog(&state).await?;

    let mut views = Vec::with_capacity(campaigns.len());
    for campaign in campaigns {
        views.push(view(&state, campaign, &names).await?);
    }
    Ok(Json(views))
}

async fn detail(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<CampaignView>, ProblemResponse> {
    let campaign = state.storage().campaigns().get(id).await?;
    let (_, names) = area_catalog(&state).await?;
    Ok(Json(view(&state, campaign, &names).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CampaignPayload {
    name: Option<String>,
    #[serde(default, deserialize_with = "crate::workers::nullable")]
    description: Option<Option<String>>,
    branch: Option<String>,
    delivery_mode: Option<DeliveryMode>,
    selected_areas: Option<Vec<String>>,
    contract_types: Option<Vec<ContractType>>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    active: Option<bool>,
}

async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<CampaignPayload>,
) -> Result<(StatusCode, Json<CampaignView>), ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let (Some(start_date), Some(end_date)) = (payload.start_date, payload.end_date) else {
        return Err(bad_request("invalid_dates", "start_date and end_date are required"));
    };
    let branch = payload
        .branch
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| bad_request("unknown_branch", "branch is required"))?;

    let (areas, names) = area_catalog(&state).await?;
    let draft = CampaignDraft {
        name: payload.name.unwrap_or_default(),
        description: payload.description.flatten(),
        branch,
        delivery_mode: payload.delivery_mode.unwrap_or(DeliveryMode::General),
        selected_areas: payload.selected_areas.unwrap_or_default(),
        contract_types: payload.contract_types.unwrap_or_default(),
        start_date,
        end_date,
        active: payload.active.unwrap_or(true),
    }
    .validate(&areas)?;

    let campaign = state
        .storage()
        .campaigns()
        .insert(
            &NewCampaign {
                draft,
                created_by: Some(auth.id()),
            },
            state.now(),
        )
        .await?;
    info!(
        stage = "campaigns",
        campaign_id = campaign.id,
        branch = %campaign.branch,
        "campaign created"
    );
    Ok((StatusCode::CREATED, Json(view(&state, campaign, &names).await?)))
}

async fn update(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<CampaignPayload>,
) -> Result<Json<CampaignView>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let repo = state.storage().campaigns();
    let current = CampaignDraft::from(&repo.get(id).await?);
    let (areas, names) = area_catalog(&state).await?;

    let draft = CampaignDraft {
        name: payload.name.unwrap_or(current.name),
        description: payload.description.unwrap_or(current.description),
        branch: payload.branch.map_or(current.branch, |b| b.trim().to_string()),
        delivery_mode: payload.delivery_mode.unwrap_or(current.delivery_mode),
        selected_areas: payload.selected_areas.unwrap_or(current.selected_areas),
        contract_types: payload.contract_types.unwrap_or(current.contract_types),
        start_date: payload.start_date.unwrap_or(current.start_date),
        end_date: payload.end_date.unwrap_or(current.end_date),
        active: payload.active.unwrap_or(current.active),
    }
    .validate(&areas)?;

    let campaign = repo.update(id, &draft, state.now()).await?;
    Ok(Json(view(&state, campaign, &names).await?))
}

async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    state.storage().campaigns().delete(id).await?;
    info!(stage = "campaigns", campaign_id = id, "campaign deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn set_active(
    state: &AppState,
    auth: &AuthUser,
    id: i64,
    active: bool,
) -> Result<Json<CampaignView>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let campaign = state
        .storage()
        .campaigns()
        .set_active(id, active, state.now())
        .await?;
    info!(stage = "campaigns", campaign_id = id, active, "campaign state changed");
    let (_, names) = area_catalog(state).await?;
    Ok(Json(view(state, campaign, &names).await?))
}

async fn finish(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<CampaignView>, ProblemResponse> {
    set_active(&state, &auth, id, false).await
}

async fn reactivate(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<CampaignView>, ProblemResponse> {
    set_active(&state, &auth, id, true).await
}

#[derive(Debug, Serialize)]
struct CampaignStats {
    campaign: CampaignView,
    eligible_workers: i64,
    deliveries_made: i64,
    pending_deliveries: i64,
    completion_percent: f64,
}

async fn stats(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<CampaignStats>, ProblemResponse> {
    let campaign = state.storage().campaigns().get(id).await?;
    let (_, names) = area_catalog(&state).await?;
    let campaign = view(&state, campaign, &names).await?;
    let eligible = campaign.eligible_workers;
    let made = campaign.deliveries_made;
    Ok(Json(CampaignStats {
        eligible_workers: eligible,
        deliveries_made: made,
        pending_deliveries: (eligible - made).max(0),
        completion_percent: completion_percent(eligible, made),
        campaign,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct CheckWorkerPayload {
    rut: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckWorkerResponse {
    can_withdraw: bool,
    message: String,
    worker: WorkerView,
    #[serde(skip_serializing_if = "Option::is_none")]
    campaign: Option<Campaign>,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_boxes: Option<i64>,
}

async fn check_worker(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(payload): Json<CheckWorkerPayload>,
) -> Result<Json<CheckWorkerResponse>, ProblemResponse> {
    let raw = payload
        .rut
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| bad_request("missing_identifier", "rut is required"))?;
    let rut = normalize_rut(&raw).map_err(|err| bad_request("invalid_rut", err.to_string()))?;
    let worker = state
        .storage()
        .workers()
        .find_by_rut(&rut)
        .await?
        .ok_or_else(|| not_found("worker not found"))?;

    let blocked = |message: &str, worker: WorkerView| CheckWorkerResponse {
        can_withdraw: false,
        message: message.to_string(),
        worker,
        campaign: None,
        available_boxes: None,
    };
    if !worker.active {
        return Ok(Json(blocked("worker is inactive", worker.into())));
    }
    if worker.status == WorkerStatus::Withdrawn {
        return Ok(Json(blocked("worker already withdrew their box", worker.into())));
    }

    let today = state.today();
    let current = state
        .storage()
        .campaigns()
        .list(Some(CampaignState::Current), today)
        .await?;
    let mut first_block = None;
    let mut matched = None;
    for campaign in current {
        match campaign.worker_can_withdraw(&worker, today) {
            Ok(()) => {
                matched = Some(campaign);
                break;
            }
            Err(block) if first_block.is_none() => first_block = Some(block),
            Err(_) => {}
        }
    }

    let Some(campaign) = matched else {
        let message = first_block
            .map(|block| block.to_string())
            .unwrap_or_else(|| "there is no current campaign".to_string());
        return Ok(Json(blocked(&message, worker.into())));
    };

    let available = state
        .storage()
        .boxes()
        .available_for(&worker.branch, worker.contract_type)
        .await?;
    let (can_withdraw, message) = if available > 0 {
        (true, format!("worker can withdraw a box under '{}'", campaign.name))
    } else {
        (false, "no boxes available for this branch and contract type".to_string())
    };
    Ok(Json(CheckWorkerResponse {
        can_withdraw,
        message,
        worker: worker.into(),
        campaign: Some(campaign),
        available_boxes: Some(available),
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::{json, Value};

    use safebox_core::types::{ContractType, Role};

    use crate::test_support::{bearer, seed_box, seed_user, seed_worker, send, setup_state};

    fn campaign_body() -> Value {
        json!({
            "name": " Fiestas Patrias 2025 ",
            "branch": "casablanca",
            "delivery_mode": "group",
            "selected_areas": ["produccion_manufactura", "produccion_manufactura"],
            "contract_types": ["indefinite"],
            "start_date": "2025-03-01",
            "end_date": "2025-03-31",
        })
    }

    #[tokio::test]
    async fn create_validates_and_decorates() {
        let (state, _dir) = setup_state().await;
        let hr = seed_user(&state, "hr", Role::Hr, "casablanca").await;
        let token = bearer(&state, &hr);

        let mut bad = campaign_body();
        bad["end_date"] = json!("2025-02-01");
        let (status, body) =
            send(&state, Method::POST, "/api/campaigns", Some(&token), Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_date_range");

        let mut bad = campaign_body();
        bad["selected_areas"] = json!(["astronomy"]);
        let (status, body) =
            send(&state, Method::POST, "/api/campaigns", Some(&token), Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "unknown_area");

        let (status, body) = send(
            &state,
            Method::POST,
            "/api/campaigns",
            Some(&token),
            Some(campaign_body()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "Fiestas Patrias 2025");
        assert_eq!(body["selected_areas"], json!(["produccion_manufactura"]));
        assert_eq!(body["is_current"], true);
        assert_eq!(body["areas_display"], "Producción y Manufactura");
        assert_eq!(body["contract_types_display"], "Indefinite");
        assert_eq!(body["created_by"], hr.id);

        let id = body["id"].as_i64().expect("id");
        let (status, body) = send(
            &state,
            Method::PATCH,
            &format!("/api/campaigns/{id}"),
            Some(&token),
            Some(json!({"delivery_mode": "general"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["selected_areas"].as_array().map(Vec::len), Some(5));
        assert_eq!(body["areas_display"], "All areas");

        let (status, body) = send(
            &state,
            Method::GET,
            "/api/campaigns?state=sometimes",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["type"], "invalid_parameter");
    }

    #[tokio::test]
    async fn finish_reactivate_and_stats() {
        let (state, _dir) = setup_state().await;
        let hr = seed_user(&state, "hr", Role::Hr, "casablanca").await;
        let guard = seed_user(&state, "guard", Role::Guard, "casablanca").await;
        let token = bearer(&state, &hr);
        let served = seed_worker(&state, "11111111-1", "casablanca", ContractType::Indefinite).await;
        seed_worker(&state, "22222222-2", "casablanca", ContractType::Indefinite).await;
        seed_worker(&state, "33333333-3", "casablanca", ContractType::FixedTerm).await;
        let lot = seed_box(&state, "CB-IND", "casablanca", ContractType::Indefinite, 20).await;
        send(
            &state,
            Method::POST,
            "/api/deliveries",
            Some(&bearer(&state, &guard)),
            Some(json!({"worker_id": served.id, "box_id": lot.id})),
        )
        .await;

        let (_, body) = send(
            &state,
            Method::POST,
            "/api/campaigns",
            Some(&token),
            Some(campaign_body()),
        )
        .await;
        let id = body["id"].as_i64().expect("id");

        let (status, body) = send(
            &state,
            Method::GET,
            &format!("/api/campaigns/{id}/stats"),
            Some(&bearer(&state, &guard)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["eligible_workers"], 2);
        assert_eq!(body["deliveries_made"], 1);
        assert_eq!(body["pending_deliveries"], 1);
        assert_eq!(body["completion_percent"], 50.0);

        let (status, body) = send(
            &state,
            Method::POST,
            &format!("/api/campaigns/{id}/finish"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], false);
        assert_eq!(body["is_current"], false);

        let (_, body) = send(&state, Method::GET, "/api/campaigns?state=current", Some(&token), None).await;
        assert_eq!(body.as_array().map(Vec::len), Some(0));

        let (_, body) = send(
            &state,
            Method::POST,
            &format!("/api/campaigns/{id}/reactivate"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(body["active"], true);

        let (status, _) = send(
            &state,
            Method::DELETE,
            &format!("/api/campaigns/{id}"),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn check_worker_reports_eligibility() {
        let (state, _dir) = setup_state().await;
        let hr = seed_user(&state, "hr", Role::Hr, "casablanca").await;
        let token = bearer(&state, &hr);
        seed_worker(&state, "11111111-1", "casablanca", ContractType::Indefinite).await;
        seed_worker(&state, "33333333-3", "casablanca", ContractType::FixedTerm).await;

        let (status, _) = send(
            &state,
            Method::POST,
            "/api/campaigns/check-worker",
            Some(&token),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &state,
            Method::POST,
            "/api/campaigns/check-worker",
            Some(&token),
            Some(json!({"rut": "99999999-9"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = send(
            &state,
            Method::POST,
            "/api/campaigns/check-worker",
            Some(&token),
            Some(json!({"rut": "11111111-1"})),
        )
        .await;
        assert_eq!(body["can_withdraw"], false);
        assert_eq!(body["message"], "there is no current campaign");

        send(&state, Method::POST, "/api/campaigns", Some(&token), Some(campaign_body())).await;

        let (_, body) = send(
            &state,
            Method::POST,
            "/api/campaigns/check-worker",
            Some(&token),
            Some(json!({"rut": "33333333-3"})),
        )
        .await;
        assert_eq!(body["can_withdraw"], false);
        assert_eq!(body["message"], "this campaign is only for Indefinite contracts");

        let (_, body) = send(
            &state,
            Method::POST,
            "/api/campaigns/check-worker",
            Some(&token),
            Some(json!({"rut": "11111111-1"})),
        )
        .await;
        assert_eq!(body["can_withdraw"], false);
        assert_eq!(body["available_boxes"], 0);

        seed_box(&state, "CB-IND", "casablanca", ContractType::Indefinite, 3).await;
        let (_, body) = send(
            &state,
            Method::POST,
            "/api/campaigns/check-worker",
            Some(&token),
            Some(json!({"rut": "11111111-1"})),
        )
        .await;
        assert_eq!(body["can_withdraw"], true);
        assert_eq!(body["available_boxes"], 3);
        assert_eq!(body["worker"]["full_name"], "Luis Pérez Mora");
    }
}
