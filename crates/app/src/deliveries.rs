//! Box handouts at the gate: recording, checks, supervisor validation and daily figures.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use safebox_core::eligibility::{check_box, check_worker, DeliveryRejection};
use safebox_core::humanize::short_ago;
use safebox_core::types::{ContractType, Delivery, DeliveryStatus, Role, Worker};
use safebox_storage::{DeliveryDetail, DeliveryError, DeliveryFilter, NewDelivery};

use crate::auth::AuthUser;
use crate::boxes::{BranchStock, StockView};
use crate::calendar;
use crate::problem::{bad_request, not_found, ProblemResponse};
use crate::qr::worker_from_scan;
use crate::router::AppState;
use crate::workers::{parse_param, WorkerView};

const RECENT_DELIVERIES: i64 = 5;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/complete", post(complete))
        .route("/today", get(today))
        .route("/guard-stats", get(guard_stats))
        .route("/validate-worker", post(validate_worker))
        .route("/validate-box", post(validate_box))
        .route("/pending-validation", get(pending_validation))
        .route("/daily-report", get(daily_report))
        .route("/:id", get(detail).delete(remove))
        .route("/:id/validate", post(supervisor_validate))
}

#[derive(Debug, Serialize)]
pub struct WorkerSummary {
    pub id: i64,
    pub rut: String,
    pub name: String,
    pub branch: String,
    pub contract_type: ContractType,
}

#[derive(Debug, Serialize)]
pub struct BoxSummary {
    pub id: i64,
    pub code: String,
    pub branch: Option<String>,
    pub contract_type: Option<ContractType>,
}

#[derive(Debug, Serialize)]
pub struct GuardSummary {
    pub id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
}

/// Delivery with the worker, box and guard it refers to.
#[derive(Debug, Serialize)]
pub struct DeliveryView {
    #[serde(flatten)]
    pub delivery: Delivery,
    pub worker: WorkerSummary,
    #[serde(rename = "box")]
    pub lot: Option<BoxSummary>,
    pub guard: Option<GuardSummary>,
}

impl From<DeliveryDetail> for DeliveryView {
    fn from(detail: DeliveryDetail) -> Self {
        let worker = WorkerSummary {
            id: detail.delivery.worker_id,
            rut: detail.worker_rut,
            name: detail.worker_name,
            branch: detail.worker_branch,
            contract_type: detail.worker_contract,
        };
        let lot = match (detail.delivery.box_id, detail.box_code) {
            (Some(id), Some(code)) => Some(BoxSummary {
                id,
                code,
                branch: detail.box_branch,
                contract_type: detail.box_contract,
            }),
            _ => None,
        };
        let guard = detail.delivery.guard_id.map(|id| GuardSummary {
            id,
            username: detail.guard_username,
            name: detail.guard_name,
        });
        Self {
            delivery: detail.delivery,
            worker,
            lot,
            guard,
        }
    }
}

#[derive(Debug, Serialize)]
struct DeliveryList {
    count: usize,
    deliveries: Vec<DeliveryView>,
}

impl From<Vec<DeliveryDetail>> for DeliveryList {
    fn from(rows: Vec<DeliveryDetail>) -> Self {
        Self {
            count: rows.len(),
            deliveries: rows.into_iter().map(DeliveryView::from).collect(),
        }
    }
}

async fn load_view(state: &AppState, id: i64) -> Result<DeliveryView, ProblemResponse> {
    let detail = state
        .storage()
        .deliveries()
        .find(id)
        .await?
        .ok_or_else(|| not_found("delivery not found"))?;
    Ok(detail.into())
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    status: Option<String>,
    guard_id: Option<i64>,
    worker_id: Option<i64>,
    supervisor_validated: Option<bool>,
    branch: Option<String>,
    search: Option<String>,
    limit: Option<i64>,
}

async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeliveryView>>, ProblemResponse> {
    let guard_id = match auth.role() {
        Role::Guard => Some(auth.id()),
        _ => query.guard_id,
    };
    let filter = DeliveryFilter {
        status: parse_param(query.status.as_deref(), "status")?,
        guard_id,
        worker_id: query.worker_id,
        supervisor_validated: query.supervisor_validated,
        branch: query.branch.filter(|b| !b.is_empty()),
        search: query.search,
        limit: query.limit,
        ..DeliveryFilter::default()
    };
    let rows = state.storage().deliveries().list(&filter).await?;
    Ok(Json(rows.into_iter().map(DeliveryView::from).collect()))
}

async fn detail(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<DeliveryView>, ProblemResponse> {
    let view = load_view(&state, id).await?;
    if auth.role() == Role::Guard && view.delivery.guard_id != Some(auth.id()) {
        return Err(not_found("delivery not found"));
    }
    Ok(Json(view))
}

/// Runs the recording transaction and the bookkeeping around it.
async fn record(
    state: &AppState,
    auth: &AuthUser,
    delivery: NewDelivery,
) -> Result<(StatusCode, Json<DeliveryView>), ProblemResponse> {
    let outcome = state
        .storage()
        .deliveries()
        .record(&delivery, state.now())
        .await;
    let recorded = match outcome {
        Ok(recorded) => recorded,
        Err(DeliveryError::Rejected(rejection)) => {
            counter!("deliveries_total", "result" => "rejected").increment(1);
            counter!("delivery_rejections_total", "reason" => rejection.code()).increment(1);
            warn!(
                stage = "delivery",
                worker_id = delivery.worker_id,
                box_id = delivery.box_id,
                guard_id = auth.id(),
                reason = rejection.code(),
                "delivery rejected"
            );
            return Err(rejection.into());
        }
        Err(err) => return Err(err.into()),
    };

    counter!("deliveries_total", "result" => "recorded").increment(1);
    info!(
        stage = "delivery",
        delivery_id = recorded.delivery.id,
        worker_id = recorded.delivery.worker_id,
        box_id = recorded.lot.id,
        remaining = recorded.lot.available_quantity,
        guard_id = auth.id(),
        "delivery recorded"
    );
    if let Some(alert) = recorded.low_stock {
        info!(
            stage = "notify",
            box_id = recorded.lot.id,
            remaining = recorded.lot.available_quantity,
            "low stock alert raised"
        );
        state.hub().publish(alert);
    }

    let view = load_view(state, recorded.delivery.id).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

#[derive(Debug, Deserialize)]
struct CreatePayload {
    worker_id: i64,
    box_id: i64,
    #[serde(default)]
    notes: String,
}

async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<CreatePayload>,
) -> Result<(StatusCode, Json<DeliveryView>), ProblemResponse> {
    let delivery = NewDelivery {
        worker_id: payload.worker_id,
        box_id: payload.box_id,
        guard_id: Some(auth.id()),
        notes: payload.notes,
        worker_qr_code: String::new(),
        box_qr_code: String::new(),
    };
    record(&state, &auth, delivery).await
}

#[derive(Debug, Default, Deserialize)]
struct CompletePayload {
    worker_id: Option<i64>,
    worker_rut: Option<String>,
    worker_qr: Option<String>,
    box_id: Option<i64>,
    box_code: Option<String>,
    box_qr: Option<String>,
    #[serde(default)]
    notes: String,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

async fn complete(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<CompletePayload>,
) -> Result<(StatusCode, Json<DeliveryView>), ProblemResponse> {
    let worker_rut = present(&payload.worker_rut);
    let worker_qr = present(&payload.worker_qr);
    let box_code = present(&payload.box_code);
    let box_qr = present(&payload.box_qr);

    let worker_ids = [payload.worker_id.is_some(), worker_rut.is_some(), worker_qr.is_some()];
    if worker_ids.iter().filter(|given| **given).count() != 1 {
        return Err(bad_request(
            "missing_worker",
            "provide exactly one of worker_id, worker_rut or worker_qr",
        ));
    }
    let box_ids = [payload.box_id.is_some(), box_code.is_some(), box_qr.is_some()];
    if box_ids.iter().filter(|given| **given).count() != 1 {
        return Err(bad_request(
            "missing_box",
            "provide exactly one of box_id, box_code or box_qr",
        ));
    }

    let workers = state.storage().workers();
    let worker = match (payload.worker_id, worker_rut, worker_qr) {
        (Some(id), _, _) => workers.find(id).await?,
        (_, Some(rut), _) => {
            let rut = safebox_core::rut::normalize_rut(rut)
                .map_err(|err| bad_request("invalid_rut", err.to_string()))?;
            workers.find_by_rut(&rut).await?
        }
        (_, _, Some(scan)) => worker_from_scan(&state, scan).await?,
        _ => None,
    }
    .filter(|w| w.active)
    .ok_or_else(|| not_found("worker not found or inactive"))?;

    let boxes = state.storage().boxes();
    let lot = match (payload.box_id, box_code.or(box_qr)) {
        (Some(id), _) => boxes.find(id).await?,
        (_, Some(code)) => boxes.find_by_code(code).await?,
        _ => None,
    }
    .filter(|lot| lot.active)
    .ok_or_else(|| not_found("box lot not found or inactive"))?;

    let delivery = NewDelivery {
        worker_id: worker.id,
        box_id: lot.id,
        guard_id: Some(auth.id()),
        notes: payload.notes,
        worker_qr_code: worker_qr.unwrap_or_default().to_string(),
        box_qr_code: box_qr.unwrap_or_default().to_string(),
    };
    record(&state, &auth, delivery).await
}

async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    state.storage().deliveries().delete(id, state.now()).await?;
    info!(stage = "delivery", delivery_id = id, deleted_by = auth.id(), "delivery deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct TodayView {
    count: usize,
    date: NaiveDate,
    deliveries: Vec<DeliveryView>,
}

async fn today(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<TodayView>, ProblemResponse> {
    let date = state.today();
    let (from, to) = calendar::day_bounds(state.timezone(), date);
    let rows = state
        .storage()
        .deliveries()
        .list(&DeliveryFilter {
            guard_id: Some(auth.id()),
            from: Some(from),
            to: Some(to),
            ..DeliveryFilter::default()
        })
        .await?;
    Ok(Json(TodayView {
        count: rows.len(),
        date,
        deliveries: rows.into_iter().map(DeliveryView::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
struct LastDelivery {
    worker: String,
    delivered_at: chrono::DateTime<Utc>,
    ago: String,
}

#[derive(Debug, Serialize)]
struct RecentDelivery {
    id: i64,
    worker: String,
    worker_rut: String,
    #[serde(rename = "box")]
    lot: String,
    time: String,
    ago: String,
}

#[derive(Debug, Serialize)]
struct GuardStats {
    deliveries_today: i64,
    deliveries_week: i64,
    total_stock: i64,
    stock_by_branch: Vec<BranchStock>,
    pending_incidents: i64,
    last_delivery: Option<LastDelivery>,
    recent_deliveries: Vec<RecentDelivery>,
}

async fn guard_stats(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<GuardStats>, ProblemResponse> {
    let tz = state.timezone();
    let now = state.now();
    let date = state.today();
    let deliveries = state.storage().deliveries();

    let (day_start, day_end) = calendar::day_bounds(tz, date);
    let (week_from, _) = calendar::day_bounds(tz, calendar::week_start(date));
    let deliveries_today = deliveries
        .count_between(day_start, day_end, Some(auth.id()))
        .await?;
    let deliveries_week = deliveries
        .count_between(week_from, day_end, Some(auth.id()))
        .await?;

    let StockView { total, by_branch } =
        StockView::from(state.storage().boxes().stock_summary().await?);
    let pending_incidents = state
        .storage()
        .incidents()
        .count_pending_for_guard(auth.id())
        .await?;

    let last_delivery = deliveries
        .list(&DeliveryFilter {
            guard_id: Some(auth.id()),
            limit: Some(1),
            ..DeliveryFilter::default()
        })
        .await?
        .into_iter()
        .next()
        .map(|row| LastDelivery {
            worker: row.worker_name,
            delivered_at: row.delivery.delivered_at,
            ago: short_ago(now - row.delivery.delivered_at),
        });

    let recent_deliveries = deliveries
        .list(&DeliveryFilter {
            guard_id: Some(auth.id()),
            from: Some(day_start),
            to: Some(day_end),
            limit: Some(RECENT_DELIVERIES),
            ..DeliveryFilter::default()
        })
        .await?
        .into_iter()
        .map(|row| RecentDelivery {
            id: row.delivery.id,
            worker: row.worker_name,
            worker_rut: row.worker_rut,
            lot: row.box_code.unwrap_or_else(|| "N/A".to_string()),
            time: calendar::format_local(tz, row.delivery.delivered_at, "%H:%M"),
            ago: short_ago(now - row.delivery.delivered_at),
        })
        .collect();

    Ok(Json(GuardStats {
        deliveries_today,
        deliveries_week,
        total_stock: total,
        stock_by_branch: by_branch,
        pending_incidents,
        last_delivery,
        recent_deliveries,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ValidateWorkerPayload {
    rut: Option<String>,
    qr_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct WorkerCheck {
    worker: WorkerView,
    last_delivery: Option<DeliveryView>,
    can_receive_box: bool,
}

async fn lookup_worker(
    state: &AppState,
    payload: &ValidateWorkerPayload,
) -> Result<Option<Worker>, ProblemResponse> {
    if let Some(rut) = present(&payload.rut) {
        let rut = safebox_core::rut::normalize_rut(rut)
            .map_err(|err| bad_request("invalid_rut", err.to_string()))?;
        return Ok(state.storage().workers().find_by_rut(&rut).await?);
    }
    match present(&payload.qr_code) {
        Some(scan) => worker_from_scan(state, scan).await,
        None => Err(bad_request("missing_identifier", "rut or qr_code is required")),
    }
}

async fn validate_worker(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(payload): Json<ValidateWorkerPayload>,
) -> Result<Json<WorkerCheck>, ProblemResponse> {
    let worker = lookup_worker(&state, &payload)
        .await?
        .filter(|w| w.active)
        .ok_or_else(|| not_found("worker not found or inactive"))?;

    let deliveries = state.storage().deliveries();
    let has_active = deliveries.has_active_for_worker(worker.id).await?;
    let last_delivery = deliveries
        .latest_for_worker(worker.id)
        .await?
        .map(DeliveryView::from);

    if let Err(rejection) = check_worker(&worker, has_active) {
        let details = json!({
            "worker": WorkerView::from(worker),
            "last_delivery": last_delivery,
        });
        return Err(bad_request(rejection.code(), rejection.to_string()).with_extra(details));
    }

    Ok(Json(WorkerCheck {
        worker: worker.into(),
        last_delivery,
        can_receive_box: true,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct ValidateBoxPayload {
    code: Option<String>,
    qr_code: Option<String>,
    branch: Option<String>,
}

async fn validate_box(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(payload): Json<ValidateBoxPayload>,
) -> Result<Json<safebox_core::types::BoxLot>, ProblemResponse> {
    let code = present(&payload.code)
        .or(present(&payload.qr_code))
        .ok_or_else(|| bad_request("missing_identifier", "code or qr_code is required"))?;
    let lot = state
        .storage()
        .boxes()
        .find_by_code(code)
        .await?
        .filter(|lot| lot.active)
        .ok_or_else(|| not_found("box lot not found or inactive"))?;

    check_box(&lot, present(&payload.branch)).map_err(|rejection: DeliveryRejection| {
        bad_request(rejection.code(), rejection.to_string())
    })?;
    Ok(Json(lot))
}

#[derive(Debug, Default, Deserialize)]
struct ValidationPayload {
    comment: Option<String>,
}

async fn supervisor_validate(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    payload: Option<Json<ValidationPayload>>,
) -> Result<Json<DeliveryView>, ProblemResponse> {
    auth.require(&[Role::Supervisor])?;
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    state
        .storage()
        .deliveries()
        .validate(id, auth.id(), payload.comment.as_deref(), state.now())
        .await?;
    info!(stage = "delivery", delivery_id = id, supervisor_id = auth.id(), "delivery validated");
    Ok(Json(load_view(&state, id).await?))
}

async fn pending_validation(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<DeliveryList>, ProblemResponse> {
    auth.require(&[Role::Supervisor, Role::Hr])?;
    let rows = state
        .storage()
        .deliveries()
        .list(&DeliveryFilter {
            status: Some(DeliveryStatus::Delivered),
            supervisor_validated: Some(false),
            ..DeliveryFilter::default()
        })
        .await?;
    Ok(Json(rows.into()))
}

#[derive(Debug, Default, Deserialize)]
struct ReportQuery {
    date: Option<String>,
}

#[derive(Debug, Serialize)]
struct Bucket {
    key: String,
    count: usize,
}

#[derive(Debug, Serialize)]
struct DailyReport {
    date: NaiveDate,
    total: usize,
    validated: usize,
    pending_validation: usize,
    by_guard: Vec<Bucket>,
    by_branch: Vec<Bucket>,
    by_contract_type: Vec<Bucket>,
}

fn buckets<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<Bucket> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for key in keys {
        *counts.entry(key).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(key, count)| Bucket {
            key: key.to_string(),
            count,
        })
        .collect()
}

async fn daily_report(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ReportQuery>,
) -> Result<Json<DailyReport>, ProblemResponse> {
    auth.require(&[Role::Supervisor, Role::Hr])?;
    let date = match query.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| bad_request("invalid_date", format!("'{raw}' is not a YYYY-MM-DD date")))?,
        None => state.today(),
    };
    let (from, to) = calendar::day_bounds(state.timezone(), date);
    let rows = state
        .storage()
        .deliveries()
        .list(&DeliveryFilter {
            from: Some(from),
            to: Some(to),
            ..DeliveryFilter::default()
        })
        .await?;

    let validated = rows.iter().filter(|r| r.delivery.supervisor_validated).count();
    Ok(Json(DailyReport {
        date,
        total: rows.len(),
        validated,
        pending_validation: rows.len() - validated,
        by_guard: buckets(
            rows.iter()
                .map(|r| r.guard_username.as_deref().unwrap_or("N/A")),
        ),
        by_branch: buckets(rows.iter().map(|r| r.worker_branch.as_str())),
        by_contract_type: buckets(rows.iter().map(|r| r.worker_contract.as_str())),
    }))
}
