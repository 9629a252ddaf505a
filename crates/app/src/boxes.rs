use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use safebox_core::types::{BoxLot, ContractType, Role};
use safebox_storage::{BoxFilter, NewBox, StockSummary};

use crate::auth::AuthUser;
use crate::problem::{bad_request, not_found, ProblemResponse};
use crate::router::AppState;
use crate::workers::parse_param;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/stock", get(stock))
        .route("/:id", get(detail).patch(update).delete(remove))
        .route("/:id/restock", post(restock))
}

#[derive(Debug, Serialize)]
pub struct BranchStock {
    pub code: String,
    pub name: String,
    pub stock: i64,
}

#[derive(Debug, Serialize)]
pub struct StockView {
    pub total: i64,
    pub by_branch: Vec<BranchStock>,
}

impl From<StockSummary> for StockView {
    fn from(summary: StockSummary) -> Self {
        Self {
            total: summary.total,
            by_branch: summary
                .by_branch
                .into_iter()
                .map(|(code, name, stock)| BranchStock { code, name, stock })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    branch: Option<String>,
    contract_type: Option<String>,
    active: Option<bool>,
}

async fn list(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BoxLot>>, ProblemResponse> {
    let filter = BoxFilter {
        branch: query.branch.filter(|b| !b.is_empty()),
        contract_type: parse_param(query.contract_type.as_deref(), "contract_type")?,
        active: query.active,
    };
    Ok(Json(state.storage().boxes().list(&filter).await?))
}

async fn detail(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<BoxLot>, ProblemResponse> {
    let lot = state
        .storage()
        .boxes()
        .find(id)
        .await?
        .ok_or_else(|| not_found("box lot not found"))?;
    Ok(Json(lot))
}

async fn stock(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<StockView>, ProblemResponse> {
    let summary = state.storage().boxes().stock_summary().await?;
    Ok(Json(summary.into()))
}

#[derive(Debug, Default, Deserialize)]
struct BoxPayload {
    code: Option<String>,
    contract_type: Option<ContractType>,
    branch: Option<String>,
    available_quantity: Option<i64>,
    active: Option<bool>,
}

fn validate(lot: NewBox) -> Result<NewBox, ProblemResponse> {
    let code = lot.code.trim().to_string();
    if code.is_empty() {
        return Err(bad_request("invalid_code", "box code is required"));
    }
    if lot.available_quantity < 0 {
        return Err(bad_request(
            "negative_stock",
            "available quantity cannot be negative",
        ));
    }
    Ok(NewBox {
        code,
        branch: lot.branch.trim().to_string(),
        ..lot
    })
}

async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<BoxPayload>,
) -> Result<(StatusCode, Json<BoxLot>), ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let contract_type = payload
        .contract_type
        .ok_or_else(|| bad_request("invalid_contract_type", "contract_type is required"))?;
    let lot = validate(NewBox {
        code: payload.code.unwrap_or_default(),
        contract_type,
        branch: payload.branch.unwrap_or_default(),
        available_quantity: payload.available_quantity.unwrap_or(0),
        active: payload.active.unwrap_or(true),
    })?;

    let created = state.storage().boxes().insert(&lot, state.now()).await?;
    info!(stage = "boxes", box_id = created.id, code = %created.code, "box lot created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<BoxPayload>,
) -> Result<Json<BoxLot>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let repo = state.storage().boxes();
    let current = repo
        .find(id)
        .await?
        .ok_or_else(|| not_found("box lot not found"))?;
    let current = NewBox::from(&current);

    let lot = validate(NewBox {
        code: payload.code.unwrap_or(current.code),
        contract_type: payload.contract_type.unwrap_or(current.contract_type),
        branch: payload.branch.unwrap_or(current.branch),
        available_quantity: payload
            .available_quantity
            .unwrap_or(current.available_quantity),
        active: payload.active.unwrap_or(current.active),
    })?;
    Ok(Json(repo.update(id, &lot).await?))
}

async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    state.storage().boxes().delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RestockPayload {
    quantity: i64,
}

async fn restock(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<RestockPayload>,
) -> Result<Json<BoxLot>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    if payload.quantity <= 0 {
        return Err(bad_request("invalid_quantity", "quantity must be greater than zero"));
    }
    let lot = state.storage().boxes().restock(id, payload.quantity).await?;
    info!(
        stage = "boxes",
        box_id = lot.id,
        added = payload.quantity,
        available = lot.available_quantity,
        "box lot restocked"
    );
    Ok(Json(lot))
}
