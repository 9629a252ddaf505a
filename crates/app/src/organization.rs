//! Branch and area catalogs. Both share one handler set, parameterized by [`Catalog`].

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use safebox_core::catalog::{self, Deactivation};
use safebox_core::types::Role;
use safebox_storage::{CatalogEntry, CatalogError, CatalogSummary, Database, NewCatalogEntry};

use crate::auth::AuthUser;
use crate::problem::{bad_request, conflict, internal_error, ProblemResponse};
use crate::router::AppState;

trait Catalog: Send + Sync + 'static {
    const LABEL: &'static str;

    fn repository(db: &Database) -> safebox_storage::CatalogRepository;

    fn to_json(entry: CatalogEntry) -> Result<Value, serde_json::Error>;
}

struct Branches;
struct Areas;

impl Catalog for Branches {
    const LABEL: &'static str = "branch";

    fn repository(db: &Database) -> safebox_storage::CatalogRepository {
        db.branches()
    }

    fn to_json(entry: CatalogEntry) -> Result<Value, serde_json::Error> {
        serde_json::to_value(entry.into_branch())
    }
}

impl Catalog for Areas {
    const LABEL: &'static str = "area";

    fn repository(db: &Database) -> safebox_storage::CatalogRepository {
        db.areas()
    }

    fn to_json(entry: CatalogEntry) -> Result<Value, serde_json::Error> {
        serde_json::to_value(entry.into_area())
    }
}

pub fn branch_routes() -> Router<AppState> {
    catalog_routes::<Branches>()
}

pub fn area_routes() -> Router<AppState> {
    catalog_routes::<Areas>()
}

fn catalog_routes<C: Catalog>() -> Router<AppState> {
    Router::new()
        .route("/", get(list::<C>).post(create::<C>))
        .route(
            "/:id",
            get(detail::<C>).patch(update::<C>).delete(remove::<C>),
        )
        .route("/:id/activate", post(activate::<C>))
        .route("/:id/deactivate", post(deactivate::<C>))
}

fn render<C: Catalog>(entry: CatalogEntry, extra: Value) -> Result<Value, ProblemResponse> {
    let mut value = C::to_json(entry).map_err(|err| {
        error!(stage = "catalog", error = %err, "failed to serialize catalog entry");
        internal_error("failed to serialize catalog entry")
    })?;
    if let (Some(target), Value::Object(extra)) = (value.as_object_mut(), extra) {
        target.extend(extra);
    }
    Ok(value)
}

fn render_summary<C: Catalog>(summary: CatalogSummary) -> Result<Value, ProblemResponse> {
    let deactivation = Deactivation::evaluate(summary.total_workers, summary.active_campaigns);
    render::<C>(
        summary.entry,
        json!({
            "total_workers": summary.total_workers,
            "total_inactive_workers": summary.total_inactive_workers,
            "active_campaigns": summary.active_campaigns,
            "can_deactivate": deactivation,
        }),
    )
}

async fn find_or_404<C: Catalog>(state: &AppState, id: i64) -> Result<CatalogEntry, ProblemResponse> {
    C::repository(state.storage())
        .find(id)
        .await?
        .ok_or_else(|| CatalogError::NotFound.into())
}

/// Refuses with 409 while active workers or campaigns still point at `code`.
async fn ensure_can_deactivate<C: Catalog>(
    state: &AppState,
    code: &str,
) -> Result<(), ProblemResponse> {
    let (workers, campaigns) = C::repository(state.storage()).usage(code).await?;
    let outcome = Deactivation::evaluate(workers, campaigns);
    if outcome.allowed {
        return Ok(());
    }
    Err(conflict(
        "in_use",
        format!(
            "{} '{code}' {}",
            C::LABEL,
            outcome.reason.unwrap_or_default()
        ),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    active: Option<bool>,
}

async fn list<C: Catalog>(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Value>>, ProblemResponse> {
    let summaries = C::repository(state.storage()).list(query.active).await?;
    let items = summaries
        .into_iter()
        .map(render_summary::<C>)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(items))
}

async fn detail<C: Catalog>(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ProblemResponse> {
    let entry = find_or_404::<C>(&state, id).await?;
    let (workers, campaigns) = C::repository(state.storage()).usage(&entry.code).await?;
    let value = render::<C>(
        entry,
        json!({
            "total_workers": workers,
            "active_campaigns": campaigns,
            "can_deactivate": Deactivation::evaluate(workers, campaigns),
        }),
    )?;
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
struct CatalogPayload {
    name: Option<String>,
    code: Option<String>,
    #[serde(alias = "address", alias = "description")]
    detail: Option<String>,
    active: Option<bool>,
}

fn rule_error(err: catalog::CatalogError) -> ProblemResponse {
    let problem_type = match err {
        catalog::CatalogError::EmptyName => "invalid_name",
        catalog::CatalogError::EmptyCode | catalog::CatalogError::InvalidCode(_) => "invalid_code",
    };
    bad_request(problem_type, err.to_string())
}

fn clean_detail(detail: Option<String>) -> Option<String> {
    detail.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

async fn create<C: Catalog>(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<CatalogPayload>,
) -> Result<(StatusCode, Json<Value>), ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let name = catalog::normalize_name(payload.name.as_deref().unwrap_or_default())
        .map_err(rule_error)?;
    let code = catalog::normalize_code(payload.code.as_deref().unwrap_or_default())
        .map_err(rule_error)?;

    let entry = C::repository(state.storage())
        .insert(
            &NewCatalogEntry {
                name,
                code,
                detail: clean_detail(payload.detail),
                active: payload.active.unwrap_or(true),
                created_by: Some(auth.id()),
            },
            state.now(),
        )
        .await?;
    info!(stage = "catalog", kind = C::LABEL, code = %entry.code, "catalog entry created");
    Ok((StatusCode::CREATED, Json(render::<C>(entry, json!({}))?)))
}

async fn update<C: Catalog>(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<CatalogPayload>,
) -> Result<Json<Value>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let current = find_or_404::<C>(&state, id).await?;

    let name = match payload.name.as_deref() {
        Some(raw) => catalog::normalize_name(raw).map_err(rule_error)?,
        None => current.name.clone(),
    };
    let code = match payload.code.as_deref() {
        Some(raw) => catalog::normalize_code(raw).map_err(rule_error)?,
        None => current.code.clone(),
    };
    let active = payload.active.unwrap_or(current.active);
    if current.active && !active {
        ensure_can_deactivate::<C>(&state, &current.code).await?;
    }
    let detail = match payload.detail {
        Some(detail) => clean_detail(Some(detail)),
        None => current.detail.clone(),
    };

    let entry = C::repository(state.storage())
        .update(
            id,
            &NewCatalogEntry {
                name,
                code,
                detail,
                active,
                created_by: current.created_by,
            },
            state.now(),
        )
        .await?;
    Ok(Json(render::<C>(entry, json!({}))?))
}

async fn remove<C: Catalog>(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let entry = find_or_404::<C>(&state, id).await?;
    ensure_can_deactivate::<C>(&state, &entry.code).await?;
    C::repository(state.storage()).delete(id).await?;
    info!(stage = "catalog", kind = C::LABEL, code = %entry.code, "catalog entry deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn activate<C: Catalog>(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let entry = C::repository(state.storage())
        .set_active(id, true, state.now())
        .await?;
    Ok(Json(render::<C>(entry, json!({}))?))
}

async fn deactivate<C: Catalog>(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let entry = find_or_404::<C>(&state, id).await?;
    ensure_can_deactivate::<C>(&state, &entry.code).await?;
    let entry = C::repository(state.storage())
        .set_active(id, false, state.now())
        .await?;
    Ok(Json(render::<C>(entry, json!({}))?))
}
