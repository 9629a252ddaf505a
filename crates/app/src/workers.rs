use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use safebox_core::rut::normalize_rut;
use safebox_core::types::{ContractType, Role, Worker, WorkerStatus};
use safebox_storage::{NewWorker, WorkerError, WorkerFilter, WorkerOrdering};

use crate::auth::AuthUser;
use crate::problem::{bad_request, ProblemResponse};
use crate::router::AppState;

const MAX_IMPORT_ERROR_DETAILS: usize = 20;

/// Worker as rendered by the API.
#[derive(Debug, Serialize)]
pub struct WorkerView {
    #[serde(flatten)]
    pub worker: Worker,
    pub full_name: String,
}

impl From<Worker> for WorkerView {
    fn from(worker: Worker) -> Self {
        let full_name = worker.full_name();
        Self { worker, full_name }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/import", post(import))
        .route("/:id", get(detail).patch(update).delete(remove))
}

/// Parses an optional wire enum query value, answering 400 on unknown values.
pub(crate) fn parse_param<T>(raw: Option<&str>, field: &str) -> Result<Option<T>, ProblemResponse>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|err| bad_request("invalid_parameter", format!("{field}: {err}"))),
        None => Ok(None),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    branch: Option<String>,
    contract_type: Option<String>,
    active: Option<bool>,
    status: Option<String>,
    area: Option<String>,
    search: Option<String>,
    ordering: Option<String>,
}

async fn list(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<WorkerView>>, ProblemResponse> {
    let ordering = match query.ordering.as_deref() {
        Some(raw) => WorkerOrdering::parse(raw).ok_or_else(|| {
            bad_request("invalid_parameter", format!("ordering: unknown value '{raw}'"))
        })?,
        None => WorkerOrdering::default(),
    };
    let filter = WorkerFilter {
        branch: query.branch.filter(|b| !b.is_empty()),
        contract_type: parse_param(query.contract_type.as_deref(), "contract_type")?,
        active: query.active,
        status: parse_param(query.status.as_deref(), "status")?,
        area: query.area.filter(|a| !a.is_empty()),
        search: query.search,
        ordering,
    };
    let workers = state.storage().workers().list(&filter).await?;
    Ok(Json(workers.into_iter().map(WorkerView::from).collect()))
}

async fn detail(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<WorkerView>, ProblemResponse> {
    let worker = state.storage().workers().get(id).await?;
    Ok(Json(worker.into()))
}

#[derive(Debug, Default, Deserialize)]
struct WorkerPayload {
    rut: Option<String>,
    first_name: Option<String>,
    paternal_surname: Option<String>,
    maternal_surname: Option<String>,
    position: Option<String>,
    contract_type: Option<ContractType>,
    period: Option<String>,
    branch: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    area: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    email: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    phone: Option<Option<String>>,
    status: Option<WorkerStatus>,
    active: Option<bool>,
}

/// Keeps an explicit `null` apart from an absent field.
pub(crate) fn nullable<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

fn trimmed(value: String) -> String {
    value.trim().to_string()
}

fn optional(value: Option<String>) -> Option<String> {
    value.map(trimmed).filter(|v| !v.is_empty())
}

fn validate(worker: NewWorker) -> Result<NewWorker, ProblemResponse> {
    let rut = normalize_rut(&worker.rut).map_err(|err| bad_request("invalid_rut", err.to_string()))?;
    if worker.first_name.is_empty() || worker.paternal_surname.is_empty() {
        return Err(bad_request(
            "invalid_name",
            "first name and paternal surname are required",
        ));
    }
    if worker.branch.is_empty() {
        return Err(bad_request("invalid_branch", "branch is required"));
    }
    Ok(NewWorker { rut, ..worker })
}

async fn create(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<WorkerPayload>,
) -> Result<(StatusCode, Json<WorkerView>), ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let contract_type = payload
        .contract_type
        .ok_or_else(|| bad_request("invalid_contract_type", "contract_type is required"))?;

    let worker = validate(NewWorker {
        rut: payload.rut.unwrap_or_default(),
        first_name: payload.first_name.map(trimmed).unwrap_or_default(),
        paternal_surname: payload.paternal_surname.map(trimmed).unwrap_or_default(),
        maternal_surname: payload.maternal_surname.map(trimmed).unwrap_or_default(),
        position: payload.position.map(trimmed).unwrap_or_default(),
        contract_type,
        period: payload
            .period
            .map(trimmed)
            .unwrap_or_else(|| state.today().year().to_string()),
        branch: payload.branch.map(trimmed).unwrap_or_default(),
        area: optional(payload.area.flatten()),
        email: optional(payload.email.flatten()),
        phone: optional(payload.phone.flatten()),
        status: payload.status.unwrap_or(WorkerStatus::Pending),
        active: payload.active.unwrap_or(true),
    })?;

    let created = state.storage().workers().insert(&worker, state.now()).await?;
    info!(stage = "workers", worker_id = created.id, rut = %created.rut, "worker created");
    Ok((StatusCode::CREATED, Json(created.into())))
}

async fn update(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<WorkerPayload>,
) -> Result<Json<WorkerView>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let repo = state.storage().workers();
    let current = NewWorker::from(&repo.get(id).await?);

    let worker = validate(NewWorker {
        rut: payload.rut.unwrap_or(current.rut),
        first_name: payload.first_name.map_or(current.first_name, trimmed),
        paternal_surname: payload.paternal_surname.map_or(current.paternal_surname, trimmed),
        maternal_surname: payload.maternal_surname.map_or(current.maternal_surname, trimmed),
        position: payload.position.map_or(current.position, trimmed),
        contract_type: payload.contract_type.unwrap_or(current.contract_type),
        period: payload.period.map_or(current.period, trimmed),
        branch: payload.branch.map_or(current.branch, trimmed),
        area: payload.area.map_or(current.area, optional),
        email: payload.email.map_or(current.email, optional),
        phone: payload.phone.map_or(current.phone, optional),
        status: payload.status.unwrap_or(current.status),
        active: payload.active.unwrap_or(current.active),
    })?;

    let updated = repo.update(id, &worker, state.now()).await?;
    Ok(Json(updated.into()))
}

async fn remove(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    state.storage().workers().delete(id).await?;
    info!(stage = "workers", worker_id = id, deleted_by = auth.id(), "worker deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Columns understood by the importer, keyed by every accepted header spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    Rut,
    FirstName,
    PaternalSurname,
    MaternalSurname,
    Email,
    Phone,
    Position,
    Area,
    ContractType,
    Branch,
    Period,
}

impl Column {
    fn from_header(header: &str) -> Option<Self> {
        let column = match header.trim().to_lowercase().as_str() {
            "rut" => Self::Rut,
            "nombre" | "first_name" => Self::FirstName,
            "apellido_paterno" | "paternal_surname" => Self::PaternalSurname,
            "apellido_materno" | "maternal_surname" => Self::MaternalSurname,
            "email" | "correo" => Self::Email,
            "telefono" | "teléfono" | "phone" => Self::Phone,
            "cargo" | "position" => Self::Position,
            "departamento" | "area" => Self::Area,
            "tipo_contrato" | "contract_type" => Self::ContractType,
            "sede" | "branch" => Self::Branch,
            "periodo" | "period" => Self::Period,
            _ => return None,
        };
        Some(column)
    }
}

#[derive(Debug, Serialize)]
struct ImportRowError {
    row: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    rut: Option<String>,
    error: String,
}

#[derive(Debug, Default, Serialize)]
struct ImportSummary {
    created: u64,
    updated: u64,
    errors: usize,
    error_details: Vec<ImportRowError>,
    more_errors: bool,
}

impl ImportSummary {
    fn push_error(&mut self, row: usize, rut: Option<String>, error: String) {
        self.errors += 1;
        if self.error_details.len() < MAX_IMPORT_ERROR_DETAILS {
            self.error_details.push(ImportRowError { row, rut, error });
        } else {
            self.more_errors = true;
        }
    }
}

async fn import(
    State(state): State<AppState>,
    auth: AuthUser,
    body: String,
) -> Result<Json<ImportSummary>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(body.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| bad_request("invalid_csv", format!("unreadable header row: {err}")))?
        .clone();
    let columns: HashMap<Column, usize> = headers
        .iter()
        .enumerate()
        .filter_map(|(index, header)| Column::from_header(header).map(|column| (column, index)))
        .collect();
    for required in [Column::Rut, Column::FirstName, Column::PaternalSurname] {
        if !columns.contains_key(&required) {
            return Err(bad_request(
                "invalid_csv",
                "header must include rut, nombre and apellido_paterno",
            ));
        }
    }

    let default_period = state.today().year().to_string();
    let mut summary = ImportSummary::default();

    for (index, record) in reader.records().enumerate() {
        let row = index + 2;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                summary.push_error(row, None, format!("unreadable row: {err}"));
                continue;
            }
        };
        let field = |column: Column| -> String {
            columns
                .get(&column)
                .and_then(|&i| record.get(i))
                .unwrap_or_default()
                .to_string()
        };
        let raw_rut = field(Column::Rut);
        if raw_rut.is_empty() && record.iter().all(str::is_empty) {
            continue;
        }

        let worker = match import_row(&state, &field, &default_period).await {
            Ok(worker) => worker,
            Err(message) => {
                let rut = Some(raw_rut).filter(|r| !r.is_empty());
                summary.push_error(row, rut, message);
                continue;
            }
        };
        let outcome = state.storage().workers().upsert_by_rut(&worker, state.now()).await;
        match outcome {
            Ok((_, true)) => summary.created += 1,
            Ok((_, false)) => summary.updated += 1,
            Err(WorkerError::Database(err)) => {
                warn!(stage = "workers", row, error = %err, "import row failed");
                summary.push_error(row, Some(worker.rut), "database error".to_string());
            }
            Err(err) => summary.push_error(row, Some(worker.rut), err.to_string()),
        }
    }

    info!(
        stage = "workers",
        created = summary.created,
        updated = summary.updated,
        errors = summary.errors,
        imported_by = auth.id(),
        "worker import finished"
    );
    Ok(Json(summary))
}

/// Builds one worker from a CSV row, resolving branch and area by code or name.
async fn import_row(
    state: &AppState,
    field: &impl Fn(Column) -> String,
    default_period: &str,
) -> Result<NewWorker, String> {
    let rut = normalize_rut(&field(Column::Rut)).map_err(|err| err.to_string())?;

    let contract_raw = field(Column::ContractType);
    let contract_type = contract_raw
        .to_lowercase()
        .replace(' ', "_")
        .parse::<ContractType>()
        .map_err(|_| format!("unknown contract type '{contract_raw}'"))?;

    let branch_raw = field(Column::Branch);
    let branch = state
        .storage()
        .branches()
        .resolve(&branch_raw)
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("unknown branch '{branch_raw}'"))?;

    let area_raw = field(Column::Area);
    let area = if area_raw.is_empty() {
        None
    } else {
        let entry = state
            .storage()
            .areas()
            .resolve(&area_raw)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("unknown area '{area_raw}'"))?;
        Some(entry.code)
    };

    let period = Some(field(Column::Period))
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| default_period.to_string());

    let worker = NewWorker {
        rut,
        first_name: field(Column::FirstName),
        paternal_surname: field(Column::PaternalSurname),
        maternal_surname: field(Column::MaternalSurname),
        position: field(Column::Position),
        contract_type,
        period,
        branch: branch.code,
        area,
        email: Some(field(Column::Email)).filter(|v| !v.is_empty()),
        phone: Some(field(Column::Phone)).filter(|v| !v.is_empty()),
        status: WorkerStatus::Pending,
        active: true,
    };
    if worker.first_name.is_empty() || worker.paternal_surname.is_empty() {
        return Err("first name and paternal surname are required".to_string());
    }
    Ok(worker)
}
