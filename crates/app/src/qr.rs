//! Worker QR codes: generation, download, simulated delivery by email and verification.

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::counter;
use qrcode::{render::svg, QrCode};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use safebox_core::qr::{generate_validation_hash, QrPayload};
use safebox_core::rut::{looks_like_rut, normalize_rut};
use safebox_core::types::{QrRecord, QrStatus, Role, Worker};
use safebox_storage::{QrDetail, QrError, WorkerFilter};

use crate::auth::AuthUser;
use crate::problem::{bad_request, internal_error, not_found, ProblemResponse};
use crate::router::AppState;
use crate::workers::WorkerView;

const QR_MIN_DIMENSION: u32 = 240;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/generate/:worker_id", post(generate))
        .route("/download/:worker_id", get(download))
        .route("/send/:worker_id", post(send_one))
        .route("/generate-all", post(generate_all))
        .route("/send-all", post(send_all))
        .route("/verify", post(verify))
}

fn invalid_qr(detail: impl Into<String>) -> ProblemResponse {
    bad_request("invalid_qr", detail)
}

/// Resolves a scanned worker code. Plain RUTs are looked up directly; full payloads must
/// carry the stored validation hash and the worker's RUT.
pub(crate) async fn worker_from_scan(
    state: &AppState,
    raw: &str,
) -> Result<Option<Worker>, ProblemResponse> {
    if looks_like_rut(raw) {
        let rut = normalize_rut(raw).map_err(|err| bad_request("invalid_rut", err.to_string()))?;
        return Ok(state.storage().workers().find_by_rut(&rut).await?);
    }

    let payload = QrPayload::parse(raw).map_err(|err| invalid_qr(err.to_string()))?;
    let Some(worker) = state.storage().workers().find(payload.worker_id).await? else {
        return Ok(None);
    };
    check_payload(state, &payload, &worker).await?;
    Ok(Some(worker))
}

async fn check_payload(
    state: &AppState,
    payload: &QrPayload,
    worker: &Worker,
) -> Result<(), ProblemResponse> {
    let record = state
        .storage()
        .qr_codes()
        .find_by_worker(worker.id)
        .await?
        .ok_or_else(|| invalid_qr("no QR code has been generated for this worker"))?;

    let hash_matches: bool = record
        .validation_hash
        .as_bytes()
        .ct_eq(payload.hash.as_bytes())
        .into();
    if !hash_matches || payload.rut != worker.rut {
        warn!(stage = "qr", worker_id = worker.id, "QR payload failed verification");
        return Err(invalid_qr("QR code does not match the worker's current code"));
    }
    Ok(())
}

fn render_svg(payload: &str) -> Result<String, qrcode::types::QrError> {
    let code = QrCode::new(payload.as_bytes())?;
    Ok(code
        .render::<svg::Color>()
        .min_dimensions(QR_MIN_DIMENSION, QR_MIN_DIMENSION)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

async fn generate_for(state: &AppState, worker: &Worker) -> Result<QrRecord, ProblemResponse> {
    let hash = generate_validation_hash();
    let payload = QrPayload {
        worker_id: worker.id,
        hash: hash.clone(),
        rut: worker.rut.clone(),
    };
    let svg = render_svg(&payload.encode()).map_err(|err| {
        warn!(stage = "qr", worker_id = worker.id, error = %err, "QR rendering failed");
        internal_error("could not render QR code")
    })?;
    let record = state
        .storage()
        .qr_codes()
        .upsert_generated(worker.id, &hash, &svg, state.now())
        .await?;
    counter!("qr_generated_total").increment(1);
    Ok(record)
}

async fn load_worker(state: &AppState, worker_id: i64) -> Result<Worker, ProblemResponse> {
    state
        .storage()
        .workers()
        .find(worker_id)
        .await?
        .ok_or_else(|| not_found("worker not found"))
}

#[derive(Debug, Serialize)]
struct QrWorker {
    id: i64,
    rut: String,
    name: String,
    email: Option<String>,
    active: bool,
}

#[derive(Debug, Serialize)]
struct QrView {
    #[serde(flatten)]
    record: QrRecord,
    worker: QrWorker,
}

impl From<QrDetail> for QrView {
    fn from(detail: QrDetail) -> Self {
        Self {
            worker: QrWorker {
                id: detail.record.worker_id,
                rut: detail.worker_rut,
                name: detail.worker_name,
                email: detail.worker_email,
                active: detail.worker_active,
            },
            record: detail.record,
        }
    }
}

async fn list(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<QrView>>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let rows = state.storage().qr_codes().list().await?;
    Ok(Json(rows.into_iter().map(QrView::from).collect()))
}

#[derive(Debug, Serialize)]
struct QrOutcome {
    message: &'static str,
    worker: String,
    status: QrStatus,
}

async fn generate(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(worker_id): Path<i64>,
) -> Result<Json<QrOutcome>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let worker = load_worker(&state, worker_id).await?;
    let record = generate_for(&state, &worker).await?;
    info!(stage = "qr", worker_id, generated_by = auth.id(), "QR code generated");
    Ok(Json(QrOutcome {
        message: "QR code generated",
        worker: worker.full_name(),
        status: record.status,
    }))
}

async fn download(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(worker_id): Path<i64>,
) -> Result<Response, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let svg = state
        .storage()
        .qr_codes()
        .find_by_worker(worker_id)
        .await?
        .and_then(|record| record.svg)
        .ok_or(QrError::NotGenerated)?;
    let disposition = format!("attachment; filename=\"qr_worker_{worker_id}.svg\"");
    Ok((
        [
            (header::CONTENT_TYPE, "image/svg+xml".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from(svg),
    )
        .into_response())
}

async fn send_one(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(worker_id): Path<i64>,
) -> Result<Json<QrOutcome>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let worker = load_worker(&state, worker_id).await?;
    let record = state
        .storage()
        .qr_codes()
        .mark_sent(worker_id, state.now())
        .await?;
    info!(
        stage = "qr",
        worker_id,
        email = worker.email.as_deref().unwrap_or("-"),
        "QR code sent by email (simulated)"
    );
    Ok(Json(QrOutcome {
        message: "QR code sent by email (simulated)",
        worker: worker.full_name(),
        status: record.status,
    }))
}

#[derive(Debug, Serialize)]
struct GenerateAllOutcome {
    generated: u64,
    errors: u64,
}

async fn generate_all(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<GenerateAllOutcome>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let workers = state
        .storage()
        .workers()
        .list(&WorkerFilter {
            active: Some(true),
            ..WorkerFilter::default()
        })
        .await?;

    let mut outcome = GenerateAllOutcome {
        generated: 0,
        errors: 0,
    };
    for worker in &workers {
        match generate_for(&state, worker).await {
            Ok(_) => outcome.generated += 1,
            Err(err) => {
                warn!(stage = "qr", worker_id = worker.id, error = ?err, "bulk QR generation failed");
                outcome.errors += 1;
            }
        }
    }
    info!(
        stage = "qr",
        generated = outcome.generated,
        errors = outcome.errors,
        "bulk QR generation finished"
    );
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
struct SendAllOutcome {
    sent: u64,
}

async fn send_all(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<SendAllOutcome>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let repo = state.storage().qr_codes();
    let mut sent = 0;
    for record in repo.list_generated().await? {
        match repo.mark_sent(record.worker_id, state.now()).await {
            Ok(_) => sent += 1,
            Err(err) => {
                warn!(stage = "qr", worker_id = record.worker_id, error = %err, "bulk QR send failed")
            }
        }
    }
    info!(stage = "qr", sent, "QR codes sent by email (simulated)");
    Ok(Json(SendAllOutcome { sent }))
}

#[derive(Debug, Deserialize)]
struct VerifyPayload {
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Serialize)]
struct VerifyOutcome {
    valid: bool,
    worker: WorkerView,
}

async fn verify(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<VerifyPayload>,
) -> Result<Json<VerifyOutcome>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let payload = QrPayload::parse(&body.payload).map_err(|err| invalid_qr(err.to_string()))?;
    let worker = load_worker(&state, payload.worker_id).await?;
    check_payload(&state, &payload, &worker).await?;
    Ok(Json(VerifyOutcome {
        valid: true,
        worker: worker.into(),
    }))
}
