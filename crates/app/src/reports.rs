use std::collections::HashMap;

use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use safebox_core::types::Role;
use safebox_storage::{DeliveryDetail, DeliveryFilter};

use crate::auth::AuthUser;
use crate::calendar;
use crate::problem::{internal_error, ProblemResponse};
use crate::router::AppState;

const REPORT_ROLES: &[Role] = &[Role::Supervisor, Role::Hr];
const MISSING: &str = "N/A";
const CSV_HEADER: [&str; 6] = ["RUT", "Name", "Branch", "Box", "Guard", "Date"];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/deliveries", get(deliveries))
        .route("/export/csv", get(export_csv))
}

#[derive(Debug, Default, Deserialize)]
struct ReportQuery {
    search: Option<String>,
    branch: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReportRow {
    id: i64,
    rut: String,
    name: String,
    branch: String,
    #[serde(rename = "box")]
    lot: String,
    guard: String,
    date: String,
}

impl ReportRow {
    fn record(&self) -> [&str; 6] {
        [
            self.rut.as_str(),
            self.name.as_str(),
            self.branch.as_str(),
            self.lot.as_str(),
            self.guard.as_str(),
            self.date.as_str(),
        ]
    }
}

/// Report rows ordered newest first. The branch filter applies to the worker's branch and
/// accepts a branch code or name.
async fn report_rows(state: &AppState, query: &ReportQuery) -> Result<Vec<ReportRow>, ProblemResponse> {
    let branches = state.storage().branches();
    let branch = match query.branch.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        Some(raw) => match branches.resolve(raw).await? {
            Some(entry) => Some(entry.code),
            None => return Ok(Vec::new()),
        },
        None => None,
    };
    let names: HashMap<String, String> = branches
        .list(None)
        .await?
        .into_iter()
        .map(|summary| (summary.entry.code, summary.entry.name))
        .collect();

    let details = state
        .storage()
        .deliveries()
        .list(&DeliveryFilter {
            search: query.search.clone(),
            ..DeliveryFilter::default()
        })
        .await?;

    let timezone = state.timezone();
    Ok(details
        .into_iter()
        .filter(|detail| branch.as_ref().map_or(true, |code| &detail.worker_branch == code))
        .map(|detail: DeliveryDetail| ReportRow {
            id: detail.delivery.id,
            branch: names
                .get(&detail.worker_branch)
                .cloned()
                .unwrap_or(detail.worker_branch),
            rut: detail.worker_rut,
            name: detail.worker_name,
            lot: detail.box_code.unwrap_or_else(|| MISSING.to_string()),
            guard: detail.guard_username.unwrap_or_else(|| MISSING.to_string()),
            date: calendar::format_local(timezone, detail.delivery.delivered_at, "%Y-%m-%d %H:%M"),
        })
        .collect())
}

async fn deliveries(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ReportQuery>,
) -> Result<Json<Vec<ReportRow>>, ProblemResponse> {
    auth.require(REPORT_ROLES)?;
    Ok(Json(report_rows(&state, &query).await?))
}

fn write_csv(rows: &[ReportRow]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for row in rows {
        writer.write_record(row.record())?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

async fn export_csv(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ReportQuery>,
) -> Result<Response, ProblemResponse> {
    auth.require(REPORT_ROLES)?;
    let rows = report_rows(&state, &query).await?;
    let bytes = write_csv(&rows).map_err(|err| {
        warn!(stage = "report", error = %err, "CSV export failed");
        internal_error("could not build CSV export")
    })?;
    info!(stage = "report", rows = rows.len(), user_id = auth.id(), "delivery report exported");

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"delivery_report.csv\"",
            ),
        ],
        Body::from(bytes),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Method, StatusCode},
    };
    use serde_json::json;

    use safebox_core::types::{ContractType, Role};

    use crate::router::AppState;
    use crate::test_support::{bearer, seed_box, seed_user, seed_worker, send, send_raw, setup_state};

    async fn seed_deliveries(state: &AppState) -> String {
        let guard = seed_user(state, "gate1", Role::Guard, "casablanca").await;
        let token = bearer(state, &guard);
        let first = seed_worker(state, "11111111-1", "casablanca", ContractType::Indefinite).await;
        let second = seed_worker(state, "22222222-2", "valparaiso_bif", ContractType::Indefinite).await;
        let cb = seed_box(state, "CB-IND", "casablanca", ContractType::Indefinite, 20).await;
        let bif = seed_box(state, "BIF-IND", "valparaiso_bif", ContractType::Indefinite, 20).await;
        for (worker, lot) in [(&first, &cb), (&second, &bif)] {
            let (status, _) = send(
                state,
                Method::POST,
                "/api/deliveries",
                Some(&token),
                Some(json!({"worker_id": worker.id, "box_id": lot.id})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
        token
    }

    #[tokio::test]
    async fn delivery_report_filters_by_branch_and_search() {
        let (state, _dir) = setup_state().await;
        let guard_token = seed_deliveries(&state).await;
        let supervisor = seed_user(&state, "boss", Role::Supervisor, "casablanca").await;
        let token = bearer(&state, &supervisor);

        let (status, _) = send(&state, Method::GET, "/api/reports/deliveries", Some(&guard_token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(&state, Method::GET, "/api/reports/deliveries", Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(2));

        let (_, body) = send(
            &state,
            Method::GET,
            "/api/reports/deliveries?branch=casablanca",
            Some(&token),
            None,
        )
        .await;
        let rows = body.as_array().expect("array");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["rut"], "11111111-1");
        assert_eq!(rows[0]["name"], "Luis Pérez Mora");
        assert_eq!(rows[0]["branch"], "Casablanca");
        assert_eq!(rows[0]["box"], "CB-IND");
        assert_eq!(rows[0]["guard"], "gate1");
        assert_eq!(rows[0]["date"], "2025-03-10 12:00");

        let (_, body) = send(
            &state,
            Method::GET,
            "/api/reports/deliveries?search=22222222",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
        assert_eq!(body[0]["branch"], "Valparaíso – Planta BIF");

        let (_, body) = send(
            &state,
            Method::GET,
            "/api/reports/deliveries?branch=nowhere",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(body.as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn csv_export_is_an_attachment() {
        let (state, _dir) = setup_state().await;
        seed_deliveries(&state).await;
        let hr = seed_user(&state, "hr", Role::Hr, "casablanca").await;

        let (status, headers, bytes) = send_raw(
            &state,
            Method::GET,
            "/api/reports/export/csv",
            Some(&bearer(&state, &hr)),
            None,
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/csv; charset=utf-8");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"delivery_report.csv\""
        );

        let text = String::from_utf8(bytes).expect("utf-8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "RUT,Name,Branch,Box,Guard,Date");
        assert_eq!(lines.len(), 3);
        assert!(lines
            .iter()
            .any(|line| *line == "11111111-1,Luis Pérez Mora,Casablanca,CB-IND,gate1,2025-03-10 12:00"));
    }
}
