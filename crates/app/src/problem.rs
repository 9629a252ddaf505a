use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use safebox_core::campaign::CampaignValidationError;
use safebox_core::eligibility::DeliveryRejection;
use safebox_core::incident::IncidentTransitionError;
use safebox_storage::{
    BoxError, CampaignError, CatalogError, DeliveryError, IncidentError, NotificationError,
    QrError, UserError, WorkerError,
};

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    extra: Option<Value>,
}

/// RFC 7807 error body with `application/problem+json` content type.
#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
                extra: None,
            },
        }
    }

    /// Adds members next to `type`, `title` and `detail`. Only JSON objects are merged.
    pub fn with_extra(mut self, extra: Value) -> Self {
        if extra.is_object() {
            self.body.extra = Some(extra);
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn problem_type(&self) -> &'static str {
        self.body.problem_type
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

pub fn bad_request(problem_type: &'static str, detail: impl Into<String>) -> ProblemResponse {
    ProblemResponse::new(StatusCode::BAD_REQUEST, problem_type, detail)
}

pub fn not_found(detail: impl Into<String>) -> ProblemResponse {
    ProblemResponse::new(StatusCode::NOT_FOUND, "not_found", detail)
}

pub fn conflict(problem_type: &'static str, detail: impl Into<String>) -> ProblemResponse {
    ProblemResponse::new(StatusCode::CONFLICT, problem_type, detail)
}

pub fn internal_error(message: impl Into<String>) -> ProblemResponse {
    ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
}

fn storage_failure(err: &dyn std::error::Error) -> ProblemResponse {
    error!(stage = "storage", error = %err, "storage operation failed");
    internal_error("unexpected storage failure")
}

impl From<DeliveryRejection> for ProblemResponse {
    fn from(rejection: DeliveryRejection) -> Self {
        ProblemResponse::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            rejection.code(),
            rejection.to_string(),
        )
    }
}

impl From<CampaignValidationError> for ProblemResponse {
    fn from(err: CampaignValidationError) -> Self {
        bad_request(err.code(), err.to_string())
    }
}

impl From<IncidentTransitionError> for ProblemResponse {
    fn from(err: IncidentTransitionError) -> Self {
        match err {
            IncidentTransitionError::InvalidTransition { .. } => conflict(err.code(), err.to_string()),
            _ => bad_request(err.code(), err.to_string()),
        }
    }
}

impl From<UserError> for ProblemResponse {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NotFound => not_found("user not found"),
            UserError::DuplicateUsername => conflict("duplicate_username", err.to_string()),
            UserError::UnknownBranch => bad_request("unknown_branch", err.to_string()),
            UserError::Database(ref source) => storage_failure(source),
        }
    }
}

impl From<CatalogError> for ProblemResponse {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound => not_found(err.to_string()),
            CatalogError::DuplicateName => conflict("duplicate_name", err.to_string()),
            CatalogError::DuplicateCode => conflict("duplicate_code", err.to_string()),
            CatalogError::InUse => conflict("in_use", err.to_string()),
            CatalogError::Database(ref source) => storage_failure(source),
        }
    }
}

impl From<WorkerError> for ProblemResponse {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::NotFound => not_found("worker not found"),
            WorkerError::DuplicateRut => conflict("duplicate_rut", err.to_string()),
            WorkerError::MissingReference => bad_request("unknown_reference", err.to_string()),
            WorkerError::Database(ref source) => storage_failure(source),
        }
    }
}

impl From<BoxError> for ProblemResponse {
    fn from(err: BoxError) -> Self {
        match err {
            BoxError::NotFound => not_found("box lot not found"),
            BoxError::DuplicateCode => conflict("duplicate_code", err.to_string()),
            BoxError::UnknownBranch => bad_request("unknown_branch", err.to_string()),
            BoxError::NegativeStock => bad_request("negative_stock", err.to_string()),
            BoxError::Database(ref source) => storage_failure(source),
        }
    }
}

impl From<DeliveryError> for ProblemResponse {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::NotFound => not_found("delivery not found"),
            DeliveryError::WorkerNotFound => not_found("worker not found"),
            DeliveryError::BoxNotFound => not_found("box lot not found"),
            DeliveryError::Rejected(rejection) => rejection.into(),
            DeliveryError::AlreadyValidated => bad_request("already_validated", err.to_string()),
            DeliveryError::Database(ref source) => storage_failure(source),
        }
    }
}

impl From<CampaignError> for ProblemResponse {
    fn from(err: CampaignError) -> Self {
        match err {
            CampaignError::NotFound => not_found("campaign not found"),
            CampaignError::MissingReference => bad_request("unknown_branch", err.to_string()),
            CampaignError::Database(ref source) => storage_failure(source),
        }
    }
}

impl From<IncidentError> for ProblemResponse {
    fn from(err: IncidentError) -> Self {
        match err {
            IncidentError::NotFound => not_found("incident not found"),
            IncidentError::MissingReference => bad_request("unknown_reference", err.to_string()),
            IncidentError::StatusChanged { .. } => conflict("invalid_transition", err.to_string()),
            IncidentError::Database(ref source) => storage_failure(source),
        }
    }
}

impl From<NotificationError> for ProblemResponse {
    fn from(err: NotificationError) -> Self {
        match err {
            NotificationError::NotFound => not_found("notification not found"),
            NotificationError::Database(ref source) => storage_failure(source),
        }
    }
}

impl From<QrError> for ProblemResponse {
    fn from(err: QrError) -> Self {
        match err {
            QrError::NotGenerated => bad_request("qr_not_generated", err.to_string()),
            QrError::UnknownWorker => not_found("worker not found"),
            QrError::Database(ref source) => storage_failure(source),
        }
    }
}
