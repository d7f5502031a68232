use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{
    engine::EngineError,
    extractors::ValidatedJson,
    models::{
        AttemptSnapshot, CreateAttemptRequest, CreateAttemptResponse, RecordAnswerRequest,
        SetPositionRequest, SubmitAttemptResponse,
    },
    services::{
        attempt_service::{AttemptService, ServiceError},
        AppState,
    },
};

#[derive(Debug)]
pub enum AttemptApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
}

impl AttemptApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        AttemptApiError::BadRequest(message.into())
    }

    fn not_found(message: impl Into<String>) -> Self {
        AttemptApiError::NotFound(message.into())
    }

    fn conflict(message: impl Into<String>) -> Self {
        AttemptApiError::Conflict(message.into())
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        AttemptApiError::BadGateway(message.into())
    }
}

impl From<ServiceError> for AttemptApiError {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::AttemptNotFound(_) => AttemptApiError::not_found(err.to_string()),
            ServiceError::InvalidDefinition(_) => AttemptApiError::bad_request(err.to_string()),
            // Phase conflicts are rejections of a valid request at the
            // wrong moment, not malformed input.
            ServiceError::Engine(EngineError::IllegalTransition { .. }) => {
                AttemptApiError::conflict(err.to_string())
            }
            ServiceError::Engine(_) => AttemptApiError::bad_request(err.to_string()),
            ServiceError::Delivery(_) => AttemptApiError::bad_gateway(err.to_string()),
        }
    }
}

impl IntoResponse for AttemptApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AttemptApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AttemptApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AttemptApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AttemptApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        let body = json!({
            "message": message,
            "status": status.as_u16()
        });

        (status, Json(body)).into_response()
    }
}

/// POST /api/v1/attempts
pub async fn create_attempt(
    State(state): State<Arc<AppState>>,
    ValidatedJson(payload): ValidatedJson<CreateAttemptRequest>,
) -> Result<(StatusCode, Json<CreateAttemptResponse>), AttemptApiError> {
    let service = AttemptService::new(state);
    let response = service.create_attempt(payload)?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/v1/attempts/{id}
pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<Json<AttemptSnapshot>, AttemptApiError> {
    let service = AttemptService::new(state);
    Ok(Json(service.get_snapshot(&attempt_id)?))
}

/// POST /api/v1/attempts/{id}/start
pub async fn start_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<Json<AttemptSnapshot>, AttemptApiError> {
    let service = AttemptService::new(state);
    Ok(Json(service.start_attempt(&attempt_id)?))
}

/// POST /api/v1/attempts/{id}/answers
pub async fn record_answer(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<RecordAnswerRequest>,
) -> Result<Json<AttemptSnapshot>, AttemptApiError> {
    let service = AttemptService::new(state);
    Ok(Json(service.record_answer(&attempt_id, &payload)?))
}

/// PUT /api/v1/attempts/{id}/position
pub async fn set_position(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<SetPositionRequest>,
) -> Result<Json<AttemptSnapshot>, AttemptApiError> {
    let service = AttemptService::new(state);
    Ok(Json(service.set_position(&attempt_id, payload.index)?))
}

/// POST /api/v1/attempts/{id}/submit
pub async fn submit_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<Json<SubmitAttemptResponse>, AttemptApiError> {
    let service = AttemptService::new(state);
    Ok(Json(service.submit_attempt(&attempt_id).await?))
}

/// DELETE /api/v1/attempts/{id}
pub async fn abandon_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<StatusCode, AttemptApiError> {
    let service = AttemptService::new(state);
    service.abandon_attempt(&attempt_id)?;
    Ok(StatusCode::NO_CONTENT)
}
