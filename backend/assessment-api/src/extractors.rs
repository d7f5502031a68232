use axum::{
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use validator::Validate;

/// JSON extractor that runs payload validation and answers rejections
/// with JSON error bodies instead of HTML.
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: serde::de::DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await.map_err(|rejection| {
            let message = format!("Failed to parse JSON request body: {}", rejection);
            tracing::warn!("{}", message);
            reject(&message)
        })?;

        value.validate().map_err(|errors| {
            let message = format!("Request validation failed: {}", errors);
            tracing::warn!("{}", message);
            reject(&message)
        })?;

        Ok(ValidatedJson(value))
    }
}

fn reject(message: &str) -> Response {
    let error_response = json!({
        "message": message,
        "status": 400
    });
    (StatusCode::BAD_REQUEST, Json(error_response)).into_response()
}
