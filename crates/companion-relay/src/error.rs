// Relay handler error type.
//
// Handlers return `Result<T, RelayError>`; the `IntoResponse` impl turns it
// into a JSON `{"error": ...}` body. Internal details are logged, not sent.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Body missing, not JSON, or the wrong shape.
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),

    #[error("failed to encode relay message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            RelayError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            RelayError::InvalidBody(rejection) => (rejection.status(), rejection.body_text()),
            RelayError::Encode(e) => {
                error!(error = %e, "relay encode error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}
