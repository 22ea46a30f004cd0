use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use optia_core::CoreError;
use serde_json::json;

/// HTTP rendering of engine errors. Storage details never reach the caller;
/// they land in the log with the generic 500 body instead.
#[derive(Debug)]
pub struct AppError(pub CoreError);

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self.0 {
            CoreError::NotFound => (StatusCode::NOT_FOUND, self.0.to_string()),
            CoreError::Forbidden => (StatusCode::FORBIDDEN, self.0.to_string()),
            CoreError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.0.to_string()),
            CoreError::InvalidStatus(_)
            | CoreError::IllegalTransition { .. }
            | CoreError::Validation(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            CoreError::TransitionFailed => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
            }
            CoreError::Persistence(detail) => {
                tracing::error!("Internal Server Error: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}
