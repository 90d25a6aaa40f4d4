use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use inline_widgets::WidgetError;
use pty_manager::PtyError;

/// Delivery failure towards one viewer.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("viewer send failed: {0}")]
    Send(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures surfaced by the HTTP control plane.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Pty(#[from] PtyError),
}

impl From<WidgetError> for ApiError {
    fn from(err: WidgetError) -> Self {
        ApiError::NotFound(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Pty(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
