//! Mapping from session errors to HTTP responses.

use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    serde_json::json,
    tracing::warn,
    wagate_sessions::SessionError,
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Session(err) => match err {
                SessionError::NotFound(_) => StatusCode::NOT_FOUND,
                SessionError::OwnerMismatch { .. } => StatusCode::FORBIDDEN,
                SessionError::NotConnected { .. } => StatusCode::CONFLICT,
                SessionError::InvalidSessionId(_) | SessionError::InvalidAddress(_) => {
                    StatusCode::BAD_REQUEST
                },
                SessionError::CreationFailure(_) => StatusCode::BAD_GATEWAY,
                SessionError::RestoreFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::Send(_) | SessionError::Store(_) | SessionError::Directory(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                },
            },
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = Json(json!({
            "status": "error",
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}
