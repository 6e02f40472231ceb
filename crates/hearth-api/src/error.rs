use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use hearth_db::StoreError;
use hearth_types::api::{ErrorKind, ErrorResponse};

/// Error returned by every handler. Internal details are logged and never
/// sent to the client.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorKind::Unauthorized, "not authenticated")
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        error!("Internal error: {}", detail);
        Self::new(ErrorKind::Internal, "something went wrong")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e.kind() {
            ErrorKind::Internal => Self::internal(e),
            kind => Self::new(kind, e.to_string()),
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            status_for(self.kind),
            Json(ErrorResponse {
                error: self.kind,
                message: self.message,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_store_errors_keep_their_kind() {
        let duplicate = ApiError::from(StoreError::Conflict("email already registered".into()));
        assert_eq!(duplicate.kind(), ErrorKind::Conflict);
        assert_eq!(duplicate.into_response().status(), StatusCode::CONFLICT);

        let busy = ApiError::from(StoreError::Unavailable("resolver retries exhausted".into()));
        assert_eq!(busy.kind(), ErrorKind::Internal);
        assert_eq!(busy.message, "something went wrong");
    }
}
