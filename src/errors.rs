use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApprovalError {
    /// Unknown request id or request type.
    #[error("not found: {0}")]
    NotFound(String),

    /// Forbidden characters, malformed filters. Raised before any write.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Self-approval, non-requester cancel, non-approver decide, unauthorized view.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The conditional write found the row in another state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No executor registered for the request type.
    #[error("no executor registered for request type '{0}'")]
    NotImplemented(String),

    /// The executor ran and failed; the request stays approved.
    #[error("execution of '{request_type}' failed: {message}")]
    ExecutionFailed {
        request_type: String,
        message: String,
    },

    #[error("internal error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

impl ApprovalError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApprovalError::NotFound(_) => StatusCode::NOT_FOUND,
            ApprovalError::Validation(_) => StatusCode::BAD_REQUEST,
            ApprovalError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApprovalError::Conflict(_) => StatusCode::CONFLICT,
            ApprovalError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ApprovalError::ExecutionFailed { .. } => StatusCode::BAD_GATEWAY,
            ApprovalError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> (&'static str, &'static str) {
        match self {
            ApprovalError::NotFound(_) => ("not_found_error", "not_found"),
            ApprovalError::Validation(_) => ("invalid_request_error", "validation_failed"),
            ApprovalError::Forbidden(_) => ("permission_error", "forbidden"),
            ApprovalError::Conflict(_) => ("conflict_error", "status_already_decided"),
            ApprovalError::NotImplemented(_) => ("configuration_error", "executor_missing"),
            ApprovalError::ExecutionFailed { .. } => ("upstream_error", "execution_failed"),
            ApprovalError::Unexpected(_) => ("internal_error", "internal_server_error"),
        }
    }
}

impl IntoResponse for ApprovalError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_type, code) = self.kind();
        let msg = match &self {
            ApprovalError::Unexpected(e) => {
                tracing::error!("Internal error: {:#}", e);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApprovalError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApprovalError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApprovalError::Forbidden("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApprovalError::Conflict("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ApprovalError::NotImplemented("x".into()).status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            ApprovalError::Unexpected(anyhow::anyhow!("db down")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_internal_error_is_masked() {
        let resp = ApprovalError::Unexpected(anyhow::anyhow!("password=hunter2")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["message"], "internal server error");
        assert_eq!(body["error"]["code"], "internal_server_error");
    }
}
