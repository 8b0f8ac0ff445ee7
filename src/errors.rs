use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("tool not allowed: {0}")]
    ToolNotAllowed(String),

    #[error("url rejected: {0}")]
    SsrfBlocked(String),

    #[error("upstream timeout")]
    UpstreamTimeout,

    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable short code recorded in audit rows. Audit keeps the internal
    /// kind even when the wire response is masked (e.g. RBAC deny → 404).
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "unauthenticated",
            AppError::Forbidden => "forbidden",
            AppError::NotFound => "not_found",
            AppError::ToolNotAllowed(_) => "tool_not_allowed",
            AppError::SsrfBlocked(_) => "ssrf_blocked",
            AppError::UpstreamTimeout => "upstream_timeout",
            AppError::UpstreamProtocol(_) => "upstream_protocol",
            AppError::UpstreamError(_) => "upstream_error",
            AppError::Conflict(_) => "conflict",
            AppError::Validation(_) => "validation",
            AppError::Database(_) => "internal",
            AppError::Serialization(_) => "internal",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::ToolNotAllowed(_) => StatusCode::FORBIDDEN,
            AppError::SsrfBlocked(_) => StatusCode::BAD_REQUEST,
            AppError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Database(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (error_type, msg) = match &self {
            AppError::Unauthenticated => (
                "authentication_error",
                // Generic body: never reveal whether the identifier existed.
                "invalid or missing credentials".to_string(),
            ),
            AppError::Forbidden => ("permission_error", "forbidden".to_string()),
            AppError::NotFound => ("not_found", "resource not found".to_string()),
            AppError::ToolNotAllowed(tool) => (
                "permission_error",
                format!("tool '{}' is not allowed on this server", tool),
            ),
            AppError::SsrfBlocked(reason) => {
                ("invalid_request_error", format!("url rejected: {}", reason))
            }
            AppError::UpstreamTimeout => (
                "upstream_error",
                "upstream server did not respond within the deadline".to_string(),
            ),
            AppError::UpstreamProtocol(e) => ("upstream_error", e.clone()),
            AppError::UpstreamError(e) => ("upstream_error", e.clone()),
            AppError::Conflict(e) => ("conflict", e.clone()),
            AppError::Validation(e) => ("invalid_request_error", e.clone()),
            AppError::Database(e) => {
                tracing::error!("database error: {}", e);
                ("internal_error", "internal server error".to_string())
            }
            AppError::Serialization(e) => {
                tracing::error!("serialization error: {}", e);
                ("internal_error", "internal server error".to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {:?}", e);
                ("internal_error", "internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": self.kind(),
            },
            "status": "error",
        }));

        (self.status(), body).into_response()
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::ToolNotAllowed("rm".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::SsrfBlocked("loopback".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::UpstreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            AppError::UpstreamProtocol("missing session header".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::Conflict("name taken".into()).status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_kind_survives_masking() {
        // The proxy masks RBAC execute denials as 404, but audit rows keep
        // the internal kind via kind().
        let masked = AppError::NotFound;
        assert_eq!(masked.kind(), "not_found");
        let denied = AppError::Forbidden;
        assert_eq!(denied.kind(), "forbidden");
    }

    #[test]
    fn test_unauthenticated_body_is_generic() {
        let resp = AppError::Unauthenticated.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
