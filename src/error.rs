//! Error kinds for the council gateway.
//!
//! [`Failure`] is the typed result of a single [`crate::model_client::ModelClient`]
//! call — never raised, always returned, so [`crate::fanout::fanout`] can absorb
//! it without unwinding siblings. [`AppError`] is the HTTP-facing counterpart:
//! it carries enough to render the `{error:{message,type,code}}` envelope and
//! the right status code.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::json;

/// A single backend call failed in one of a small set of ways.
///
/// The client MUST NOT raise on a non-2xx response — it returns this instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Failure {
    #[error("backend timed out")]
    Timeout,
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("backend returned HTTP {code}")]
    HttpStatus { code: u16 },
    #[error("malformed backend response: {0}")]
    MalformedResponse(String),
}

/// Error kinds surfaced at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration rejected: {0}")]
    ConfigValidation(String),
    #[error("conversation not found")]
    ConversationMissing,
    #[error("conversation storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("council roster is empty")]
    EmptyCouncilRoster,
    #[error("all council members failed to respond")]
    AllMembersFailed { conversation_id: String },
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::ConfigValidation(_) => "config_validation",
            AppError::ConversationMissing => "conversation_missing",
            AppError::StorageUnavailable(_) => "storage_unavailable",
            AppError::MalformedRequest(_) => "malformed_request",
            AppError::EmptyCouncilRoster | AppError::AllMembersFailed { .. } => "council_error",
            AppError::Internal(_) => "server_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::ConfigValidation(_) => StatusCode::BAD_REQUEST,
            AppError::ConversationMissing => StatusCode::NOT_FOUND,
            AppError::MalformedRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::EmptyCouncilRoster | AppError::AllMembersFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => "invalid_request_error",
            StatusCode::NOT_FOUND => "not_found_error",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Full detail goes to the logs; the client only ever sees a sanitized message.
        tracing::warn!(error = %self, "request failed");

        let status = self.status();
        let message = match &self {
            AppError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        let mut body = json!({
            "error": {
                "message": message,
                "type": self.error_type(),
                "code": self.code(),
            }
        });

        if let AppError::AllMembersFailed { conversation_id } = &self {
            body["conversation_id"] = json!(conversation_id);
        }

        (status, Json(body)).into_response()
    }
}
