use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── VdrError — core error taxonomy ─────────────────────────────────────────

/// Error kinds produced by the core subsystems (SVDRP client, caches,
/// stream supervisor, archive manager).
///
/// HTTP handlers never construct these directly; they receive them from the
/// service layer and convert them into an [`ApiError`] at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum VdrError {
    /// No such entity (timer id, recording id, job id, event id).
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or out-of-range parameter.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The SVDRP socket could not be established or broke mid-command.
    #[error("SVDRP connection failed: {0}")]
    Connection(String),

    /// SVDRP answered with a ≥ 400 code; carries code and remote message.
    #[error("SVDRP error {code}: {message}")]
    Protocol { code: u16, message: String },

    /// The caller deadline elapsed before the operation completed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Unexpected failure in a child process, the filesystem, or a parser.
    #[error("{0}")]
    Internal(String),
}

impl VdrError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    /// True for the protocol codes VDR uses for "no such entity".
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Protocol { code, .. } => *code == 550 || *code == 501,
            _ => false,
        }
    }
}

pub type VdrResult<T> = Result<T, VdrError>;

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Structured API error that serializes to JSON.
///
/// ```json
/// {
///   "error": {
///     "code": "timer_not_found",
///     "message": "Timer 17 does not exist.",
///     "status": 404
///   }
/// }
/// ```
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

// ─── IntoResponse ───────────────────────────────────────────────────────────

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Log according to severity.
        if self.status.is_server_error() {
            tracing::error!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        } else if self.status.is_client_error() {
            tracing::warn!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

// ─── From<VdrError> — taxonomy to HTTP status ───────────────────────────────

impl From<VdrError> for ApiError {
    fn from(err: VdrError) -> Self {
        match err {
            VdrError::NotFound(msg) => Self {
                code: "not_found",
                message: msg,
                status: StatusCode::NOT_FOUND,
            },
            VdrError::InvalidInput(msg) => Self {
                code: "invalid_input",
                message: msg,
                status: StatusCode::BAD_REQUEST,
            },
            VdrError::Connection(msg) => Self {
                code: "backend_unreachable",
                message: format!("VDR backend unreachable: {msg}"),
                status: StatusCode::BAD_GATEWAY,
            },
            // The backend's own "no such entity" codes surface as 404.
            VdrError::Protocol { code, message } if code == 550 || code == 501 => Self {
                code: "not_found",
                message,
                status: StatusCode::NOT_FOUND,
            },
            VdrError::Protocol { code, message } => Self {
                code: "backend_error",
                message: format!("VDR refused the command ({code}): {message}"),
                status: StatusCode::BAD_GATEWAY,
            },
            // Readiness timeouts are intercepted by the streaming handler
            // (503 + Retry-After) before they ever reach this conversion.
            VdrError::Timeout(msg) => Self {
                code: "timeout",
                message: msg,
                status: StatusCode::INTERNAL_SERVER_ERROR,
            },
            VdrError::Internal(msg) => Self {
                code: "internal_server_error",
                message: msg,
                status: StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

// ─── Generic constructors ───────────────────────────────────────────────────

impl ApiError {
    /// 404 Not Found with a custom message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            code: "not_found",
            message: msg.into(),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 400 Bad Request with a custom message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            code: "bad_request",
            message: msg.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    /// 409 Conflict with a custom message.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            code: "conflict",
            message: msg.into(),
            status: StatusCode::CONFLICT,
        }
    }

    /// 500 Internal Server Error with a custom message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: "internal_server_error",
            message: msg.into(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    // ─── Domain-specific constructors ───────────────────────────────────

    /// 404 — no stream is running for the requested channel.
    pub fn stream_not_found(channel: &str) -> Self {
        Self {
            code: "stream_not_found",
            message: format!("No stream is running for channel '{channel}'."),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 503 — the stream did not become ready before the deadline.
    /// The handler adds a `Retry-After` header.
    pub fn stream_not_ready(channel: &str) -> Self {
        Self {
            code: "stream_not_ready",
            message: format!("Stream for channel '{channel}' is not ready yet."),
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// 404 — the requested archive job does not exist.
    pub fn job_not_found(id: &str) -> Self {
        Self {
            code: "job_not_found",
            message: format!("Archive job '{id}' does not exist."),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 400 — a path parameter contains separators or traversal sequences.
    pub fn unsafe_path(what: &str) -> Self {
        Self {
            code: "unsafe_path",
            message: format!("{what} contains characters that are not allowed."),
            status: StatusCode::BAD_REQUEST,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;

    /// Helper: convert an `ApiError` into its JSON body string.
    async fn body_string(err: ApiError) -> String {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_structure() {
        let json = body_string(ApiError::job_not_found("j-42")).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["error"]["code"], "job_not_found");
        assert_eq!(value["error"]["message"], "Archive job 'j-42' does not exist.");
        assert_eq!(value["error"]["status"], 404);
    }

    #[tokio::test]
    async fn status_code_is_set() {
        let response = ApiError::stream_not_ready("C1").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn vdr_error_mapping() {
        let err: ApiError = VdrError::not_found("Timer 17 does not exist.").into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = VdrError::invalid("priority out of range").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: ApiError = VdrError::Protocol {
            code: 550,
            message: "Timer not defined".into(),
        }
        .into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err: ApiError = VdrError::Protocol {
            code: 451,
            message: "busy".into(),
        }
        .into();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert!(err.message.contains("451"));

        let err: ApiError = VdrError::connection("connection refused").into();
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);

        let err: ApiError = VdrError::Timeout("SVDRP command 'LSTT'".into()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "timeout");
    }

    #[test]
    fn protocol_not_found_codes() {
        assert!(VdrError::Protocol { code: 550, message: String::new() }.is_not_found());
        assert!(VdrError::not_found("x").is_not_found());
        assert!(!VdrError::Protocol { code: 451, message: String::new() }.is_not_found());
    }
}
