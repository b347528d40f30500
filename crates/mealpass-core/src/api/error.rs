use serde_json::Value;
use thiserror::Error;

use crate::notice::{validation_message, Notice};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized - session is no longer valid")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {message}")]
    Validation { message: String, body: Value },

    #[error("Server error ({status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("Request timed out")]
    Timeout,

    #[error("No connectivity: {0}")]
    Offline(String),

    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// 2xx response whose envelope says `success: false`
    #[error("{0}")]
    Rejected(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            422 => {
                let body: Value = serde_json::from_str(body).unwrap_or(Value::Null);
                ApiError::Validation {
                    message: validation_message(&body),
                    body,
                }
            }
            code @ 500..=599 => ApiError::ServerError {
                status: code,
                body: truncated,
            },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Classify a failure that happened before a status was received.
    pub fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ApiError::Timeout
        } else if error.is_connect() {
            ApiError::Offline(error.to_string())
        } else if error.is_decode() {
            ApiError::InvalidResponse(error.to_string())
        } else {
            ApiError::Network(error)
        }
    }

    /// The notice the UI should show for this error, if any. 401 is handled
    /// by the teardown path instead.
    pub fn notice(&self) -> Option<Notice> {
        match self {
            ApiError::AccessDenied(_) => Some(Notice::Forbidden),
            ApiError::NotFound(_) => Some(Notice::NotFound),
            ApiError::Validation { message, .. } => Some(Notice::Validation(message.clone())),
            ApiError::ServerError { status: 500, .. } => Some(Notice::ServerError),
            ApiError::Timeout => Some(Notice::Timeout),
            ApiError::Offline(_) => Some(Notice::Offline),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_classification() {
        assert!(ApiError::from_status(StatusCode::UNAUTHORIZED, "").is_unauthorized());
        assert!(matches!(
            ApiError::from_status(StatusCode::FORBIDDEN, "nope"),
            ApiError::AccessDenied(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, ""),
            ApiError::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::IM_A_TEAPOT, ""),
            ApiError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_validation_body_is_parsed() {
        let err = ApiError::from_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"errors":{"field":["must be filled"]}}"#,
        );
        assert_eq!(err.notice(), Some(Notice::Validation("must be filled".to_string())));
    }

    #[test]
    fn test_notice_only_for_plain_500() {
        let internal = ApiError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(internal.notice(), Some(Notice::ServerError));
        let unavailable = ApiError::from_status(StatusCode::SERVICE_UNAVAILABLE, "");
        assert_eq!(unavailable.notice(), None);
        assert_eq!(ApiError::Unauthorized.notice(), None);
    }

    #[test]
    fn test_truncate_body() {
        let long = "é".repeat(400);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.contains("truncated, 800 total bytes"));
    }
}
