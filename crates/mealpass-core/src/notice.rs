//! User-visible notices raised by the HTTP pipeline.
//!
//! Notices are side effects for the UI layer. The error that caused one is
//! still returned to the caller.

use std::fmt;

use serde_json::Value;

/// Shown when a 422 body carries no usable message.
pub const GENERIC_VALIDATION_MESSAGE: &str = "Some of the information provided is invalid.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    SessionExpired,
    Forbidden,
    NotFound,
    Validation(String),
    ServerError,
    Timeout,
    Offline,
}

impl Notice {
    /// Whether the UI should route to the sign-in screen after showing this.
    pub fn ends_session(&self) -> bool {
        matches!(self, Notice::SessionExpired)
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::SessionExpired => write!(f, "Your session has expired. Please sign in again."),
            Notice::Forbidden => write!(f, "You do not have permission to perform this action."),
            Notice::NotFound => write!(f, "The requested resource was not found."),
            Notice::Validation(message) => write!(f, "{}", message),
            Notice::ServerError => {
                write!(f, "The server encountered an error. Please try again later.")
            }
            Notice::Timeout => {
                write!(f, "The request timed out. Check your connection and try again.")
            }
            Notice::Offline => write!(f, "No internet connection. Check your network."),
        }
    }
}

/// Pick the message to show for a 422 body: the first message of the first
/// field in `errors`, then the top-level `message`, then a generic text.
pub fn validation_message(body: &Value) -> String {
    if let Some(message) = body.get("errors").and_then(first_error) {
        return message;
    }
    body.get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| GENERIC_VALIDATION_MESSAGE.to_string())
}

fn first_error(errors: &Value) -> Option<String> {
    match errors {
        Value::Object(fields) => fields.values().find_map(first_error),
        Value::Array(messages) => messages.iter().find_map(first_error),
        Value::String(message) if !message.trim().is_empty() => Some(message.clone()),
        _ => None,
    }
}
