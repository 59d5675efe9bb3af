use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::RefreshError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    Validation(String),

    /// 401 on a regular API call. `refresh_failure` is set when the single
    /// coordinated refresh-and-retry could not recover it.
    #[error("Unauthorized - token may be expired")]
    Unauthorized {
        message: String,
        refresh_failure: Option<RefreshError>,
    },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Uniform `{status, message}` shape handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ErrorInfo {
    /// HTTP status, `None` when no response was received
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
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

    /// Prefer a JSON `message` field, then the raw (truncated) body.
    fn extract_message(body: &str, fallback: &str) -> String {
        if let Ok(ErrorBody { message: Some(message) }) = serde_json::from_str(body) {
            return Self::truncate_body(&message);
        }
        if body.trim().is_empty() {
            fallback.to_string()
        } else {
            Self::truncate_body(body)
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            400 => ApiError::Validation(Self::extract_message(body, "Invalid request")),
            401 => ApiError::Unauthorized {
                message: Self::extract_message(body, "Unauthorized"),
                refresh_failure: None,
            },
            403 => ApiError::AccessDenied(Self::extract_message(body, "Forbidden")),
            404 => ApiError::NotFound(Self::extract_message(body, "Not found")),
            429 => ApiError::RateLimited,
            code @ 500..=599 => ApiError::ServerError {
                status: code,
                message: Self::extract_message(body, "Server error"),
            },
            _ => ApiError::InvalidResponse(format!(
                "Status {}: {}",
                status,
                Self::truncate_body(body)
            )),
        }
    }

    /// HTTP status behind this error, if a response was received
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Validation(_) => Some(400),
            ApiError::Unauthorized { .. } => Some(401),
            ApiError::AccessDenied(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::RateLimited => Some(429),
            ApiError::ServerError { status, .. } => Some(*status),
            ApiError::NetworkError(e) => e.status().map(|s| s.as_u16()),
            ApiError::InvalidResponse(_) => None,
        }
    }

    pub fn info(&self) -> ErrorInfo {
        let message = match self {
            ApiError::Validation(m)
            | ApiError::AccessDenied(m)
            | ApiError::NotFound(m)
            | ApiError::Unauthorized { message: m, .. }
            | ApiError::ServerError { message: m, .. } => m.clone(),
            ApiError::NetworkError(e) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            ApiError::NetworkError(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            other => other.to_string(),
        };
        ErrorInfo {
            status: self.status(),
            message,
        }
    }

    /// Transient failures worth retrying later. Never a reason to log out.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::NetworkError(_) | ApiError::RateLimited | ApiError::ServerError { .. }
        )
    }

    /// True only when the refresh behind a 401 failed with an auth-fatal error
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthorized {
                refresh_failure: Some(failure),
                ..
            } if failure.is_auth_fatal()
        )
    }
}
