use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a refresh-token exchange failed.
///
/// `Clone` because one outcome is handed to every caller waiting on the same
/// in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The server rejected the refresh token itself (401/403)
    #[error("Refresh token rejected by server (status {status})")]
    AuthRejected { status: u16 },

    #[error("No refresh token stored")]
    NoRefreshToken,

    /// No response was received (offline, DNS, timeout)
    #[error("Network error during token refresh: {0}")]
    Network(String),

    #[error("Server error during token refresh ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Invalid token refresh response: {0}")]
    InvalidResponse(String),

    #[error("Token storage error: {0}")]
    Storage(String),

    /// The session was logged out or replaced while the exchange was running
    #[error("Token refresh superseded by a session change")]
    Superseded,
}

impl RefreshError {
    /// The session cannot be recovered and the user has to log in again.
    pub fn is_auth_fatal(&self) -> bool {
        matches!(
            self,
            RefreshError::AuthRejected { .. } | RefreshError::NoRefreshToken
        )
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RefreshError::InvalidResponse(err.to_string())
        } else {
            RefreshError::Network(err.to_string())
        }
    }
}

/// Coarse login failure class, shown to the UI alongside the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum LoginFailure {
    InvalidCredentials,
    Server,
    Network,
    Unknown,
}

/// Failure reported by the credential-issuing collaborator on login.
#[derive(Error, Debug)]
pub enum LoginError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoginError {
    pub fn failure(&self) -> LoginFailure {
        match self {
            LoginError::InvalidCredentials => LoginFailure::InvalidCredentials,
            LoginError::Server { .. } => LoginFailure::Server,
            LoginError::Network(_) => LoginFailure::Network,
            LoginError::Other(_) => LoginFailure::Unknown,
        }
    }

    /// Message suitable for showing inline on a login form
    pub fn user_message(&self) -> String {
        match self {
            LoginError::InvalidCredentials => "Invalid email or password".to_string(),
            LoginError::Server { .. } => {
                "The server had a problem. Please try again later.".to_string()
            }
            LoginError::Network(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            LoginError::Other(e) => format!("Login failed: {}", e),
        }
    }
}
