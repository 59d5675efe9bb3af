use std::fmt;

use serde::{Deserialize, Serialize};

/// Access and refresh token, issued and replaced as a unit.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(rename = "token")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Tokens never end up in logs.
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Claims read from a token payload without signature verification.
///
/// Only `exp` is interpreted by this crate. The remaining claims are carried
/// for display purposes and must never drive an authorization decision.
///
/// NumericDate claims may carry a fraction of a second, so they are read as
/// floating point seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Expiry as seconds since the Unix epoch
    pub exp: f64,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub iat: Option<f64>,
}

impl TokenClaims {
    /// Expiry in milliseconds since the Unix epoch
    pub fn expires_at_millis(&self) -> i64 {
        // `as` saturates out-of-range values and maps NaN to zero
        (self.exp * 1000.0) as i64
    }
}
