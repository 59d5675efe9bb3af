//! Client-side token staleness estimate.
//!
//! NOT A SECURITY BOUNDARY. Nothing here verifies a signature. The payload is
//! decoded only to guess *when* to ask the server for a new token; the server
//! remains the sole authority on whether a token is valid. Never use these
//! functions (or the claims they return) to make an authorization decision.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::models::TokenClaims;

/// Default safety buffer before `exp`, in seconds (5 minutes)
pub const DEFAULT_EXPIRY_BUFFER_SECS: i64 = 300;

/// Number of dot-separated segments in a compact token
const TOKEN_SEGMENTS: usize = 3;

/// Decode the payload of a compact `header.payload.signature` token without
/// checking the signature. Returns `None` if anything about it is off.
pub fn decode_claims_unverified(token: &str) -> Option<TokenClaims> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != TOKEN_SEGMENTS {
        debug!(segments = segments.len(), "Token has wrong number of segments");
        return None;
    }

    // base64url -> standard alphabet, padded to a multiple of 4
    let mut payload: String = segments[1]
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while payload.len() % 4 != 0 {
        payload.push('=');
    }

    let bytes = STANDARD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub fn default_expiry_buffer() -> Duration {
    Duration::seconds(DEFAULT_EXPIRY_BUFFER_SECS)
}

/// True if the token is expired, expires within `buffer`, or cannot be read.
pub fn is_expired_or_expiring_soon(token: &str, buffer: Duration) -> bool {
    is_expired_or_expiring_soon_at(token, buffer, Utc::now())
}

/// Same as [`is_expired_or_expiring_soon`] against an explicit clock.
pub fn is_expired_or_expiring_soon_at(token: &str, buffer: Duration, now: DateTime<Utc>) -> bool {
    match decode_claims_unverified(token) {
        Some(claims) => {
            let remaining_ms = claims.expires_at_millis() - now.timestamp_millis();
            remaining_ms < buffer.num_milliseconds()
        }
        None => true,
    }
}
