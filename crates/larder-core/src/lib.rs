//! larder-core: the authenticated-session layer of the larder client.
//!
//! Holds the access/refresh token pair, renews the access token before it
//! expires, deduplicates concurrent renewals, retries a request once after a
//! 401, and tears the session down on unrecoverable authentication failure.
//!
//! The rest of the application only sees [`auth::SessionManager`]
//! (logged-in state, user profile, login/logout) and [`api::AuthClient`]
//! (authenticated requests).

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod models;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiError, AuthClient, ErrorInfo};
pub use auth::{LoginOutcome, SessionManager, SessionStatus};
pub use config::Config;
pub use context::AppContext;
pub use models::{TokenPair, UserProfile};
