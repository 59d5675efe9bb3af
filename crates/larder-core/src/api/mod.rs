//! REST API client module for the larder backend.
//!
//! `AuthClient` wraps the shared reqwest client with bearer authentication and
//! a single refresh-and-retry on 401. `ApiError` classifies every other
//! failure into a `{status, message}` shape for the UI.

pub mod client;
pub mod error;

pub use client::{Attempt, AuthClient};
pub use error::{ApiError, ErrorInfo};
