//! Data models for the authenticated session.
//!
//! - `TokenPair`: the access/refresh bearer credentials, always handled together
//! - `TokenClaims`: an unverified view of a token payload
//! - `UserProfile`: the minimal profile of the logged-in user

pub mod token;
pub mod user;

pub use token::{TokenClaims, TokenPair};
pub use user::UserProfile;
