//! Authentication module: token storage and the session token lifecycle.
//!
//! This module provides:
//! - `TokenStore` / `TokenVault`: durable storage for the token pair
//! - `expiry`: unverified, client-side staleness estimate for tokens
//! - `RefreshCoordinator`: single-flight refresh of the token pair
//! - `RefreshScheduler`: proactive background refresh
//! - `SessionManager`: login, cold-start restore and logout

pub mod error;
pub mod expiry;
pub mod refresh;
pub mod scheduler;
pub mod session;
pub mod store;

pub use error::{LoginError, LoginFailure, RefreshError};
pub use refresh::{HttpTokenExchange, RefreshCoordinator, TokenExchange};
pub use scheduler::{RefreshScheduler, RejectionHook, TickOutcome};
pub use session::{
    CredentialIssuer, LoginGrant, LoginOutcome, RestoreOutcome, SessionManager, SessionSettings,
    SessionStatus, TokenInfo, TokenOverview,
};
pub use store::{
    EncryptedFileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore, TokenVault,
};
