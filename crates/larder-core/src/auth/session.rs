//! Session lifecycle: login, cold-start restore, logout.
//!
//! `SessionManager` is the only component the rest of the application talks
//! to. It owns the token vault, drives the background scheduler, and
//! publishes `SessionStatus` changes to subscribers.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::error::{LoginError, LoginFailure, RefreshError};
use super::expiry::{decode_claims_unverified, is_expired_or_expiring_soon};
use super::refresh::RefreshCoordinator;
use super::scheduler::{RefreshScheduler, RejectionHook};
use super::store::TokenVault;
use crate::api::ApiError;
use crate::config::Config;
use crate::models::{TokenPair, UserProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionStatus {
    LoggedOut,
    Restoring,
    LoggedIn,
    LoggingOut,
}

/// What the credential issuer hands back on a successful login
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub tokens: TokenPair,
    pub user: UserProfile,
}

/// External collaborator that exchanges credentials for a token pair.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginGrant, LoginError>;
}

/// Login result for the UI; failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct LoginOutcome {
    pub success: bool,
    pub message: String,
    /// Set when `success` is false
    pub failure: Option<LoginFailure>,
}

impl LoginOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            message: "Login successful".to_string(),
            failure: None,
        }
    }

    fn failed(failure: LoginFailure, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            failure: Some(failure),
        }
    }
}

/// How a cold-start restore ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// No refresh token stored
    NoSession,
    /// Refresh token past `exp`; storage cleared, no network call made
    RefreshTokenExpired,
    /// Stored access token was still fresh
    Restored,
    /// Access token renewed during restore
    Refreshed,
    /// Server rejected the refresh token; storage cleared
    Rejected(RefreshError),
    /// Transient failure; logged out for now, tokens kept for next launch
    Deferred(RefreshError),
}

/// Presence and unverified expiry of one stored token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    pub present: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenInfo {
    fn of(token: Option<&str>) -> Self {
        Self {
            present: token.is_some(),
            expires_at: token
                .and_then(decode_claims_unverified)
                .and_then(|claims| DateTime::from_timestamp_millis(claims.expires_at_millis())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenOverview {
    pub access: TokenInfo,
    pub refresh: TokenInfo,
}

/// Timing knobs for the session
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub refresh_interval: std::time::Duration,
    pub expiry_buffer: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_interval: config.refresh_interval(),
            expiry_buffer: config.expiry_buffer(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// State shared between the manager and the scheduler's rejection hook.
#[derive(Clone)]
struct SessionState {
    vault: TokenVault,
    refresher: Arc<RefreshCoordinator>,
    status: Arc<watch::Sender<SessionStatus>>,
    user: Arc<RwLock<Option<UserProfile>>>,
}

impl SessionState {
    fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    fn set_user(&self, user: Option<UserProfile>) {
        *self.user.write().unwrap_or_else(|e| e.into_inner()) = user;
    }

    /// Publish `status`, notifying subscribers only when it actually changes.
    fn set_status(&self, status: SessionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!(previous = ?*current, ?status, "Session status changed");
            *current = status;
            true
        });
    }

    /// End the session generation, forget tokens and profile.
    async fn clear(&self) {
        if self.status() == SessionStatus::LoggedIn {
            self.set_status(SessionStatus::LoggingOut);
        }
        // Refreshes still in flight must not write tokens back after this
        self.refresher.invalidate().await;
        if let Err(e) = self.vault.clear().await {
            error!(error = %e, "Failed to clear stored session");
        }
        self.set_user(None);
        self.set_status(SessionStatus::LoggedOut);
    }
}

pub struct SessionManager {
    state: SessionState,
    scheduler: RefreshScheduler,
    issuer: Arc<dyn CredentialIssuer>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        vault: TokenVault,
        refresher: Arc<RefreshCoordinator>,
        issuer: Arc<dyn CredentialIssuer>,
        settings: SessionSettings,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::LoggedOut);
        let state = SessionState {
            vault: vault.clone(),
            refresher: Arc::clone(&refresher),
            status: Arc::new(status),
            user: Arc::new(RwLock::new(None)),
        };

        let on_rejected: RejectionHook = {
            let state = state.clone();
            Arc::new(move |error: RefreshError| {
                let state = state.clone();
                async move {
                    warn!(error = %error, "Background refresh rejected, logging out");
                    state.clear().await;
                }
                .boxed()
            })
        };
        let scheduler = RefreshScheduler::new(
            vault,
            refresher,
            settings.refresh_interval,
            settings.expiry_buffer,
        )
        .with_rejection_hook(on_rejected);

        Self {
            state,
            scheduler,
            issuer,
            settings,
        }
    }

    // ===== Public surface =====

    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    pub fn is_logged_in(&self) -> bool {
        self.status() == SessionStatus::LoggedIn
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.state
            .user
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Receive every status change from now on
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.state.status.subscribe()
    }

    pub fn refresher(&self) -> &Arc<RefreshCoordinator> {
        &self.state.refresher
    }

    pub fn is_refresh_scheduled(&self) -> bool {
        self.scheduler.is_running()
    }

    // ===== Lifecycle =====

    /// Restore a session from storage on cold start.
    ///
    /// Only enters `Restoring` when there is a refresh token to restore from.
    pub async fn init(&self) -> RestoreOutcome {
        let outcome = match self.state.vault.refresh_token().await {
            Ok(Some(refresh_token)) => {
                self.state.set_status(SessionStatus::Restoring);
                self.restore(&refresh_token).await
            }
            Ok(None) => RestoreOutcome::NoSession,
            Err(e) => RestoreOutcome::Deferred(RefreshError::Storage(e.to_string())),
        };
        info!(?outcome, "Session restore finished");

        match &outcome {
            RestoreOutcome::Restored | RestoreOutcome::Refreshed => {
                let profile = self.state.vault.profile().await.unwrap_or_else(|e| {
                    warn!(error = %e, "Could not read stored user profile");
                    None
                });
                self.state.set_user(profile);
                self.enter_logged_in();
            }
            RestoreOutcome::Deferred(_) => {
                // Keep tokens so the next launch can try again
                self.state.set_user(None);
                self.state.set_status(SessionStatus::LoggedOut);
            }
            RestoreOutcome::NoSession
            | RestoreOutcome::RefreshTokenExpired
            | RestoreOutcome::Rejected(_) => self.teardown().await,
        }
        outcome
    }

    async fn restore(&self, refresh_token: &str) -> RestoreOutcome {
        // Usable as long as it has not actually expired
        if is_expired_or_expiring_soon(refresh_token, Duration::zero()) {
            return RestoreOutcome::RefreshTokenExpired;
        }

        match self.state.vault.access_token().await {
            Ok(Some(access)) if !is_expired_or_expiring_soon(&access, self.settings.expiry_buffer) => {
                return RestoreOutcome::Restored;
            }
            Ok(_) => debug!("Access token missing or stale, refreshing during restore"),
            Err(e) => warn!(error = %e, "Could not read access token, refreshing during restore"),
        }

        match self.state.refresher.refresh().await {
            Ok(_) => RestoreOutcome::Refreshed,
            Err(e) if e.is_auth_fatal() => RestoreOutcome::Rejected(e),
            Err(e) => RestoreOutcome::Deferred(e),
        }
    }

    /// Log in through the credential issuer. Never returns an error; the
    /// outcome carries a message for the login form.
    pub async fn login(&self, email: &str, password: &str) -> LoginOutcome {
        if email.trim().is_empty() || password.is_empty() {
            return LoginOutcome::failed(
                LoginFailure::InvalidCredentials,
                "Email and password required",
            );
        }

        let grant = match self.issuer.login(email.trim(), password).await {
            Ok(grant) => grant,
            Err(e) => {
                error!(error = %e, "Login failed");
                return LoginOutcome::failed(e.failure(), e.user_message());
            }
        };

        // Whatever the previous session was refreshing must not land on top
        self.state.refresher.invalidate().await;
        if let Err(e) = self.state.vault.write_pair(&grant.tokens).await {
            error!(error = %e, "Failed to store tokens after login");
            return LoginOutcome::failed(
                LoginFailure::Unknown,
                "Could not save your session on this device",
            );
        }
        if let Err(e) = self.state.vault.write_profile(&grant.user).await {
            warn!(error = %e, "Failed to store user profile");
        }

        self.state.set_user(Some(grant.user));
        self.enter_logged_in();
        info!("Login successful");
        LoginOutcome::ok()
    }

    /// Adopt a token pair obtained elsewhere (e.g. pasted by an operator)
    /// and restore from it as on cold start.
    pub async fn import_tokens(&self, tokens: &TokenPair) -> anyhow::Result<RestoreOutcome> {
        self.scheduler.stop();
        self.state.refresher.invalidate().await;
        self.state.vault.clear().await?;
        self.state.vault.write_pair(tokens).await?;
        Ok(self.init().await)
    }

    /// Stop refreshing, forget tokens and profile. Safe to call repeatedly.
    pub async fn logout(&self) {
        self.teardown().await;
        info!("Logged out");
    }

    /// Log out if `error` means the session is unrecoverable.
    /// Returns whether a logout happened.
    pub async fn handle_api_error(&self, error: &ApiError) -> bool {
        if error.requires_login() {
            warn!(error = %error, "Session can no longer be refreshed, logging out");
            self.logout().await;
            true
        } else {
            false
        }
    }

    /// Presence and unverified expiry of the stored tokens, never the tokens
    pub async fn token_overview(&self) -> anyhow::Result<TokenOverview> {
        let access = self.state.vault.access_token().await?;
        let refresh = self.state.vault.refresh_token().await?;
        Ok(TokenOverview {
            access: TokenInfo::of(access.as_deref()),
            refresh: TokenInfo::of(refresh.as_deref()),
        })
    }

    // ===== Internals =====

    fn enter_logged_in(&self) {
        self.state.set_status(SessionStatus::LoggedIn);
        self.scheduler.start();
    }

    async fn teardown(&self) {
        self.scheduler.stop();
        self.state.clear().await;
    }
}

// ============================================================================
// Tests
// ============================================================================
