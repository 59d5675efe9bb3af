//! Single-flight refresh of the token pair.
//!
//! At most one refresh-token exchange runs at a time per coordinator. Callers
//! that arrive while one is in flight attach to the same shared outcome. The
//! exchange runs on its own task, so it completes (and persists the new pair)
//! even if every caller that was waiting on it goes away.
//!
//! Every refresh is tagged with the session generation it started in. Logout
//! and login bump the generation through [`RefreshCoordinator::invalidate`],
//! and a refresh whose generation is stale never writes to the vault.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::RefreshError;
use super::store::TokenVault;
use crate::models::TokenPair;

/// Path of the refresh endpoint, relative to the API base URL
pub const REFRESH_PATH: &str = "/api/user/token/refresh";

/// The network half of a refresh: trade a refresh token for a new pair.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

/// `POST {base}/api/user/token/refresh` over reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTokenExchange {
    client: Client,
    endpoint: String,
}

impl HttpTokenExchange {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), REFRESH_PATH),
        }
    }
}

#[async_trait]
impl TokenExchange for HttpTokenExchange {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(RefreshError::from_reqwest)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RefreshError::AuthRejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RefreshError::Server {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<TokenPair>()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<TokenPair, RefreshError>>>;

struct InFlight {
    id: u64,
    outcome: SharedRefresh,
}

#[derive(Default)]
struct Slot {
    next_id: u64,
    in_flight: Option<InFlight>,
}

/// Clears the in-flight slot when the refresh task finishes, however it ends.
struct ClearOnDrop {
    slot: Arc<Mutex<Slot>>,
    id: u64,
}

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if slot.in_flight.as_ref().map(|f| f.id) == Some(self.id) {
            slot.in_flight = None;
        }
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Session generation shared between the coordinator and its refresh tasks.
///
/// The async lock serializes "check generation, then write" against
/// `invalidate`, so a stale write can never land after a bump.
#[derive(Default)]
struct Generation {
    current: AtomicU64,
    write_gate: tokio::sync::Mutex<()>,
}

pub struct RefreshCoordinator {
    vault: TokenVault,
    exchange: Arc<dyn TokenExchange>,
    slot: Arc<Mutex<Slot>>,
    generation: Arc<Generation>,
}

impl RefreshCoordinator {
    pub fn new(vault: TokenVault, exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            vault,
            exchange,
            slot: Arc::new(Mutex::new(Slot::default())),
            generation: Arc::new(Generation::default()),
        }
    }

    /// Start a new session generation.
    ///
    /// Refreshes already in flight finish with [`RefreshError::Superseded`]
    /// and leave storage alone. Once this returns, no refresh from an earlier
    /// generation can write to the vault, and the next `refresh` call starts a
    /// fresh exchange instead of joining the stale one.
    pub async fn invalidate(&self) {
        let _gate = self.generation.write_gate.lock().await;
        let previous = self.generation.current.fetch_add(1, Ordering::SeqCst);
        lock(&self.slot).in_flight = None;
        debug!(generation = previous + 1, "Session generation advanced");
    }

    /// Whether a refresh is currently in flight
    pub fn is_refreshing(&self) -> bool {
        lock(&self.slot).in_flight.is_some()
    }

    /// Refresh the token pair, joining an in-flight refresh if there is one.
    ///
    /// On success the new pair is already persisted when this returns. On
    /// failure storage is left untouched.
    pub async fn refresh(&self) -> Result<TokenPair, RefreshError> {
        let outcome = {
            // Check-then-set under one lock, never across an await
            let mut slot = lock(&self.slot);
            let joined = slot
                .in_flight
                .as_ref()
                .map(|in_flight| (in_flight.id, in_flight.outcome.clone()));
            match joined {
                Some((id, outcome)) => {
                    debug!(refresh_id = id, "Joining in-flight token refresh");
                    outcome
                }
                None => {
                    let id = slot.next_id;
                    slot.next_id += 1;
                    let outcome = self.spawn_refresh(id);
                    slot.in_flight = Some(InFlight {
                        id,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };
        outcome.await
    }

    fn spawn_refresh(&self, id: u64) -> SharedRefresh {
        let vault = self.vault.clone();
        let exchange = Arc::clone(&self.exchange);
        let slot = Arc::clone(&self.slot);
        let generation = Arc::clone(&self.generation);
        let started_in = generation.current.load(Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let guard = ClearOnDrop { slot, id };
            let result = Self::run(&vault, exchange.as_ref(), &generation, started_in, id).await;
            // Tokens are written before the slot clears and before waiters wake
            drop(guard);
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(RefreshError::Network(format!("Token refresh task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    async fn run(
        vault: &TokenVault,
        exchange: &dyn TokenExchange,
        generation: &Generation,
        started_in: u64,
        id: u64,
    ) -> Result<TokenPair, RefreshError> {
        let refresh_token = vault
            .refresh_token()
            .await
            .map_err(|e| RefreshError::Storage(e.to_string()))?
            .ok_or(RefreshError::NoRefreshToken)?;

        debug!(refresh_id = id, "Exchanging refresh token");
        match exchange.exchange(&refresh_token).await {
            Ok(pair) => {
                let _gate = generation.write_gate.lock().await;
                if generation.current.load(Ordering::SeqCst) != started_in {
                    info!(refresh_id = id, "Session changed during token refresh, discarding new tokens");
                    return Err(RefreshError::Superseded);
                }
                vault
                    .write_pair(&pair)
                    .await
                    .map_err(|e| RefreshError::Storage(e.to_string()))?;
                info!(refresh_id = id, "Token refresh succeeded");
                Ok(pair)
            }
            Err(e) if generation.current.load(Ordering::SeqCst) != started_in => {
                debug!(refresh_id = id, error = %e, "Stale token refresh failed, ignoring");
                Err(RefreshError::Superseded)
            }
            Err(e) => {
                warn!(refresh_id = id, error = %e, auth_fatal = e.is_auth_fatal(), "Token refresh failed");
                Err(e)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
