//! Fakes and token builders shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};

use crate::auth::session::{CredentialIssuer, LoginGrant};
use crate::auth::store::{MemoryTokenStore, TokenStore, TokenVault};
use crate::auth::{LoginError, RefreshError, TokenExchange};
use crate::models::{TokenPair, UserProfile};

/// Unsigned compact token whose `exp` is `expires_in` from now.
pub fn token_for(subject: &str, expires_in: Duration) -> String {
    let exp = (Utc::now() + expires_in).timestamp();
    let payload = serde_json::json!({ "sub": subject, "exp": exp });
    format!(
        "{}.{}.unsigned",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    )
}

pub fn token_expiring_in(expires_in: Duration) -> String {
    token_for("user", expires_in)
}

pub async fn seeded_vault(access: &str, refresh: &str) -> (Arc<MemoryTokenStore>, TokenVault) {
    let store = Arc::new(MemoryTokenStore::new());
    let vault = TokenVault::new(store.clone());
    vault
        .write_pair(&TokenPair::new(access, refresh))
        .await
        .unwrap();
    (store, vault)
}

pub async fn empty_vault() -> (Arc<MemoryTokenStore>, TokenVault) {
    let store = Arc::new(MemoryTokenStore::new());
    let vault = TokenVault::new(store.clone());
    (store, vault)
}

pub async fn stored(store: &MemoryTokenStore, key: &str) -> Option<String> {
    store.get(key).await.unwrap()
}

pub fn profile(id: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        user_name: Some(format!("user-{}", id)),
        email: Some(format!("{}@example.com", id)),
        role: Some("member".to_string()),
        group_id: None,
    }
}

// ============================================================================
// FakeExchange
// ============================================================================

/// Counting `TokenExchange`. Scripted responses are used first; once they run
/// out it either mints a fresh pair or repeats `fallback_error`.
pub struct FakeExchange {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    scripted: Mutex<VecDeque<Result<TokenPair, RefreshError>>>,
    fallback_error: Option<RefreshError>,
    delay: StdDuration,
}

impl FakeExchange {
    pub fn succeeding() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            fallback_error: None,
            delay: StdDuration::ZERO,
        }
    }

    pub fn failing(error: RefreshError) -> Self {
        Self {
            fallback_error: Some(error),
            ..Self::succeeding()
        }
    }

    pub fn scripted(responses: Vec<Result<TokenPair, RefreshError>>) -> Self {
        Self {
            scripted: Mutex::new(responses.into()),
            ..Self::succeeding()
        }
    }

    pub fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_tokens(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TokenExchange for FakeExchange {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(refresh_token.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(response) = self.scripted.lock().unwrap().pop_front() {
            return response;
        }
        match &self.fallback_error {
            Some(error) => Err(error.clone()),
            None => Ok(TokenPair::new(
                token_for(&format!("access-{}", n), Duration::hours(1)),
                token_for(&format!("refresh-{}", n), Duration::days(30)),
            )),
        }
    }
}

// ============================================================================
// FakeIssuer
// ============================================================================

pub enum IssuerBehavior {
    Grant,
    InvalidCredentials,
    ServerError,
    Offline,
}

pub struct FakeIssuer {
    behavior: IssuerBehavior,
    calls: AtomicUsize,
}

impl FakeIssuer {
    pub fn new(behavior: IssuerBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialIssuer for FakeIssuer {
    async fn login(&self, email: &str, _password: &str) -> Result<LoginGrant, LoginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            IssuerBehavior::Grant => Ok(LoginGrant {
                tokens: TokenPair::new(
                    token_for(email, Duration::hours(1)),
                    token_for(email, Duration::days(30)),
                ),
                user: profile("7"),
            }),
            IssuerBehavior::InvalidCredentials => Err(LoginError::InvalidCredentials),
            IssuerBehavior::ServerError => Err(LoginError::Server {
                status: 500,
                message: "boom".to_string(),
            }),
            IssuerBehavior::Offline => Err(LoginError::Network("connection refused".to_string())),
        }
    }
}
