//! Authenticated HTTP client for the larder API.
//!
//! `AuthClient` is the hook point between the shared reqwest client and the
//! session: it attaches the current bearer token to outgoing requests and,
//! on a 401, runs one coordinated refresh and resends the request once.

use std::sync::Arc;

use anyhow::Result;
use reqwest::{header, Client, Method, Request, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use super::ApiError;
use crate::auth::{RefreshCoordinator, TokenVault};
use crate::config::Config;

/// Which send of a request this is. Only the first may be retried after a
/// 401; the retry itself never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt(u32);

impl Attempt {
    /// Refresh-and-retry rounds allowed per request
    pub const MAX_AUTH_RETRIES: u32 = 1;

    pub fn first() -> Self {
        Attempt(0)
    }

    /// Zero for the original send
    pub fn retries(self) -> u32 {
        self.0
    }

    pub fn can_retry_auth(self) -> bool {
        self.0 < Self::MAX_AUTH_RETRIES
    }

    pub fn next(self) -> Self {
        Attempt(self.0 + 1)
    }
}

/// API client for larder.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthClient {
    client: Client,
    base_url: String,
    vault: TokenVault,
    refresher: Arc<RefreshCoordinator>,
}

impl AuthClient {
    /// Build the shared HTTP client with the configured timeout
    pub fn http_client(config: &Config) -> Result<Client> {
        Ok(Client::builder().timeout(config.request_timeout()).build()?)
    }

    pub fn new(
        client: Client,
        base_url: &str,
        vault: TokenVault,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            vault,
            refresher,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Start building a request against the API host
    pub fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, self.url(path))
    }

    // ===== Hooks =====

    /// Outgoing hook: attach `Authorization: Bearer <access>` if a token is
    /// stored. Never refreshes. Without a stored token the request is sent
    /// exactly as built, including any `Authorization` header the caller set.
    pub async fn authorize(&self, request: &mut Request) {
        let token = match self.vault.access_token().await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Could not read access token, sending unauthenticated");
                None
            }
        };

        let Some(token) = token else {
            return;
        };

        match header::HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers_mut().insert(header::AUTHORIZATION, value);
            }
            Err(_) => warn!("Stored access token is not a valid header value"),
        }
    }

    /// Error hook: pass successes through, classify everything else.
    pub async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    // ===== Execution =====

    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        self.execute_attempt(request, Attempt::first()).await
    }

    /// Send `request`, refreshing and resending once on 401 if `attempt`
    /// still allows it. On refresh failure the original 401 is returned with
    /// the refresh failure attached.
    pub async fn execute_attempt(
        &self,
        mut request: Request,
        mut attempt: Attempt,
    ) -> Result<Response, ApiError> {
        loop {
            // Copy taken before authorizing, so a resend picks up the new token
            let replay = if attempt.can_retry_auth() {
                request.try_clone()
            } else {
                None
            };

            self.authorize(&mut request).await;
            let method = request.method().clone();
            let url = request.url().clone();
            let response = self.client.execute(request).await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Self::check_response(response).await;
            }

            let original = Self::check_response(response)
                .await
                .err()
                .unwrap_or_else(|| ApiError::from_status(StatusCode::UNAUTHORIZED, ""));

            if !attempt.can_retry_auth() {
                debug!(%method, %url, retries = attempt.retries(), "Unauthorized after retry, giving up");
                return Err(original);
            }
            let Some(replay) = replay else {
                warn!(%method, %url, "Unauthorized and request body cannot be replayed");
                return Err(original);
            };

            match self.refresher.refresh().await {
                Ok(_) => {
                    info!(%method, %url, "Token refreshed after 401, resending request");
                    request = replay;
                    attempt = attempt.next();
                }
                Err(failure) => {
                    warn!(%method, %url, error = %failure, "Token refresh after 401 failed");
                    return Err(match original {
                        ApiError::Unauthorized { message, .. } => ApiError::Unauthorized {
                            message,
                            refresh_failure: Some(failure),
                        },
                        other => other,
                    });
                }
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let request = self.request(Method::GET, path).build()?;
        self.execute(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = self.request(Method::POST, path).json(body).build()?;
        self.execute(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// Raw GET returning the response body as text
    pub async fn get_text(&self, path: &str) -> Result<String, ApiError> {
        let request = self.request(Method::GET, path).build()?;
        Ok(self.execute(request).await?.text().await?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::refresh::REFRESH_PATH;
    use crate::auth::store::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
    use crate::auth::{HttpTokenExchange, RefreshError};
    use crate::models::TokenPair;
    use crate::test_support::{empty_vault, seeded_vault, stored, FakeExchange};
    use serde_json::json;
    use wiremock::matchers::{header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, vault: TokenVault) -> AuthClient {
        let exchange = HttpTokenExchange::new(Client::new(), &server.uri());
        let refresher = Arc::new(RefreshCoordinator::new(vault.clone(), Arc::new(exchange)));
        AuthClient::new(Client::new(), &server.uri(), vault, refresher)
    }

    async fn mount_refresh(server: &MockServer, status: u16, expected_calls: u64) {
        let template = if status == 200 {
            ResponseTemplate::new(200)
                .set_body_json(json!({ "token": "new-access", "refreshToken": "new-refresh" }))
        } else {
            ResponseTemplate::new(status)
        };
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(template)
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[test]
    fn test_attempt_allows_exactly_one_retry() {
        let first = Attempt::first();
        assert!(first.can_retry_auth());
        assert_eq!(first.retries(), 0);
        let second = first.next();
        assert!(!second.can_retry_auth());
        assert_eq!(second.retries(), 1);
    }

    // -------------------------------------------------------------------------
    // Outgoing Hook Tests
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_bearer_header_attached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/fridge"))
            .and(header_is("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let (_store, vault) = seeded_vault("access-1", "refresh-1").await;
        let client = client_for(&server, vault);
        let items: Vec<serde_json::Value> = client.get("/api/fridge").await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_no_token_sends_unauthenticated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/dictionary"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let (_store, vault) = empty_vault().await;
        let client = client_for(&server, vault);
        assert_eq!(client.get_text("api/dictionary").await.unwrap(), "ok");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_caller_authorization_kept_without_stored_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/share/abc"))
            .and(header_is("authorization", "Basic c2hhcmU6bGluaw=="))
            .respond_with(ResponseTemplate::new(200).set_body_string("shared"))
            .expect(1)
            .mount(&server)
            .await;

        let (_store, vault) = empty_vault().await;
        let client = client_for(&server, vault);
        let request = client
            .request(Method::GET, "/api/share/abc")
            .header(header::AUTHORIZATION, "Basic c2hhcmU6bGluaw==")
            .build()
            .unwrap();

        let response = client.execute(request).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "shared");
    }

    // -------------------------------------------------------------------------
    // Retry Policy Tests
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_401_refreshes_and_retries_once() {
        let server = MockServer::start().await;
        mount_refresh(&server, 200, 1).await;
        Mock::given(method("GET"))
            .and(path("/api/meal-plans"))
            .and(header_is("authorization", "Bearer new-access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "plans": 3 })))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/meal-plans"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let (store, vault) = seeded_vault("old-access", "old-refresh").await;
        let client = client_for(&server, vault);

        let body: serde_json::Value = client.get("/api/meal-plans").await.unwrap();
        assert_eq!(body["plans"], 3);
        assert_eq!(
            stored(&store, REFRESH_TOKEN_KEY).await.as_deref(),
            Some("new-refresh")
        );
    }

    #[tokio::test]
    async fn test_persistent_401_is_surfaced_after_one_retry() {
        let server = MockServer::start().await;
        mount_refresh(&server, 200, 1).await;
        Mock::given(method("GET"))
            .and(path("/api/shopping-lists"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let (_store, vault) = seeded_vault("old-access", "old-refresh").await;
        let client = client_for(&server, vault);

        let err = client
            .get::<serde_json::Value>("/api/shopping-lists")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::Unauthorized {
                refresh_failure: None,
                ..
            }
        ));
        assert!(!err.requires_login());
    }

    #[tokio::test]
    async fn test_retry_attempt_is_not_retried_again() {
        let server = MockServer::start().await;
        mount_refresh(&server, 200, 0).await;
        Mock::given(method("GET"))
            .and(path("/api/units"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let (_store, vault) = seeded_vault("old-access", "old-refresh").await;
        let client = client_for(&server, vault);
        let request = client.request(Method::GET, "/api/units").build().unwrap();

        let err = client
            .execute_attempt(request, Attempt::first().next())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn test_refresh_rejection_propagates_original_401() {
        let server = MockServer::start().await;
        mount_refresh(&server, 401, 1).await;
        Mock::given(method("GET"))
            .and(path("/api/recipes"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "jwt expired" })))
            .expect(1)
            .mount(&server)
            .await;

        let (store, vault) = seeded_vault("old-access", "old-refresh").await;
        let client = client_for(&server, vault);

        let err = client
            .get::<serde_json::Value>("/api/recipes")
            .await
            .unwrap_err();
        assert_eq!(err.info().message, "jwt expired");
        assert!(err.requires_login());
        // Clearing storage is the session's decision, not the interceptor's
        assert_eq!(
            stored(&store, ACCESS_TOKEN_KEY).await.as_deref(),
            Some("old-access")
        );
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let server = MockServer::start().await;
        // Slow refresh, so every request's 401 arrives while it is in flight
        Mock::given(method("POST"))
            .and(path(REFRESH_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "token": "new-access", "refreshToken": "new-refresh" }))
                    .set_delay(std::time::Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/ingredients"))
            .and(header_is("authorization", "Bearer new-access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/ingredients"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (_store, vault) = seeded_vault("old-access", "old-refresh").await;
        let client = client_for(&server, vault);

        let requests: Vec<Request> = (0..5)
            .map(|_| client.request(Method::GET, "/api/ingredients").build().unwrap())
            .collect();
        let mut pending = Vec::new();
        for request in requests {
            let client = client.clone();
            pending.push(tokio::spawn(async move { client.execute(request).await }));
        }
        for handle in pending {
            assert!(handle.await.unwrap().is_ok());
        }
    }

    // -------------------------------------------------------------------------
    // Error Classification Tests
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_other_errors_never_touch_tokens() {
        let server = MockServer::start().await;
        mount_refresh(&server, 200, 0).await;
        for (route, status) in [("/api/a", 400), ("/api/b", 429), ("/api/c", 503)] {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }

        let (store, vault) = seeded_vault("access", "refresh").await;
        let client = client_for(&server, vault);

        let validation = client.get_text("/api/a").await.unwrap_err();
        assert!(matches!(validation, ApiError::Validation(_)));
        let limited = client.get_text("/api/b").await.unwrap_err();
        assert!(matches!(limited, ApiError::RateLimited));
        let server_error = client.get_text("/api/c").await.unwrap_err();
        assert_eq!(server_error.info().status, Some(503));
        assert!(server_error.is_retryable());

        assert_eq!(stored(&store, ACCESS_TOKEN_KEY).await.as_deref(), Some("access"));
    }

    #[tokio::test]
    async fn test_no_response_is_network_error() {
        let (_store, vault) = seeded_vault("access", "refresh").await;
        let refresher = Arc::new(RefreshCoordinator::new(
            vault.clone(),
            Arc::new(FakeExchange::succeeding()),
        ));
        let client = AuthClient::new(Client::new(), "http://127.0.0.1:9", vault, refresher);

        let err = client.get_text("/api/fridge").await.unwrap_err();
        assert!(matches!(err, ApiError::NetworkError(_)));
        assert_eq!(err.info().status, None);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_refresh_network_failure_keeps_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/fridge"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (store, vault) = seeded_vault("access", "refresh").await;
        let refresher = Arc::new(RefreshCoordinator::new(
            vault.clone(),
            Arc::new(FakeExchange::scripted(vec![Err(RefreshError::Network(
                "timed out".to_string(),
            ))])),
        ));
        let client = AuthClient::new(Client::new(), &server.uri(), vault, refresher);

        let err = client.get_text("/api/fridge").await.unwrap_err();
        assert!(!err.requires_login());
        assert_eq!(
            store_pair(&store).await,
            Some(TokenPair::new("access", "refresh"))
        );
    }

    async fn store_pair(store: &crate::auth::MemoryTokenStore) -> Option<TokenPair> {
        Some(TokenPair::new(
            stored(store, ACCESS_TOKEN_KEY).await?,
            stored(store, REFRESH_TOKEN_KEY).await?,
        ))
    }
}
