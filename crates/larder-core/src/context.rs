//! Wiring: builds the storage, refresh, session and HTTP layers from `Config`.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::api::AuthClient;
use crate::auth::{
    CredentialIssuer, EncryptedFileTokenStore, HttpTokenExchange, KeyringTokenStore,
    MemoryTokenStore, RefreshCoordinator, SessionManager, SessionSettings, TokenStore, TokenVault,
};
use crate::config::{Config, TokenBackend, ENV_STORE_PASSPHRASE};

/// Open the token store selected by `config.token_backend`.
///
/// The encrypted-file store needs `LARDER_STORE_PASSPHRASE`.
pub fn open_token_store(config: &Config) -> Result<Arc<dyn TokenStore>> {
    let store: Arc<dyn TokenStore> = match config.token_backend {
        TokenBackend::Keyring => Arc::new(KeyringTokenStore::new()),
        TokenBackend::Memory => Arc::new(MemoryTokenStore::new()),
        TokenBackend::EncryptedFile => {
            let passphrase = std::env::var(ENV_STORE_PASSPHRASE).map_err(|_| {
                anyhow!("{} must be set for the encrypted-file backend", ENV_STORE_PASSPHRASE)
            })?;
            Arc::new(EncryptedFileTokenStore::open(config.token_file()?, &passphrase)?)
        }
    };
    Ok(store)
}

/// Everything the rest of the application needs, built once and shared.
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub session: Arc<SessionManager>,
    pub api: AuthClient,
}

impl AppContext {
    pub fn new(config: Config, issuer: Arc<dyn CredentialIssuer>) -> Result<Self> {
        let store = open_token_store(&config)?;
        Self::with_store(config, store, issuer)
    }

    pub fn with_store(
        config: Config,
        store: Arc<dyn TokenStore>,
        issuer: Arc<dyn CredentialIssuer>,
    ) -> Result<Self> {
        let http = AuthClient::http_client(&config)?;
        let vault = TokenVault::new(store);
        let exchange = HttpTokenExchange::new(http.clone(), config.api_base_url());
        let refresher = Arc::new(RefreshCoordinator::new(vault.clone(), Arc::new(exchange)));

        let api = AuthClient::new(
            http,
            config.api_base_url(),
            vault.clone(),
            Arc::clone(&refresher),
        );
        let session = Arc::new(SessionManager::new(
            vault,
            refresher,
            issuer,
            SessionSettings::from_config(&config),
        ));

        info!(api_base_url = %config.api_base_url(), backend = ?config.token_backend, "Session context ready");
        Ok(Self {
            config,
            session,
            api,
        })
    }
}
