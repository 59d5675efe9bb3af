//! Durable key-value storage for session credentials.
//!
//! `TokenStore` is a dumb map: no validation, no retries. Reading a key that
//! was never written yields `Ok(None)` and deleting one is a no-op. The
//! `TokenVault` wrapper layers the pair invariants on top.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use keyring::Entry;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::{TokenPair, UserProfile};

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Storage key for the persisted user profile (JSON)
pub const USER_PROFILE_KEY: &str = "userProfile";

/// Keychain service name
const SERVICE_NAME: &str = "larder";

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

// ============================================================================
// OS keychain store
// ============================================================================

/// Store backed by the platform keychain via `keyring`.
///
/// Keychain calls are blocking, so each one runs on the blocking pool.
pub struct KeyringTokenStore {
    service: String,
}

impl KeyringTokenStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn with_entry<T, F>(&self, key: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Entry) -> Result<T> + Send + 'static,
    {
        let service = self.service.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &key).context("Failed to create keyring entry")?;
            op(entry)
        })
        .await
        .context("Keyring task failed")?
    }
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for KeyringTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read value from keychain"),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let value = value.to_string();
        self.with_entry(key, move |entry| {
            entry
                .set_password(&value)
                .context("Failed to store value in keychain")
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_entry(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete value from keychain"),
        })
        .await
    }
}

// ============================================================================
// Encrypted file store
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct SealedFile {
    salt: String,
    entries: HashMap<String, String>,
}

/// Store for targets without a keychain: one JSON file whose values are
/// sealed with ChaCha20-Poly1305 under a key derived from a passphrase.
///
/// Each file has its own random salt; each value its own random nonce.
pub struct EncryptedFileTokenStore {
    path: PathBuf,
    cipher: ChaCha20Poly1305,
    salt: [u8; SALT_LEN],
    // Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl EncryptedFileTokenStore {
    /// Open (or prepare to create) the store at `path`.
    ///
    /// Reads the file synchronously; call it during startup, not from a hot
    /// async path.
    pub fn open(path: PathBuf, passphrase: &str) -> Result<Self> {
        let existing = match std::fs::read_to_string(&path) {
            Ok(contents) => Some(Self::parse(&contents)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).context("Failed to read token store"),
        };
        let salt = match existing {
            Some(file) => {
                let bytes = STANDARD
                    .decode(&file.salt)
                    .context("Corrupt salt in token store")?;
                <[u8; SALT_LEN]>::try_from(bytes.as_slice())
                    .map_err(|_| anyhow!("Token store salt has wrong length"))?
            }
            None => {
                let mut salt = [0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                salt
            }
        };

        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| anyhow!("Failed to derive token store key: {}", e))?;

        Ok(Self {
            path,
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            salt,
            lock: Mutex::new(()),
        })
    }

    fn parse(contents: &str) -> Result<SealedFile> {
        serde_json::from_str(contents).context("Failed to parse token store")
    }

    async fn load(&self) -> Result<SealedFile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(SealedFile {
                salt: STANDARD.encode(self.salt),
                entries: HashMap::new(),
            }),
            Err(e) => Err(e).context("Failed to read token store"),
        }
    }

    async fn save(&self, file: &SealedFile) -> Result<()> {
        let contents = serde_json::to_vec_pretty(file)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &contents))
            .await
            .context("Token store write task failed")?
    }

    fn seal(&self, value: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), value.as_bytes())
            .map_err(|_| anyhow!("Failed to encrypt token store value"))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    fn open_value(&self, sealed: &str) -> Result<String> {
        let bytes = STANDARD
            .decode(sealed)
            .context("Corrupt value in token store")?;
        if bytes.len() < NONCE_LEN {
            return Err(anyhow!("Token store value is truncated"));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Failed to decrypt token store value (wrong passphrase?)"))?;
        String::from_utf8(plaintext).context("Token store value is not UTF-8")
    }
}

/// Write `contents` to a temporary file next to `path`, then rename it into
/// place. Readers see either the old file or the new one, never a partial one.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).context("Failed to create token store directory")?;

    let mut temp =
        NamedTempFile::new_in(parent).context("Failed to create temporary token store file")?;
    temp.write_all(contents)
        .context("Failed to write token store")?;
    temp.as_file()
        .sync_all()
        .context("Failed to flush token store")?;
    temp.persist(path)
        .map_err(|e| e.error)
        .context("Failed to replace token store")?;
    Ok(())
}

#[async_trait]
impl TokenStore for EncryptedFileTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        file.entries
            .get(key)
            .map(|sealed| self.open_value(sealed))
            .transpose()
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        file.entries.insert(key.to_string(), self.seal(value)?);
        self.save(&file).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        if file.entries.remove(key).is_some() {
            self.save(&file).await?;
        }
        Ok(())
    }
}

// ============================================================================
// Token vault
// ============================================================================

/// Pair-aware view over a `TokenStore`.
///
/// The refresh token is always written before the access token, so an access
/// token is never persisted without its companion.
#[derive(Clone)]
pub struct TokenVault {
    store: Arc<dyn TokenStore>,
}

impl TokenVault {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    pub async fn access_token(&self) -> Result<Option<String>> {
        self.store.get(ACCESS_TOKEN_KEY).await
    }

    pub async fn refresh_token(&self) -> Result<Option<String>> {
        self.store.get(REFRESH_TOKEN_KEY).await
    }

    /// Read both tokens; `None` unless both are present.
    pub async fn pair(&self) -> Result<Option<TokenPair>> {
        let refresh = self.refresh_token().await?;
        let access = self.access_token().await?;
        Ok(match (access, refresh) {
            (Some(access), Some(refresh)) => Some(TokenPair::new(access, refresh)),
            _ => None,
        })
    }

    pub async fn write_pair(&self, pair: &TokenPair) -> Result<()> {
        self.store
            .set(REFRESH_TOKEN_KEY, &pair.refresh_token)
            .await?;
        self.store.set(ACCESS_TOKEN_KEY, &pair.access_token).await?;
        debug!("Stored token pair");
        Ok(())
    }

    pub async fn profile(&self) -> Result<Option<UserProfile>> {
        match self.store.get(USER_PROFILE_KEY).await? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(profile) => Ok(Some(profile)),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable stored user profile");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn write_profile(&self, profile: &UserProfile) -> Result<()> {
        let json = serde_json::to_string(profile)?;
        self.store.set(USER_PROFILE_KEY, &json).await
    }

    /// Delete tokens and profile. Every key is attempted even if one fails.
    pub async fn clear(&self) -> Result<()> {
        let mut first_error = None;
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_PROFILE_KEY] {
            if let Err(e) = self.store.delete(key).await {
                warn!(key, error = %e, "Failed to delete stored value");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Cleared stored session");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
