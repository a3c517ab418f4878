//! Configuration for the IAM and KMS signing backends.
//!
//! Configs are built once at startup and shared behind an `Arc` by every
//! signer and verifier that uses the same backend identity. Both types follow
//! the builder-style `with_*` convention and validate what they can at
//! construction time.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

/// Configuration for signing and verifying through the IAM credentials API.
pub struct IamConfig {
    service_account: String,
    enable_cache: bool,
    cache_expiration: Option<Duration>,
    client: Option<reqwest::Client>,
    last_key_id: RwLock<Option<String>>,
}

impl IamConfig {
    /// Create a config for `service_account` (email or unique id).
    ///
    /// Certificate caching starts enabled with no fallback expiration, so
    /// cache lifetimes come entirely from response headers.
    #[must_use]
    pub fn new(service_account: impl Into<String>) -> Self {
        Self {
            service_account: service_account.into(),
            enable_cache: true,
            cache_expiration: None,
            client: None,
            last_key_id: RwLock::new(None),
        }
    }

    /// Enable or disable the certificate cache for verification.
    #[must_use]
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    /// Fallback cache lifetime for certificate responses whose headers carry
    /// no usable expiration.
    #[must_use]
    pub fn with_cache_expiration(mut self, expiration: Duration) -> Self {
        self.cache_expiration = Some(expiration);
        self
    }

    /// Use a caller-supplied HTTP client (credentials, proxies, timeouts)
    /// instead of a default one.
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// The configured service account.
    #[must_use]
    pub fn service_account(&self) -> &str {
        &self.service_account
    }

    /// Whether verification may use the certificate cache.
    #[must_use]
    pub fn cache_enabled(&self) -> bool {
        self.enable_cache
    }

    /// The fallback cache lifetime, if any.
    #[must_use]
    pub fn cache_expiration(&self) -> Option<Duration> {
        self.cache_expiration
    }

    /// The configured HTTP client, if any.
    #[must_use]
    pub fn client(&self) -> Option<&reqwest::Client> {
        self.client.as_ref()
    }

    /// The key id reported by the most recent signing call, if any.
    ///
    /// IAM chooses which private key signs each request, so the id is only
    /// known after the fact. Best-effort under concurrency: parallel signing
    /// calls race and the last writer wins.
    #[must_use]
    pub fn last_key_id(&self) -> Option<String> {
        self.last_key_id.read().clone()
    }

    pub(crate) fn set_last_key_id(&self, key_id: String) {
        *self.last_key_id.write() = Some(key_id);
    }
}

impl fmt::Debug for IamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IamConfig")
            .field("service_account", &self.service_account)
            .field("enable_cache", &self.enable_cache)
            .field("cache_expiration", &self.cache_expiration)
            .field("custom_client", &self.client.is_some())
            .finish()
    }
}

/// Configuration for signing and verifying through a Cloud KMS key version.
#[derive(Clone)]
pub struct KmsConfig {
    key_path: String,
    key_id: String,
    client: Option<reqwest::Client>,
}

impl KmsConfig {
    /// Create a config for a fully-qualified key-version resource path
    /// (`projects/.../cryptoKeyVersions/N`).
    ///
    /// The key id used in token headers is derived from the path here, once:
    /// a lowercase hex SHA-256 digest of the path bytes. It is stable across
    /// processes, carries no path internals, and never changes for the
    /// lifetime of the config.
    #[must_use]
    pub fn new(key_path: impl Into<String>) -> Self {
        let key_path = key_path.into();
        let key_id = hex::encode(Sha256::digest(key_path.as_bytes()));
        Self {
            key_path,
            key_id,
            client: None,
        }
    }

    /// Use a caller-supplied HTTP client instead of a default one.
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// The configured key-version resource path.
    #[must_use]
    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    /// The derived key id for this key path.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The configured HTTP client, if any.
    #[must_use]
    pub fn client(&self) -> Option<&reqwest::Client> {
        self.client.as_ref()
    }
}

impl fmt::Debug for KmsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsConfig")
            .field("key_path", &self.key_path)
            .field("key_id", &self.key_id)
            .field("custom_client", &self.client.is_some())
            .finish()
    }
}
