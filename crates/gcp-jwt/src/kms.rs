//! Signing and verification through Cloud KMS asymmetric keys.
//!
//! KMS signs a caller-computed digest, so the signer hashes the signing input
//! locally with the algorithm's hash before calling `asymmetricSign`. ECDSA
//! key versions return ASN.1 DER signatures, which are converted to the
//! fixed-width `r || s` form JWS requires (RFC 7518 §3.4) before the token is
//! assembled.
//!
//! KMS key versions are immutable: the public key for a given version never
//! changes, so fetched keys are cached for the process lifetime with no
//! expiration. Tokens carry a key id derived from the key path (see
//! [`crate::config::KmsConfig`]) rather than the path itself.

use crate::algorithm::SignatureAlgorithm;
use crate::config::KmsConfig;
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::verify::{decode_protected_header, split_compact, VerificationKey};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Production base URL for the Cloud KMS API.
pub const CLOUD_KMS_URL: &str = "https://cloudkms.googleapis.com";

/// The two Cloud KMS RPCs this crate uses, as a trait seam for tests.
#[async_trait]
pub trait KmsApi: Send + Sync {
    /// Fetch the PEM-encoded public key of a key version.
    async fn get_public_key(&self, key_path: &str) -> Result<String>;

    /// Sign a precomputed digest, returning the raw signature bytes
    /// (ASN.1 DER for ECDSA key versions).
    async fn asymmetric_sign(
        &self,
        key_path: &str,
        algorithm: SignatureAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>>;
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Deserialize)]
struct PublicKeyResponse {
    pem: String,
}

#[derive(Deserialize)]
struct AsymmetricSignResponse {
    signature: String,
}

/// [`KmsApi`] implementation over the REST endpoints. Like the IAM client,
/// it expects the supplied `reqwest::Client` to carry credentials.
#[derive(Debug, Clone)]
pub struct HttpKmsClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpKmsClient {
    /// Create a client against the production endpoint.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: CLOUD_KMS_URL.to_string(),
        }
    }

    /// Override the base URL. Used by tests.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl KmsApi for HttpKmsClient {
    #[instrument(skip_all, fields(key_path = %key_path))]
    async fn get_public_key(&self, key_path: &str) -> Result<String> {
        let url = format!("{}/v1/{key_path}/publicKey", self.base_url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            warn!(target: "gcp_jwt.kms", error = %e, "public key request failed");
            Error::CertificateFetch(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::CertificateFetch(format!(
                "public key endpoint returned {status}"
            )));
        }

        let body: PublicKeyResponse = response
            .json()
            .await
            .map_err(|e| Error::CertificateFetch(e.to_string()))?;

        Ok(body.pem)
    }

    #[instrument(skip_all, fields(key_path = %key_path))]
    async fn asymmetric_sign(
        &self,
        key_path: &str,
        algorithm: SignatureAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>> {
        let url = format!("{}/v1/{key_path}:asymmetricSign", self.base_url);
        let body = serde_json::json!({
            "digest": { algorithm.kms_digest_field(): STANDARD.encode(digest) }
        });

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            warn!(target: "gcp_jwt.kms", error = %e, "signing request failed");
            Error::Signing(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Signing(format!(
                "signing backend returned {status}: {body}"
            )));
        }

        let body: AsymmetricSignResponse = response
            .json()
            .await
            .map_err(|e| Error::Signing(format!("unparseable signing response: {e}")))?;

        STANDARD
            .decode(&body.signature)
            .map_err(|e| Error::Signing(format!("unparseable signature encoding: {e}")))
    }
}

// ============================================================================
// Public-key cache
// ============================================================================

/// Process-lifetime cache of KMS public keys, keyed by derived key id.
///
/// Entries never expire and are never evicted; a key version's public half
/// is immutable, and rotating a key means configuring a new version path
/// (and thus a new id). Under concurrent misses both tasks fetch, and the
/// first write wins so every caller aliases one parsed key.
#[derive(Default)]
pub struct KmsKeyCache {
    keys: RwLock<HashMap<String, Arc<PublicKey>>>,
}

impl KmsKeyCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached key for `config`, fetching it on first use.
    ///
    /// # Errors
    ///
    /// [`Error::CertificateFetch`] or [`Error::InvalidKey`] from the fetch
    /// and parse path.
    pub async fn get_or_fetch(
        &self,
        api: &dyn KmsApi,
        config: &KmsConfig,
    ) -> Result<Arc<PublicKey>> {
        if let Some(key) = self.keys.read().get(config.key_id()) {
            return Ok(Arc::clone(key));
        }

        // Fetch outside the lock; a racing task may get here too.
        let pem = api.get_public_key(config.key_path()).await?;
        let key = Arc::new(PublicKey::from_pem(&pem)?);

        debug!(
            target: "gcp_jwt.kms",
            key_id = %config.key_id(),
            "caching public key"
        );

        let mut keys = self.keys.write();
        let stored = keys
            .entry(config.key_id().to_string())
            .or_insert(key);
        Ok(Arc::clone(stored))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.keys.read().len()
    }
}

impl std::fmt::Debug for KmsKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsKeyCache")
            .field("keys", &self.keys.read().len())
            .finish()
    }
}

// ============================================================================
// Signer
// ============================================================================

/// Token signer backed by a Cloud KMS key version.
pub struct KmsSigner {
    api: Arc<dyn KmsApi>,
    config: Arc<KmsConfig>,
    algorithm: SignatureAlgorithm,
}

impl KmsSigner {
    /// Create a signer. `algorithm` must match the key version's configured
    /// algorithm; KMS rejects mismatched digests server-side.
    #[must_use]
    pub fn new(
        api: Arc<dyn KmsApi>,
        config: Arc<KmsConfig>,
        algorithm: SignatureAlgorithm,
    ) -> Self {
        Self {
            api,
            config,
            algorithm,
        }
    }

    /// The algorithm this signer produces.
    #[must_use]
    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// The key id tokens from this signer should carry in their header.
    #[must_use]
    pub fn key_id(&self) -> &str {
        self.config.key_id()
    }

    /// Sign `signing_input` (`header.payload`) and return the complete token.
    ///
    /// # Errors
    ///
    /// [`Error::MissingConfig`] without a key path, [`Error::Signing`] when
    /// the backend rejects the request or returns an undecodable signature.
    pub async fn sign(&self, signing_input: &str) -> Result<String> {
        if self.config.key_path().is_empty() {
            return Err(Error::MissingConfig("key_path"));
        }

        let digest = self.algorithm.digest(signing_input.as_bytes());
        let raw = self
            .api
            .asymmetric_sign(self.config.key_path(), self.algorithm, &digest)
            .await?;

        let signature = match self.algorithm {
            SignatureAlgorithm::Es256 => p256::ecdsa::Signature::from_der(&raw)
                .map_err(|e| Error::Signing(format!("bad DER signature: {e}")))?
                .to_bytes()
                .as_slice()
                .to_vec(),
            SignatureAlgorithm::Es384 => p384::ecdsa::Signature::from_der(&raw)
                .map_err(|e| Error::Signing(format!("bad DER signature: {e}")))?
                .to_bytes()
                .as_slice()
                .to_vec(),
            SignatureAlgorithm::Rs256 | SignatureAlgorithm::Ps256 => raw,
        };

        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(&signature)
        ))
    }
}

impl std::fmt::Debug for KmsSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsSigner")
            .field("key_id", &self.config.key_id())
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Token verifier for KMS-signed tokens.
///
/// There is exactly one legitimate key per config, so a token declaring a
/// different key id fails immediately, without touching the network.
pub struct KmsVerifier {
    api: Arc<dyn KmsApi>,
    config: Arc<KmsConfig>,
    cache: Arc<KmsKeyCache>,
    algorithm: SignatureAlgorithm,
}

impl KmsVerifier {
    /// Create a verifier sharing `cache` with other KMS verifiers in the
    /// process.
    #[must_use]
    pub fn new(
        api: Arc<dyn KmsApi>,
        config: Arc<KmsConfig>,
        cache: Arc<KmsKeyCache>,
        algorithm: SignatureAlgorithm,
    ) -> Self {
        Self {
            api,
            config,
            cache,
            algorithm,
        }
    }

    /// Verify a raw fixed-width signature over `signing_input`, optionally
    /// pinned to a declared key id.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] for a foreign key id, plus the fetch, parse and
    /// verification errors.
    pub async fn verify(
        &self,
        signing_input: &str,
        signature: &[u8],
        kid: Option<&str>,
    ) -> Result<()> {
        if self.config.key_path().is_empty() {
            return Err(Error::MissingConfig("key_path"));
        }

        if let Some(kid) = kid.filter(|k| !k.is_empty()) {
            if kid != self.config.key_id() {
                return Err(Error::KeyNotFound {
                    account: self.config.key_path().to_string(),
                    kid: kid.to_string(),
                });
            }
        }

        let key = self.cache.get_or_fetch(self.api.as_ref(), &self.config).await?;
        VerificationKey::Single(key).verify(signing_input.as_bytes(), signature, self.algorithm)
    }

    /// Verify a complete compact JWS.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedToken`] for structural problems, plus everything
    /// [`KmsVerifier::verify`] produces.
    #[instrument(skip_all)]
    pub async fn verify_token(&self, token: &str) -> Result<()> {
        let header = decode_protected_header(token)?;
        if let Some(alg) = header.alg.as_deref() {
            if SignatureAlgorithm::from_jose_name(alg) != Some(self.algorithm) {
                return Err(Error::SignatureMismatch);
            }
        }

        let parts = split_compact(token)?;
        let signature = URL_SAFE_NO_PAD
            .decode(parts.signature)
            .map_err(|_| Error::MalformedToken)?;

        self.verify(parts.signing_input, &signature, header.kid.as_deref())
            .await
    }
}
