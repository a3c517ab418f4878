//! Key-id resolution over the certificate cache and fetch pipeline.
//!
//! The resolver owns the cache-first policy: consult the [`KeyStore`], fetch
//! only on a miss, and store the result only when it is cacheable and caching
//! is enabled for this call. It performs at most one fetch per invocation.
//!
//! A declared key id is an exact-match requirement against whichever set the
//! resolver is already working with. If the cached set lacks the id, the
//! lookup fails without going back to the network: cached sets were complete
//! when stored, so a missing id means the token names a key the account never
//! published, not that the cache is stale. Re-fetching on that path would let
//! forged tokens drive request load.

use crate::certs::{fetch_certificates, GOOGLE_CERTS_URL};
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::keystore::{CertificateSet, KeyStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Resolves verification keys for an account, by key id or wholesale.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    store: Arc<KeyStore>,
    certs_url: String,
}

impl KeyResolver {
    /// Create a resolver over `store`, pointed at Google's production
    /// certificate endpoint.
    #[must_use]
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self {
            store,
            certs_url: GOOGLE_CERTS_URL.to_string(),
        }
    }

    /// Override the certificate endpoint base URL. Used by tests.
    #[must_use]
    pub fn with_certs_url(mut self, url: impl Into<String>) -> Self {
        self.certs_url = url.into();
        self
    }

    /// Resolve the verification candidates for `account`.
    ///
    /// With a non-empty `kid`, the result is exactly one key or
    /// [`Error::KeyNotFound`]. Without one (absent or empty), the result is
    /// every key the account currently publishes. `cache_enabled` gates both
    /// the cache read and the write-back; `fallback_ttl` is handed to the
    /// fetch for responses whose headers carry no usable lifetime.
    ///
    /// # Errors
    ///
    /// [`Error::CertificateFetch`] when the fetch path fails,
    /// [`Error::KeyNotFound`] for a declared-but-absent key id, and
    /// [`Error::NoCandidateKeys`] when the account publishes no keys at all.
    #[instrument(skip_all, fields(account = %account, kid = kid.unwrap_or("")))]
    pub async fn resolve(
        &self,
        client: &reqwest::Client,
        account: &str,
        kid: Option<&str>,
        cache_enabled: bool,
        fallback_ttl: Option<Duration>,
    ) -> Result<Vec<Arc<PublicKey>>> {
        let kid = kid.filter(|k| !k.is_empty());

        let certs = if cache_enabled {
            if let Some(cached) = self.store.get(account) {
                debug!(target: "gcp_jwt.resolver", "cache hit");
                cached
            } else {
                self.fetch_and_store(client, account, cache_enabled, fallback_ttl)
                    .await?
            }
        } else {
            self.fetch_and_store(client, account, cache_enabled, fallback_ttl)
                .await?
        };

        select_candidates(&certs, account, kid)
    }

    async fn fetch_and_store(
        &self,
        client: &reqwest::Client,
        account: &str,
        cache_enabled: bool,
        fallback_ttl: Option<Duration>,
    ) -> Result<Arc<CertificateSet>> {
        let bundle = fetch_certificates(client, &self.certs_url, account, fallback_ttl).await?;

        if cache_enabled {
            if let Some(expires_at) = bundle.expires_at {
                self.store.put(account, Arc::clone(&bundle.certs), expires_at);
            }
        }

        Ok(bundle.certs)
    }
}

/// Project the candidate keys out of a certificate set.
fn select_candidates(
    certs: &Arc<CertificateSet>,
    account: &str,
    kid: Option<&str>,
) -> Result<Vec<Arc<PublicKey>>> {
    if let Some(kid) = kid {
        let key = certs.get(kid).cloned().ok_or_else(|| Error::KeyNotFound {
            account: account.to_string(),
            kid: kid.to_string(),
        })?;
        return Ok(vec![key]);
    }

    if certs.is_empty() {
        return Err(Error::NoCandidateKeys);
    }

    Ok(certs.values().cloned().collect())
}
