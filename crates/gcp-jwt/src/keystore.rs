//! In-memory, process-wide cache of per-account certificate sets.
//!
//! One [`KeyStore`] is created at process start and shared by reference with
//! every verifier; it lives for the process lifetime. Reads dominate, so the
//! map sits behind a many-readers/occasional-writer lock, and the lock is
//! never held across an `.await` — fetches happen outside it, and a write
//! installs a fully-built [`CertificateSet`] in one step, so no reader ever
//! observes a half-populated entry.
//!
//! # Expiration
//!
//! Expiry is a function of wall-clock comparison at read time: an entry whose
//! expiration has passed is reported as a miss even though it may still be
//! physically present. Every [`KeyStore::put`] additionally sweeps all
//! expired entries (for any account), which bounds growth from accounts that
//! are queried once and never again.
//!
//! There is deliberately no delete or invalidate API. A verification failure
//! never evicts an entry: if it did, an attacker submitting unverifiable
//! tokens could force unbounded certificate refetching.

use crate::keys::PublicKey;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Mapping from key id to public key, as published by the certificate
/// endpoint for one account. Shared behind an `Arc` so cache readers and
/// verification candidates alias the same parsed keys.
pub type CertificateSet = HashMap<String, Arc<PublicKey>>;

struct CacheEntry {
    certs: Arc<CertificateSet>,
    expires_at: DateTime<Utc>,
}

/// Thread-safe, time-aware cache mapping accounts to certificate sets.
#[derive(Default)]
pub struct KeyStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl KeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live certificate set for `account`.
    ///
    /// `None` when no entry exists or the entry's expiration has passed.
    /// No side effects on a miss.
    #[must_use]
    pub fn get(&self, account: &str) -> Option<Arc<CertificateSet>> {
        let entries = self.entries.read();
        let entry = entries.get(account)?;
        if entry.expires_at <= Utc::now() {
            return None;
        }
        Some(Arc::clone(&entry.certs))
    }

    /// Return a single key by id from the live set for `account`.
    #[must_use]
    pub fn get_one(&self, account: &str, kid: &str) -> Option<Arc<PublicKey>> {
        self.get(account)?.get(kid).cloned()
    }

    /// Insert or wholesale-replace the entry for `account`.
    ///
    /// A refreshed account's entire key set supersedes the old one; there is
    /// no partial merge. If `expires_at` is not in the future the insertion
    /// is skipped (storing an already-expired entry is wasted work). Every
    /// call sweeps expired entries across all accounts.
    pub fn put(&self, account: &str, certs: Arc<CertificateSet>, expires_at: DateTime<Utc>) {
        let now = Utc::now();
        let mut entries = self.entries.write();

        if expires_at > now {
            debug!(
                target: "gcp_jwt.keystore",
                account = %account,
                keys = certs.len(),
                expires_at = %expires_at,
                "caching certificate set"
            );
            entries.insert(account.to_string(), CacheEntry { certs, expires_at });
        }

        entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of physically stored entries, expired or not.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}
