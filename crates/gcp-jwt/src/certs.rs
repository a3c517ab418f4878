//! Certificate retrieval from the per-account public-key endpoint.
//!
//! One invocation performs exactly one HTTP GET. Retry policy belongs to the
//! caller ([`crate::resolver::KeyResolver`]), which never loops.
//!
//! The response body is a JSON object of key id → PEM-encoded certificate.
//! A parse failure for any single entry fails the entire fetch: a malformed
//! response must not silently narrow the verification candidate set.
//!
//! Cache lifetime comes from the response's HTTP caching headers, treating
//! this process as a private cache. When the headers yield nothing usable
//! and the caller configured a fallback duration, `now + fallback` is used;
//! otherwise the result is non-cacheable and must not be stored.

use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::keystore::CertificateSet;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AGE, CACHE_CONTROL, EXPIRES};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Google's x509 public-certificate endpoint, parameterized by appending the
/// service-account email or unique id.
pub const GOOGLE_CERTS_URL: &str = "https://www.googleapis.com/robot/v1/metadata/x509/";

/// Cap on header-derived cache lifetimes (24 hours). Google rotates
/// service-account keys well within this window.
const MAX_CACHE_LIFETIME_SECS: u64 = 86_400;

/// A fetched certificate set plus the instant it may be cached until.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    /// Parsed keys by key id.
    pub certs: Arc<CertificateSet>,
    /// `None` means the result is non-cacheable.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Fetch and parse the certificate set for `account`.
///
/// `base_url` is [`GOOGLE_CERTS_URL`] in production and a mock server in
/// tests. The caller-supplied `client` carries the timeout/deadline policy;
/// a timed-out or canceled request surfaces as [`Error::CertificateFetch`].
///
/// # Errors
///
/// [`Error::CertificateFetch`] on transport errors, non-success statuses,
/// malformed JSON, or any unparseable certificate in the batch.
#[instrument(skip_all, fields(account = %account))]
pub async fn fetch_certificates(
    client: &reqwest::Client,
    base_url: &str,
    account: &str,
    fallback_ttl: Option<Duration>,
) -> Result<CertificateBundle> {
    let url = format!("{base_url}{account}");

    let response = client.get(&url).send().await.map_err(|e| {
        warn!(target: "gcp_jwt.certs", error = %e, "certificate request failed");
        Error::CertificateFetch(e.to_string())
    })?;

    let status = response.status();
    if !status.is_success() {
        warn!(
            target: "gcp_jwt.certs",
            status = %status,
            "certificate endpoint returned an error status"
        );
        return Err(Error::CertificateFetch(format!(
            "certificate endpoint returned {status}"
        )));
    }

    let now = Utc::now();
    let header_expiry = cache_expiry(response.headers(), now);

    let raw: HashMap<String, String> = response.json().await.map_err(|e| {
        warn!(target: "gcp_jwt.certs", error = %e, "certificate response body was not a JSON key map");
        Error::CertificateFetch(e.to_string())
    })?;

    let mut certs = CertificateSet::with_capacity(raw.len());
    for (kid, pem) in raw {
        let key = PublicKey::from_pem(&pem).map_err(|e| {
            Error::CertificateFetch(format!("certificate `{kid}` could not be parsed: {e}"))
        })?;
        certs.insert(kid, Arc::new(key));
    }

    let expires_at = header_expiry.or_else(|| {
        let ttl = fallback_ttl?;
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        Some(now + ttl)
    });

    debug!(
        target: "gcp_jwt.certs",
        keys = certs.len(),
        cacheable = expires_at.is_some(),
        "fetched certificate set"
    );

    Ok(CertificateBundle {
        certs: Arc::new(certs),
        expires_at,
    })
}

/// Derive a private-cache expiration instant from response headers.
///
/// Follows the RFC 7234 subset the certificate endpoints actually emit:
/// `no-store`/`no-cache` forbid caching; `max-age` (adjusted by `Age`) takes
/// precedence over `Expires`; `s-maxage` is ignored because this is a
/// private cache. Returns `None` when nothing usable (or nothing future)
/// remains.
fn cache_expiry(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(value) = headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
        let directives: Vec<String> = value
            .split(',')
            .map(|d| d.trim().to_ascii_lowercase())
            .collect();

        if directives
            .iter()
            .any(|d| d == "no-store" || d == "no-cache")
        {
            return None;
        }

        if let Some(max_age) = directives
            .iter()
            .find_map(|d| d.strip_prefix("max-age="))
            .and_then(|v| v.parse::<u64>().ok())
        {
            let age = headers
                .get(AGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let remaining = max_age
                .saturating_sub(age)
                .min(MAX_CACHE_LIFETIME_SECS);
            if remaining == 0 {
                return None;
            }
            let remaining = i64::try_from(remaining).unwrap_or(i64::MAX);
            return Some(now + chrono::Duration::seconds(remaining));
        }
    }

    let expires = headers
        .get(EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|t| t.with_timezone(&Utc))?;

    (expires > now).then_some(expires)
}
