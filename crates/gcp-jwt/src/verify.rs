//! Compact-JWS handling and the brute-force verification strategy.
//!
//! When a token carries no key id, the verifier cannot know which published
//! key produced it, so [`verify_any`] tries every candidate and succeeds if
//! any one of them verifies. Candidate order is whatever the certificate set
//! yields; a match short-circuits, and when nothing matches the error from
//! the last candidate tried is returned.

use crate::algorithm::SignatureAlgorithm;
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, trace};

/// Upper bound on token size accepted by the parsing helpers. Anything
/// larger is rejected before any decoding work happens.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// Verify `signature` over `message` against a set of candidate keys.
///
/// Returns `Ok(())` as soon as one candidate verifies. With an empty
/// candidate set the result is [`Error::NoCandidateKeys`]; otherwise, when
/// every candidate fails, the error from the last one tried is returned.
///
/// # Errors
///
/// [`Error::NoCandidateKeys`], [`Error::SignatureMismatch`], or
/// [`Error::InvalidKeyType`] when the last candidate could not serve the
/// algorithm at all.
pub fn verify_any(
    message: &[u8],
    signature: &[u8],
    candidates: &[Arc<PublicKey>],
    algorithm: SignatureAlgorithm,
) -> Result<()> {
    if candidates.is_empty() {
        return Err(Error::NoCandidateKeys);
    }

    let mut last_err = Error::SignatureMismatch;
    for (index, key) in candidates.iter().enumerate() {
        match key.verify(algorithm, message, signature) {
            Ok(()) => {
                debug!(
                    target: "gcp_jwt.verify",
                    candidates = candidates.len(),
                    matched = index,
                    "signature verified"
                );
                return Ok(());
            }
            Err(err) => {
                trace!(target: "gcp_jwt.verify", candidate = index, "candidate rejected");
                last_err = err;
            }
        }
    }

    Err(last_err)
}

/// The key material a verification call is permitted to use.
///
/// Tagged variants instead of an any-typed "key" parameter: a declared key
/// id resolves to [`VerificationKey::Single`], no declared id to the full
/// [`VerificationKey::Candidates`] set, and [`VerificationKey::None`] is a
/// resolution that produced nothing.
#[derive(Debug, Clone)]
pub enum VerificationKey {
    /// No key material available.
    None,
    /// Exactly one permitted key, e.g. pinned by a declared key id.
    Single(Arc<PublicKey>),
    /// An unordered candidate set to brute-force.
    Candidates(Vec<Arc<PublicKey>>),
}

impl VerificationKey {
    /// Verify `signature` over `message` with this key material.
    ///
    /// # Errors
    ///
    /// [`Error::NoCandidateKeys`] for [`VerificationKey::None`] or an empty
    /// candidate list; otherwise whatever the key primitive or
    /// [`verify_any`] report.
    pub fn verify(
        &self,
        message: &[u8],
        signature: &[u8],
        algorithm: SignatureAlgorithm,
    ) -> Result<()> {
        match self {
            Self::None => Err(Error::NoCandidateKeys),
            Self::Single(key) => key.verify(algorithm, message, signature),
            Self::Candidates(keys) => verify_any(message, signature, keys, algorithm),
        }
    }
}

impl From<Vec<Arc<PublicKey>>> for VerificationKey {
    /// A one-element list collapses to [`VerificationKey::Single`].
    fn from(mut keys: Vec<Arc<PublicKey>>) -> Self {
        match keys.len() {
            0 => Self::None,
            1 => match keys.pop() {
                Some(key) => Self::Single(key),
                None => Self::None,
            },
            _ => Self::Candidates(keys),
        }
    }
}

/// A compact JWS split into the two pieces verification needs.
#[derive(Debug, Clone, Copy)]
pub struct TokenParts<'a> {
    /// `header.payload`, the exact bytes the signature covers.
    pub signing_input: &'a str,
    /// The base64url-encoded signature segment.
    pub signature: &'a str,
}

/// Split a compact JWS into signing input and signature.
///
/// # Errors
///
/// [`Error::TokenTooLarge`] past [`MAX_TOKEN_SIZE_BYTES`], and
/// [`Error::MalformedToken`] unless the token has exactly three dot-separated
/// segments.
pub fn split_compact(token: &str) -> Result<TokenParts<'_>> {
    if token.len() > MAX_TOKEN_SIZE_BYTES {
        return Err(Error::TokenTooLarge);
    }

    let (signing_input, signature) = token.rsplit_once('.').ok_or(Error::MalformedToken)?;

    // The remainder must be exactly `header.payload`.
    match signing_input.split_once('.') {
        Some((_, rest)) if !rest.contains('.') => Ok(TokenParts {
            signing_input,
            signature,
        }),
        _ => Err(Error::MalformedToken),
    }
}

/// The protected-header fields verification cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProtectedHeader {
    /// Declared algorithm name, verbatim.
    #[serde(default)]
    pub alg: Option<String>,
    /// Declared key id. An empty string in the token is normalized to
    /// `None`, since both mean "try every key". A `kid` of any non-string
    /// JSON type fails decoding with [`Error::MalformedToken`] instead of
    /// degrading to the brute-force path: a header that mistypes its own
    /// fields is not trusted to pick keys.
    #[serde(default)]
    pub kid: Option<String>,
}

/// Decode the protected header of a compact JWS.
///
/// # Errors
///
/// [`Error::TokenTooLarge`] or [`Error::MalformedToken`].
pub fn decode_protected_header(token: &str) -> Result<ProtectedHeader> {
    if token.len() > MAX_TOKEN_SIZE_BYTES {
        return Err(Error::TokenTooLarge);
    }

    let header_segment = token.split('.').next().ok_or(Error::MalformedToken)?;
    let raw = URL_SAFE_NO_PAD
        .decode(header_segment)
        .map_err(|_| Error::MalformedToken)?;
    let mut header: ProtectedHeader =
        serde_json::from_slice(&raw).map_err(|_| Error::MalformedToken)?;

    if header.kid.as_deref() == Some("") {
        header.kid = None;
    }

    Ok(header)
}
