//! Error types for Google Cloud-backed JWT signing and verification.

use crate::algorithm::SignatureAlgorithm;
use thiserror::Error;

/// Errors produced while signing or verifying through the Google Cloud
/// backends, or while managing cached certificate material.
///
/// Verification failures are deliberately coarse: [`Error::SignatureMismatch`]
/// never reports which candidate key was closest to matching, so a caller
/// (or an attacker observing a caller) cannot distinguish "right account,
/// wrong key" from "wrong account".
#[derive(Error, Debug)]
pub enum Error {
    /// The certificate or public-key endpoint could not be reached, returned
    /// a non-success status, or returned a body that could not be parsed.
    /// A single malformed certificate fails the entire fetch.
    #[error("certificate fetch failed: {0}")]
    CertificateFetch(String),

    /// A declared key id was absent from the fetched or cached key set.
    ///
    /// This is a hard failure: a token that names a specific key id which the
    /// account does not publish is almost certainly invalid or hostile, and
    /// never triggers a re-fetch.
    #[error("no key `{kid}` published for `{account}`")]
    KeyNotFound {
        /// Account or key path the lookup ran against.
        account: String,
        /// The key id the token declared.
        kid: String,
    },

    /// Key resolution produced an empty candidate set. Distinct from
    /// [`Error::SignatureMismatch`] so callers can tell "found no keys to
    /// check" apart from "checked keys, none matched".
    #[error("no candidate keys available for verification")]
    NoCandidateKeys,

    /// No candidate key verified the signature.
    #[error("signature verification failed")]
    SignatureMismatch,

    /// Key material could not be parsed (bad PEM, unsupported key type).
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// The supplied key cannot be used with the requested algorithm, e.g.
    /// an EC key handed to an RSA verification.
    #[error("key cannot be used with algorithm {algorithm}")]
    InvalidKeyType {
        /// The algorithm the caller asked for.
        algorithm: SignatureAlgorithm,
    },

    /// Required per-call configuration was absent or empty.
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),

    /// The remote signing backend (IAM credentials or KMS) rejected the
    /// request or returned an unusable response.
    #[error("signing request failed: {0}")]
    Signing(String),

    /// A compact JWS string did not have the expected structure.
    #[error("token is malformed")]
    MalformedToken,

    /// A token exceeded [`crate::verify::MAX_TOKEN_SIZE_BYTES`] and was
    /// rejected before any parsing.
    #[error("token exceeds the maximum allowed size")]
    TokenTooLarge,
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
