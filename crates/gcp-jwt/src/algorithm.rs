//! Signature algorithms supported by the Google Cloud signing backends.
//!
//! The IAM credentials APIs always sign RS256. Cloud KMS asymmetric keys
//! cover the four algorithms below, depending on the configured key version:
//! `RSA_SIGN_PKCS1_*_SHA256` (RS256), `RSA_SIGN_PSS_*_SHA256` (PS256),
//! `EC_SIGN_P256_SHA256` (ES256) and `EC_SIGN_P384_SHA384` (ES384).

use sha2::{Digest, Sha256, Sha384};
use std::fmt;

/// JOSE signature algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    Rs256,
    /// RSASSA-PSS with SHA-256.
    Ps256,
    /// ECDSA over P-256 with SHA-256.
    Es256,
    /// ECDSA over P-384 with SHA-384.
    Es384,
}

impl SignatureAlgorithm {
    /// The `alg` value used in a JWS protected header.
    #[must_use]
    pub fn jose_name(self) -> &'static str {
        match self {
            Self::Rs256 => "RS256",
            Self::Ps256 => "PS256",
            Self::Es256 => "ES256",
            Self::Es384 => "ES384",
        }
    }

    /// Parse a JWS `alg` header value.
    #[must_use]
    pub fn from_jose_name(name: &str) -> Option<Self> {
        match name {
            "RS256" => Some(Self::Rs256),
            "PS256" => Some(Self::Ps256),
            "ES256" => Some(Self::Es256),
            "ES384" => Some(Self::Es384),
            _ => None,
        }
    }

    /// Digest the signing input with this algorithm's hash.
    ///
    /// KMS signs a caller-computed digest rather than the raw message, so
    /// the digest must match the key version's algorithm exactly.
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Rs256 | Self::Ps256 | Self::Es256 => Sha256::digest(data).to_vec(),
            Self::Es384 => Sha384::digest(data).to_vec(),
        }
    }

    /// The field name the KMS `asymmetricSign` request body uses for this
    /// algorithm's digest.
    pub(crate) fn kms_digest_field(self) -> &'static str {
        match self {
            Self::Rs256 | Self::Ps256 | Self::Es256 => "sha256",
            Self::Es384 => "sha384",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.jose_name())
    }
}
