//! JWT signing and verification backed by Google Cloud key services.
//!
//! Private keys never enter the process. Signing is delegated to the IAM
//! credentials API ([`iam`]) or to a Cloud KMS asymmetric key version
//! ([`kms`]); verification runs locally against public keys fetched from the
//! matching endpoints and cached in-process ([`keystore`], [`kms::KmsKeyCache`]).
//!
//! The typical setup creates one shared [`KeyStore`] (and one
//! [`kms::KmsKeyCache`] if KMS is in play) at startup and hands it to every
//! verifier, so all verification traffic shares one certificate cache.

pub mod algorithm;
pub mod certs;
pub mod config;
pub mod error;
pub mod iam;
pub mod keys;
pub mod keystore;
pub mod kms;
pub mod resolver;
pub mod verify;

pub use algorithm::SignatureAlgorithm;
pub use config::{IamConfig, KmsConfig};
pub use error::{Error, Result};
pub use keys::PublicKey;
pub use keystore::{CertificateSet, KeyStore};
pub use resolver::KeyResolver;
pub use verify::{verify_any, VerificationKey};
