//! Signing and verification through the IAM credentials API.
//!
//! IAM signs with Google-managed service-account keys, always RS256, and
//! picks the private key itself; the chosen key id is only known from the
//! response. Two signing RPCs are exposed: `signBlob`, which signs arbitrary
//! bytes and lets this crate assemble the token, and `signJwt`, which takes
//! the claims and returns a complete token with a header of IAM's choosing.
//!
//! Verification pulls the account's published certificates through the
//! [`KeyResolver`] and brute-forces the candidate set when the token does not
//! name a key id.

use crate::algorithm::SignatureAlgorithm;
use crate::config::IamConfig;
use crate::error::{Error, Result};
use crate::keystore::KeyStore;
use crate::resolver::KeyResolver;
use crate::verify::{decode_protected_header, split_compact, VerificationKey};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Production base URL for the IAM credentials API.
pub const IAM_CREDENTIALS_URL: &str = "https://iamcredentials.googleapis.com";

/// A signature produced by `signBlob`.
#[derive(Debug, Clone)]
pub struct IamSignature {
    /// Id of the key IAM chose to sign with.
    pub key_id: String,
    /// Raw signature bytes.
    pub signature: Vec<u8>,
}

/// A complete token produced by `signJwt`.
#[derive(Debug, Clone)]
pub struct SignedJwt {
    /// Id of the key IAM chose to sign with.
    pub key_id: String,
    /// The full compact JWS, header chosen by IAM.
    pub token: String,
}

/// The two IAM credentials signing RPCs.
///
/// A trait seam so signers can be driven by the real HTTP client in
/// production and an in-process fake in tests.
#[async_trait]
pub trait IamApi: Send + Sync {
    /// Sign arbitrary bytes with the account's active key.
    async fn sign_blob(&self, service_account: &str, payload: &[u8]) -> Result<IamSignature>;

    /// Have IAM mint a complete JWT from a claims JSON document.
    async fn sign_jwt(&self, service_account: &str, claims: &str) -> Result<SignedJwt>;
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Serialize)]
struct SignBlobRequest<'a> {
    payload: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignBlobResponse {
    key_id: String,
    signed_blob: String,
}

#[derive(Serialize)]
struct SignJwtRequest<'a> {
    payload: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignJwtResponse {
    key_id: String,
    signed_jwt: String,
}

/// [`IamApi`] implementation over the REST endpoints.
///
/// The supplied client must already attach OAuth credentials (for example
/// via a middleware or a proxy); this type adds nothing to the request but
/// the body.
#[derive(Debug, Clone)]
pub struct HttpIamClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIamClient {
    /// Create a client against the production endpoint.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: IAM_CREDENTIALS_URL.to_string(),
        }
    }

    /// Override the base URL. Used by tests.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn post_json<Req: Serialize + Sync, Resp: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &Req,
    ) -> Result<Resp> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                warn!(target: "gcp_jwt.iam", error = %e, "signing request failed");
                Error::Signing(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                target: "gcp_jwt.iam",
                status = %status,
                "signing backend returned an error status"
            );
            return Err(Error::Signing(format!(
                "signing backend returned {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Signing(format!("unparseable signing response: {e}")))
    }
}

#[async_trait]
impl IamApi for HttpIamClient {
    #[instrument(skip_all, fields(account = %service_account))]
    async fn sign_blob(&self, service_account: &str, payload: &[u8]) -> Result<IamSignature> {
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{service_account}:signBlob",
            self.base_url
        );
        let request = SignBlobRequest {
            payload: &STANDARD.encode(payload),
        };

        let response: SignBlobResponse = self.post_json(&url, &request).await?;
        let signature = STANDARD
            .decode(&response.signed_blob)
            .map_err(|e| Error::Signing(format!("unparseable signature encoding: {e}")))?;

        debug!(target: "gcp_jwt.iam", key_id = %response.key_id, "signed blob");
        Ok(IamSignature {
            key_id: response.key_id,
            signature,
        })
    }

    #[instrument(skip_all, fields(account = %service_account))]
    async fn sign_jwt(&self, service_account: &str, claims: &str) -> Result<SignedJwt> {
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{service_account}:signJwt",
            self.base_url
        );
        let request = SignJwtRequest { payload: claims };

        let response: SignJwtResponse = self.post_json(&url, &request).await?;

        debug!(target: "gcp_jwt.iam", key_id = %response.key_id, "signed jwt");
        Ok(SignedJwt {
            key_id: response.key_id,
            token: response.signed_jwt,
        })
    }
}

// ============================================================================
// Signer
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum SigningMethod {
    Blob,
    Jwt,
}

/// Token signer backed by the IAM credentials API.
///
/// Call [`IamSigner::sign`] with `header.payload` signing input. The blob
/// method appends a signature over those exact bytes; the JWT method discards
/// the caller's header, forwards the claims, and returns the token IAM built.
/// Either way the result is a complete compact JWS.
pub struct IamSigner {
    api: Arc<dyn IamApi>,
    config: Arc<IamConfig>,
    method: SigningMethod,
}

impl IamSigner {
    /// Signer using the `signBlob` RPC.
    #[must_use]
    pub fn sign_blob(api: Arc<dyn IamApi>, config: Arc<IamConfig>) -> Self {
        Self {
            api,
            config,
            method: SigningMethod::Blob,
        }
    }

    /// Signer using the `signJwt` RPC.
    #[must_use]
    pub fn sign_jwt(api: Arc<dyn IamApi>, config: Arc<IamConfig>) -> Self {
        Self {
            api,
            config,
            method: SigningMethod::Jwt,
        }
    }

    /// The algorithm IAM signs with.
    #[must_use]
    pub fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Rs256
    }

    /// Sign `signing_input` (`header.payload`) and return the complete token.
    ///
    /// Records the key id IAM chose on the shared [`IamConfig`].
    ///
    /// # Errors
    ///
    /// [`Error::MissingConfig`] when no service account is configured,
    /// [`Error::MalformedToken`] when the input is not `header.payload`, and
    /// [`Error::Signing`] when the backend rejects the request.
    pub async fn sign(&self, signing_input: &str) -> Result<String> {
        let account = self.config.service_account();
        if account.is_empty() {
            return Err(Error::MissingConfig("service_account"));
        }

        match self.method {
            SigningMethod::Blob => {
                let signed = self.api.sign_blob(account, signing_input.as_bytes()).await?;
                self.config.set_last_key_id(signed.key_id);
                Ok(format!(
                    "{signing_input}.{}",
                    URL_SAFE_NO_PAD.encode(&signed.signature)
                ))
            }
            SigningMethod::Jwt => {
                // IAM builds its own header, so only the claims survive.
                let (_, claims_segment) =
                    signing_input.split_once('.').ok_or(Error::MalformedToken)?;
                if claims_segment.contains('.') {
                    return Err(Error::MalformedToken);
                }
                let claims = URL_SAFE_NO_PAD
                    .decode(claims_segment)
                    .map_err(|_| Error::MalformedToken)?;
                let claims =
                    String::from_utf8(claims).map_err(|_| Error::MalformedToken)?;

                let signed = self.api.sign_jwt(account, &claims).await?;
                self.config.set_last_key_id(signed.key_id);
                Ok(signed.token)
            }
        }
    }
}

impl std::fmt::Debug for IamSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IamSigner")
            .field("account", &self.config.service_account())
            .field("method", &self.method)
            .finish()
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Token verifier for IAM-signed tokens, backed by the account's published
/// certificates.
#[derive(Debug)]
pub struct IamVerifier {
    config: Arc<IamConfig>,
    resolver: KeyResolver,
    client: reqwest::Client,
}

impl IamVerifier {
    /// Create a verifier sharing `store` with other verifiers in the process.
    #[must_use]
    pub fn new(config: Arc<IamConfig>, store: Arc<KeyStore>) -> Self {
        let client = config.client().cloned().unwrap_or_default();
        Self {
            config,
            resolver: KeyResolver::new(store),
            client,
        }
    }

    /// Override the certificate endpoint base URL. Used by tests.
    #[must_use]
    pub fn with_certs_url(mut self, url: impl Into<String>) -> Self {
        self.resolver = self.resolver.with_certs_url(url);
        self
    }

    /// Verify a raw signature over `signing_input`, optionally pinned to a
    /// declared key id.
    ///
    /// A failed verification never triggers a certificate re-fetch: a kid
    /// missing from a live cached set, or a signature no cached key matches,
    /// fails as-is. Rotated-in keys become visible only when the cache entry
    /// expires, so unverifiable tokens cannot drive fetch traffic.
    ///
    /// # Errors
    ///
    /// [`Error::MissingConfig`] without a service account, plus everything
    /// [`KeyResolver::resolve`] and [`VerificationKey::verify`] produce.
    pub async fn verify(
        &self,
        signing_input: &str,
        signature: &[u8],
        kid: Option<&str>,
    ) -> Result<()> {
        let account = self.config.service_account();
        if account.is_empty() {
            return Err(Error::MissingConfig("service_account"));
        }

        let candidates = self
            .resolver
            .resolve(
                &self.client,
                account,
                kid,
                self.config.cache_enabled(),
                self.config.cache_expiration(),
            )
            .await?;

        VerificationKey::from(candidates).verify(
            signing_input.as_bytes(),
            signature,
            SignatureAlgorithm::Rs256,
        )
    }

    /// Verify a complete compact JWS.
    ///
    /// The header's declared algorithm, when present, must be RS256; the
    /// declared key id, when present, pins the candidate set.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedToken`] for structural problems, plus everything
    /// [`IamVerifier::verify`] produces.
    #[instrument(skip_all)]
    pub async fn verify_token(&self, token: &str) -> Result<()> {
        let header = decode_protected_header(token)?;
        if let Some(alg) = header.alg.as_deref() {
            if SignatureAlgorithm::from_jose_name(alg) != Some(SignatureAlgorithm::Rs256) {
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
