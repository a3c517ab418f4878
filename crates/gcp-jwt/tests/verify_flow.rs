//! End-to-end signing and verification flows against mocked Google Cloud
//! endpoints: certificate fetch and caching, key-id resolution, brute-force
//! verification, and the KMS public-key cache.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use gcp_jwt::iam::{HttpIamClient, IamSigner, IamVerifier};
use gcp_jwt::kms::{HttpKmsClient, KmsApi, KmsKeyCache, KmsSigner, KmsVerifier};
use gcp_jwt::{Error, IamConfig, KeyStore, KmsConfig, SignatureAlgorithm};
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use signature::hazmat::PrehashSigner;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ACCOUNT: &str = "signer@project.iam.gserviceaccount.com";
const KEY_PATH: &str = "projects/p/locations/global/keyRings/r/cryptoKeys/k/cryptoKeyVersions/1";

fn rsa_key() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap()
}

fn spki_pem(key: &RsaPrivateKey) -> String {
    key.to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap()
}

fn sign_rs256(key: &RsaPrivateKey, message: &[u8]) -> Vec<u8> {
    rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone())
        .sign(message)
        .to_vec()
}

fn signing_input(header: &serde_json::Value, claims: &serde_json::Value) -> String {
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

async fn mount_certs(server: &MockServer, keys: &[(&str, String)], expect: u64) {
    let body: serde_json::Map<String, serde_json::Value> = keys
        .iter()
        .map(|(kid, pem)| ((*kid).to_string(), serde_json::Value::String(pem.clone())))
        .collect();

    Mock::given(method("GET"))
        .and(path(format!("/{ACCOUNT}")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "public, max-age=3600")
                .set_body_json(serde_json::Value::Object(body)),
        )
        .expect(expect)
        .mount(server)
        .await;
}

fn certs_url(server: &MockServer) -> String {
    format!("{}/", server.uri())
}

#[tokio::test]
async fn iam_sign_blob_then_verify_with_warm_cache() {
    let key = rsa_key();
    let input = signing_input(
        &serde_json::json!({ "alg": "RS256", "typ": "JWT" }),
        &serde_json::json!({ "sub": "user@example.com" }),
    );
    let signature = sign_rs256(&key, input.as_bytes());

    let iam_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/-/serviceAccounts/{ACCOUNT}:signBlob")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "keyId": "live-key",
            "signedBlob": STANDARD.encode(&signature)
        })))
        .expect(1)
        .mount(&iam_server)
        .await;

    let certs_server = MockServer::start().await;
    // expect(1): the second verification must come from the key store.
    mount_certs(&certs_server, &[("live-key", spki_pem(&key))], 1).await;

    let config = Arc::new(IamConfig::new(ACCOUNT));
    let api = Arc::new(HttpIamClient::new(reqwest::Client::new()).with_base_url(iam_server.uri()));
    let signer = IamSigner::sign_blob(api, Arc::clone(&config));

    let token = signer.sign(&input).await.unwrap();
    assert_eq!(config.last_key_id().as_deref(), Some("live-key"));

    let store = Arc::new(KeyStore::new());
    let verifier =
        IamVerifier::new(config, store).with_certs_url(certs_url(&certs_server));

    verifier.verify_token(&token).await.unwrap();
    verifier.verify_token(&token).await.unwrap();
}

#[tokio::test]
async fn token_without_kid_brute_forces_the_candidate_set() {
    let decoy_a = rsa_key();
    let signer_key = rsa_key();
    let decoy_b = rsa_key();

    let input = signing_input(
        &serde_json::json!({ "alg": "RS256", "typ": "JWT" }),
        &serde_json::json!({ "sub": "user@example.com" }),
    );
    let token = format!(
        "{input}.{}",
        URL_SAFE_NO_PAD.encode(sign_rs256(&signer_key, input.as_bytes()))
    );

    let server = MockServer::start().await;
    mount_certs(
        &server,
        &[
            ("key-a", spki_pem(&decoy_a)),
            ("key-b", spki_pem(&signer_key)),
            ("key-c", spki_pem(&decoy_b)),
        ],
        1,
    )
    .await;

    let verifier = IamVerifier::new(
        Arc::new(IamConfig::new(ACCOUNT)),
        Arc::new(KeyStore::new()),
    )
    .with_certs_url(certs_url(&server));

    verifier.verify_token(&token).await.unwrap();
}

#[tokio::test]
async fn declared_kid_pins_verification_to_one_key() {
    let right = rsa_key();
    let wrong = rsa_key();

    let input = signing_input(
        &serde_json::json!({ "alg": "RS256", "kid": "key-right" }),
        &serde_json::json!({ "sub": "user@example.com" }),
    );
    // Signed by the wrong key: with the kid pinned to the right key, the
    // brute-force fallback must not rescue it.
    let token = format!(
        "{input}.{}",
        URL_SAFE_NO_PAD.encode(sign_rs256(&wrong, input.as_bytes()))
    );

    let server = MockServer::start().await;
    mount_certs(
        &server,
        &[("key-right", spki_pem(&right)), ("key-wrong", spki_pem(&wrong))],
        1,
    )
    .await;

    let verifier = IamVerifier::new(
        Arc::new(IamConfig::new(ACCOUNT)),
        Arc::new(KeyStore::new()),
    )
    .with_certs_url(certs_url(&server));

    assert!(matches!(
        verifier.verify_token(&token).await,
        Err(Error::SignatureMismatch)
    ));
}

#[tokio::test]
async fn unknown_kid_fails_hard_without_refetching() {
    let key = rsa_key();

    let server = MockServer::start().await;
    // One fetch warms the cache; the unknown-kid lookup must not trigger a
    // second one.
    mount_certs(&server, &[("key-1", spki_pem(&key))], 1).await;

    let verifier = IamVerifier::new(
        Arc::new(IamConfig::new(ACCOUNT)),
        Arc::new(KeyStore::new()),
    )
    .with_certs_url(certs_url(&server));

    let warm = signing_input(
        &serde_json::json!({ "alg": "RS256" }),
        &serde_json::json!({ "sub": "user@example.com" }),
    );
    let warm_token = format!(
        "{warm}.{}",
        URL_SAFE_NO_PAD.encode(sign_rs256(&key, warm.as_bytes()))
    );
    verifier.verify_token(&warm_token).await.unwrap();

    let input = signing_input(
        &serde_json::json!({ "alg": "RS256", "kid": "rotated-away" }),
        &serde_json::json!({ "sub": "user@example.com" }),
    );
    let token = format!(
        "{input}.{}",
        URL_SAFE_NO_PAD.encode(sign_rs256(&key, input.as_bytes()))
    );

    assert!(matches!(
        verifier.verify_token(&token).await,
        Err(Error::KeyNotFound { ref kid, .. }) if kid == "rotated-away"
    ));
}

#[tokio::test]
async fn kms_es256_sign_and_verify_fetches_the_key_once() {
    let signing_key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
    let public_pem = signing_key
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();

    let config = Arc::new(KmsConfig::new(KEY_PATH));
    let input = signing_input(
        &serde_json::json!({ "alg": "ES256", "typ": "JWT", "kid": config.key_id() }),
        &serde_json::json!({ "sub": "user@example.com" }),
    );
    let digest = SignatureAlgorithm::Es256.digest(input.as_bytes());
    let der: p256::ecdsa::Signature = signing_key.sign_prehash(&digest).unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/{KEY_PATH}:asymmetricSign")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "signature": STANDARD.encode(der.to_der().as_bytes())
        })))
        .expect(1)
        .mount(&server)
        .await;
    // expect(1): the second verification must come from the key cache.
    Mock::given(method("GET"))
        .and(path(format!("/v1/{KEY_PATH}/publicKey")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "pem": public_pem })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let api = Arc::new(HttpKmsClient::new(reqwest::Client::new()).with_base_url(server.uri()));

    let signer = KmsSigner::new(
        Arc::clone(&api) as Arc<dyn KmsApi>,
        Arc::clone(&config),
        SignatureAlgorithm::Es256,
    );
    let token = signer.sign(&input).await.unwrap();

    let verifier = KmsVerifier::new(
        api as Arc<dyn KmsApi>,
        config,
        Arc::new(KmsKeyCache::new()),
        SignatureAlgorithm::Es256,
    );

    verifier.verify_token(&token).await.unwrap();
    verifier.verify_token(&token).await.unwrap();
}

#[tokio::test]
async fn kms_token_naming_a_foreign_key_never_reaches_the_network() {
    let config = Arc::new(KmsConfig::new(KEY_PATH));

    let server = MockServer::start().await;
    // No mocks mounted: any request would fail the test through the
    // resulting connection error being a fetch error rather than
    // KeyNotFound.
    let api = Arc::new(HttpKmsClient::new(reqwest::Client::new()).with_base_url(server.uri()));

    let verifier = KmsVerifier::new(
        api as Arc<dyn KmsApi>,
        config,
        Arc::new(KmsKeyCache::new()),
        SignatureAlgorithm::Es256,
    );

    let input = signing_input(
        &serde_json::json!({ "alg": "ES256", "kid": "not-our-key" }),
        &serde_json::json!({ "sub": "user@example.com" }),
    );
    let token = format!("{input}.{}", URL_SAFE_NO_PAD.encode([0_u8; 64]));

    assert!(matches!(
        verifier.verify_token(&token).await,
        Err(Error::KeyNotFound { ref kid, .. }) if kid == "not-our-key"
    ));
}
