//! Cloud-KMS-backed signing key.
//!
//! Signs through the KMS REST surface (`asymmetricSign` over a SHA-256
//! digest) and verifies locally against the key's published public key, so
//! private key material never leaves the KMS. Keys are expected to be
//! ECDSA P-256 / SHA-256.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use async_trait::async_trait;
use repin_core::error::{Error, Result};

use crate::attest::Keyer;

const KMS_BASE_URL: &str = "https://cloudkms.googleapis.com/v1";

/// KMS asymmetric key, addressed by its full resource name
/// (`projects/.../cryptoKeyVersions/N`).
pub struct KmsKeyer {
    http: reqwest::Client,
    base_url: String,
    key_name: String,
    token: Option<String>,
    public_key: OnceCell<Vec<u8>>,
}

impl KmsKeyer {
    pub fn new(key_name: impl Into<String>) -> Self {
        Self::with_base_url(KMS_BASE_URL, key_name)
    }

    pub fn with_base_url(base_url: impl Into<String>, key_name: impl Into<String>) -> Self {
        let token = std::env::var("GOOGLE_ACCESS_TOKEN").ok();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            key_name: key_name.into(),
            token,
            public_key: OnceCell::new(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn fetch_public_key(&self) -> Result<Vec<u8>> {
        #[derive(Deserialize)]
        struct PublicKeyResponse {
            pem: String,
        }

        let url = format!("{}/{}/publicKey", self.base_url, self.key_name);
        let response: PublicKeyResponse = self
            .request(self.http.get(&url))
            .send()
            .await
            .map_err(|e| Error::Sign(format!("fetch public key: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Sign(format!("fetch public key: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Sign(format!("decode public key: {e}")))?;

        let (item, _rest) = rustls_pemfile::read_one_from_slice(response.pem.as_bytes())
            .map_err(|e| Error::Sign(format!("bad public key PEM: {e:?}")))?
            .ok_or_else(|| Error::Sign("empty public key PEM".to_string()))?;
        let spki = match item {
            rustls_pemfile::Item::SubjectPublicKeyInfo(der) => der.as_ref().to_vec(),
            other => {
                return Err(Error::Sign(format!(
                    "unexpected PEM block in public key: {other:?}"
                )))
            }
        };
        spki_ec_point(&spki).ok_or_else(|| {
            Error::Sign("public key is not an uncompressed P-256 point".to_string())
        })
    }
}

/// The uncompressed EC point at the tail of a P-256 SubjectPublicKeyInfo.
fn spki_ec_point(spki: &[u8]) -> Option<Vec<u8>> {
    if spki.len() < 65 {
        return None;
    }
    let point = &spki[spki.len() - 65..];
    if point[0] != 0x04 {
        return None;
    }
    Some(point.to_vec())
}

#[async_trait]
impl Keyer for KmsKeyer {
    async fn sign(&self, payload: &[u8]) -> Result<(Vec<u8>, String)> {
        #[derive(Deserialize)]
        struct SignResponse {
            signature: String,
        }

        let digest = Sha256::digest(payload);
        let url = format!("{}/{}:asymmetricSign", self.base_url, self.key_name);
        let body = serde_json::json!({
            "digest": { "sha256": BASE64.encode(digest) },
        });

        let response: SignResponse = self
            .request(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Sign(format!("kms sign: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Sign(format!("kms sign: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Sign(format!("kms sign decode: {e}")))?;

        let signature = BASE64
            .decode(&response.signature)
            .map_err(|e| Error::Sign(format!("kms signature is not base64: {e}")))?;
        Ok((signature, self.key_name.clone()))
    }

    async fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()> {
        let point = self
            .public_key
            .get_or_try_init(|| self.fetch_public_key())
            .await?;
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, point)
            .verify(payload, signature)
            .map_err(|_| Error::Sign("signature verification failed".to_string()))
    }
}
