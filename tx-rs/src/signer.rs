//! Client for the remote threshold-signature service.
//!
//! The service holds the distributed key material; the keeper only ever
//! sees derived public keys and 64-byte signatures over 32-byte digests.
//! Derivation paths are ordered byte strings: the empty path is the main
//! trigger authority, `["fee_collection"]` the fee-collection key. Both
//! operations are deterministic, so the keeper caches derived keys after
//! startup.

use crate::pubkey::Pubkey;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Ordered, domain-separating byte strings.
pub type DerivationPath = Vec<Vec<u8>>;

pub fn main_key_path() -> DerivationPath {
    Vec::new()
}

pub fn fee_collection_path() -> DerivationPath {
    vec![b"fee_collection".to_vec()]
}

#[derive(Debug, Error)]
pub enum SignerError {
    /// Transport failures and remote rejections both land here; the caller
    /// cannot retry a half-made signature either way.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("could not decode signer response: {0}")]
    Decoding(String),
}

/// The signing capability injected into the trigger pipeline.
#[async_trait]
pub trait ThresholdSigner: Send + Sync {
    /// Stable public key for a derivation path; same path, same key.
    async fn derive_public_key(&self, path: &DerivationPath) -> Result<Pubkey, SignerError>;

    /// Sign a 32-byte digest under the key at `path`.
    async fn sign_digest(
        &self,
        path: &DerivationPath,
        digest: &[u8; 32],
    ) -> Result<[u8; 64], SignerError>;
}

/// JSON-RPC client for the signing service web endpoint.
#[derive(Debug, Clone)]
pub struct HttpThresholdSigner {
    url: String,
    http: reqwest::Client,
}

impl HttpThresholdSigner {
    pub fn new(url: String, timeout: Duration) -> Result<Self, SignerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignerError::SigningFailed(e.to_string()))?;
        Ok(Self { url, http })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, SignerError> {
        let req = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| SignerError::SigningFailed(format!("POST {}: {e}", self.url)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| SignerError::Decoding(e.to_string()))?;

        if !status.is_success() {
            return Err(SignerError::SigningFailed(format!("HTTP {status}: {body}")));
        }
        if let Some(err) = body.get("error") {
            return Err(SignerError::SigningFailed(format!("RPC error: {err}")));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| SignerError::Decoding("missing result field".to_string()))
    }
}

fn path_to_json(path: &DerivationPath) -> Value {
    Value::Array(
        path.iter()
            .map(|segment| Value::String(hex::encode(segment)))
            .collect(),
    )
}

#[async_trait]
impl ThresholdSigner for HttpThresholdSigner {
    async fn derive_public_key(&self, path: &DerivationPath) -> Result<Pubkey, SignerError> {
        let res = self
            .rpc("signer_derivePublicKey", json!([path_to_json(path)]))
            .await?;
        let key = res
            .get("publicKey")
            .and_then(Value::as_str)
            .ok_or_else(|| SignerError::Decoding("missing publicKey field".to_string()))?;
        Pubkey::parse(key).map_err(|e| SignerError::Decoding(format!("publicKey: {e}")))
    }

    async fn sign_digest(
        &self,
        path: &DerivationPath,
        digest: &[u8; 32],
    ) -> Result<[u8; 64], SignerError> {
        let res = self
            .rpc(
                "signer_signDigest",
                json!([path_to_json(path), hex::encode(digest)]),
            )
            .await?;
        let sig_hex = res
            .get("signature")
            .and_then(Value::as_str)
            .ok_or_else(|| SignerError::Decoding("missing signature field".to_string()))?;
        let bytes =
            hex::decode(sig_hex).map_err(|e| SignerError::Decoding(format!("signature: {e}")))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignerError::Decoding(format!("signature is {} bytes", bytes.len())))
    }
}
