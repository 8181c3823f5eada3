//! Typed facade over the node's JSON-RPC endpoint.
//!
//! Only the five calls the keeper needs; transport, HTTP, and JSON-RPC
//! error responses all collapse into [`RpcError`] so the trigger pipeline
//! can route every failure through the same backoff path.

use crate::pubkey::Pubkey;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("node unreachable: {0}")]
    NetworkUnavailable(String),

    #[error("node rejected request (code {code}): {message}")]
    RemoteRejected { code: i64, message: String },

    #[error("could not decode node response: {0}")]
    Decoding(String),
}

/// Confirmation level a response is considered authoritative at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl Commitment {
    pub fn as_str(self) -> &'static str {
        match self {
            Commitment::Processed => "processed",
            Commitment::Confirmed => "confirmed",
            Commitment::Finalized => "finalized",
        }
    }
}

/// Wire encoding for a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxEncoding {
    Base58,
    #[default]
    Base64,
}

impl TxEncoding {
    fn as_str(self) -> &'static str {
        match self {
            TxEncoding::Base58 => "base58",
            TxEncoding::Base64 => "base64",
        }
    }

    fn encode(self, bytes: &[u8]) -> String {
        match self {
            TxEncoding::Base58 => bs58::encode(bytes).into_string(),
            TxEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub encoding: TxEncoding,
    pub skip_preflight: bool,
    pub preflight_commitment: Commitment,
    pub max_retries: u64,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            encoding: TxEncoding::Base64,
            skip_preflight: false,
            preflight_commitment: Commitment::Confirmed,
            max_retries: 3,
        }
    }
}

/// Token accounts returned by the owner query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAccount {
    pub address: Pubkey,
    /// Raw token amount in base units, when the node returns parsed data.
    pub amount: Option<u64>,
}

/// The node capability injected into the trigger pipeline.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn latest_blockhash(&self, commitment: Commitment) -> Result<[u8; 32], RpcError>;

    /// Lamport balance of a system account.
    async fn balance(&self, address: &Pubkey) -> Result<u64, RpcError>;

    /// Base-unit balance of one token account.
    async fn token_balance(&self, token_account: &Pubkey) -> Result<u64, RpcError>;

    async fn token_accounts_by_owner(
        &self,
        owner: &Pubkey,
        mint: Option<&Pubkey>,
    ) -> Result<Vec<TokenAccount>, RpcError>;

    /// Submit a signed transaction; returns the node's signature string.
    async fn send_transaction(
        &self,
        transaction: &[u8],
        options: &SendOptions,
    ) -> Result<String, RpcError>;
}

/// reqwest-backed [`NodeRpc`] implementation.
#[derive(Debug, Clone)]
pub struct NodeRpcClient {
    url: String,
    http: reqwest::Client,
}

impl NodeRpcClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::NetworkUnavailable(e.to_string()))?;
        Ok(Self { url, http })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, RpcError> {
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
            .map_err(|e| RpcError::NetworkUnavailable(format!("POST {}: {e}", self.url)))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(RpcError::NetworkUnavailable(format!("HTTP {status}")));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| RpcError::Decoding(e.to_string()))?;

        if let Some(err) = body.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            tracing::debug!(method, code, %message, "node rejected request");
            return Err(RpcError::RemoteRejected { code, message });
        }

        if !status.is_success() {
            return Err(RpcError::RemoteRejected {
                code: status.as_u16() as i64,
                message: format!("HTTP {status}"),
            });
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| RpcError::Decoding("missing result field".to_string()))
    }
}

fn parse_pubkey_field(v: &Value, key: &str) -> Result<Pubkey, RpcError> {
    let s = v
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::Decoding(format!("missing or invalid field {key}")))?;
    Pubkey::parse(s).map_err(|e| RpcError::Decoding(format!("{key}: {e}")))
}

#[async_trait]
impl NodeRpc for NodeRpcClient {
    async fn latest_blockhash(&self, commitment: Commitment) -> Result<[u8; 32], RpcError> {
        let res = self
            .rpc(
                "getLatestBlockhash",
                json!([{ "commitment": commitment.as_str() }]),
            )
            .await?;
        let hash_str = res
            .pointer("/value/blockhash")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Decoding("missing value.blockhash".to_string()))?;
        let bytes = bs58::decode(hash_str)
            .into_vec()
            .map_err(|e| RpcError::Decoding(format!("blockhash base58: {e}")))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| RpcError::Decoding(format!("blockhash is {} bytes", bytes.len())))
    }

    async fn balance(&self, address: &Pubkey) -> Result<u64, RpcError> {
        let res = self
            .rpc("getBalance", json!([address.to_base58()]))
            .await?;
        res.pointer("/value")
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::Decoding("missing value".to_string()))
    }

    async fn token_balance(&self, token_account: &Pubkey) -> Result<u64, RpcError> {
        let res = self
            .rpc("getTokenAccountBalance", json!([token_account.to_base58()]))
            .await?;
        let amount = res
            .pointer("/value/amount")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Decoding("missing value.amount".to_string()))?;
        amount
            .parse()
            .map_err(|_| RpcError::Decoding(format!("amount not a u64: {amount}")))
    }

    async fn token_accounts_by_owner(
        &self,
        owner: &Pubkey,
        mint: Option<&Pubkey>,
    ) -> Result<Vec<TokenAccount>, RpcError> {
        let filter = match mint {
            Some(mint) => json!({ "mint": mint.to_base58() }),
            None => json!({ "programId": crate::pubkey::TOKEN_PROGRAM.to_base58() }),
        };
        let res = self
            .rpc(
                "getTokenAccountsByOwner",
                json!([owner.to_base58(), filter, { "encoding": "jsonParsed" }]),
            )
            .await?;

        let entries = res
            .pointer("/value")
            .and_then(Value::as_array)
            .ok_or_else(|| RpcError::Decoding("missing value array".to_string()))?;

        entries
            .iter()
            .map(|entry| {
                let address = parse_pubkey_field(entry, "pubkey")?;
                let amount = entry
                    .pointer("/account/data/parsed/info/tokenAmount/amount")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok());
                Ok(TokenAccount { address, amount })
            })
            .collect()
    }

    async fn send_transaction(
        &self,
        transaction: &[u8],
        options: &SendOptions,
    ) -> Result<String, RpcError> {
        let res = self
            .rpc(
                "sendTransaction",
                json!([
                    options.encoding.encode(transaction),
                    {
                        "encoding": options.encoding.as_str(),
                        "skipPreflight": options.skip_preflight,
                        "preflightCommitment": options.preflight_commitment.as_str(),
                        "maxRetries": options.max_retries,
                    }
                ]),
            )
            .await?;
        res.as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Decoding("expected signature string".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_defaults_to_confirmed() {
        assert_eq!(Commitment::default(), Commitment::Confirmed);
        assert_eq!(Commitment::default().as_str(), "confirmed");
    }

    #[test]
    fn tx_encodings() {
        let bytes = [1u8, 2, 3];
        assert_eq!(TxEncoding::Base58.encode(&bytes), "Ldp");
        assert_eq!(TxEncoding::Base64.encode(&bytes), "AQID");
    }

    #[test]
    fn pubkey_field_errors_are_decoding_errors() {
        let v = json!({ "pubkey": "not-base58-0OIl" });
        assert!(matches!(
            parse_pubkey_field(&v, "pubkey"),
            Err(RpcError::Decoding(_))
        ));
        assert!(matches!(
            parse_pubkey_field(&v, "missing"),
            Err(RpcError::Decoding(_))
        ));
    }
}
