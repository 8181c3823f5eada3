//! Error taxonomy for the keeper's public operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Permission;
use crate::types::SubscriptionStatus;

/// Which create-request address failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressKind {
    Contract,
    PaymentTokenMint,
    Subscriber,
    Merchant,
}

/// Malformed or out-of-range input. Variants mirror the create contract's
/// reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "camelCase")]
pub enum ValidationError {
    #[error("subscription quota reached")]
    QuotaExceeded,

    #[error("id is {len} chars; minimum is 4")]
    IdTooShort { len: usize },

    #[error("id is {len} chars; maximum is 64")]
    IdTooLong { len: usize },

    #[error("id may only contain [A-Za-z0-9_-]")]
    IdSyntax,

    #[error("interval {seconds}s is below the 3600s minimum")]
    IntervalTooSmall { seconds: u64 },

    #[error("interval {seconds}s is above the 31536000s maximum")]
    IntervalTooLarge { seconds: u64 },

    #[error("amount must be greater than zero")]
    AmountZero,

    #[error("amount {amount} exceeds the 1000000000000 base-unit maximum")]
    AmountTooLarge { amount: u64 },

    #[error("{field:?} address is not a 32-44 char base58 string")]
    AddressInvalid { field: AddressKind },

    #[error("operation is not valid for a {from:?} subscription")]
    InvalidTransition { from: SubscriptionStatus },
}

/// Which rate-limit window rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RateScope {
    Global,
    Origin,
    Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("orchestrator keys are not initialized")]
    NotInitialized,

    #[error("network environment is locked once keys are initialized")]
    NetworkLocked,

    #[error("subscription id already exists: {id}")]
    DuplicateId { id: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("caller is not authorized for this operation")]
    Unauthorized,

    #[error("session missing or expired")]
    SessionExpired,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("challenge nonce missing, expired, or already used")]
    NonceInvalid,

    #[error("rate limited ({scope:?})")]
    RateLimited { scope: RateScope },

    #[error("temporarily blocked; retry in {remaining_seconds}s")]
    TemporarilyBlocked { remaining_seconds: u64 },

    #[error("session lacks the {required:?} permission")]
    InsufficientPermissions { required: Permission },

    #[error("node unavailable: {message}")]
    RemoteUnavailable { message: String },

    #[error("node rejected the request (code {code}): {message}")]
    RemoteRejected { code: i64, message: String },

    #[error("signing failed: {message}")]
    SigningFailed { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ServiceError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ServiceError::NotFound { what: what.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::Internal {
            message: message.into(),
        }
    }
}

impl From<metronome_tx::rpc::RpcError> for ServiceError {
    fn from(err: metronome_tx::rpc::RpcError) -> Self {
        use metronome_tx::rpc::RpcError;
        match err {
            RpcError::NetworkUnavailable(message) => ServiceError::RemoteUnavailable { message },
            RpcError::RemoteRejected { code, message } => {
                ServiceError::RemoteRejected { code, message }
            }
            RpcError::Decoding(message) => ServiceError::RemoteUnavailable { message },
        }
    }
}

impl From<metronome_tx::signer::SignerError> for ServiceError {
    fn from(err: metronome_tx::signer::SignerError) -> Self {
        ServiceError::SigningFailed {
            message: err.to_string(),
        }
    }
}
