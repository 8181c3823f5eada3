//! Core domain types and validation bounds.

use serde::{Deserialize, Serialize};

use crate::error::{AddressKind, ValidationError};

/// Nanoseconds since the Unix epoch.
pub type TimestampNs = u64;

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

pub const ID_MIN_LEN: usize = 4;
pub const ID_MAX_LEN: usize = 64;
pub const MIN_INTERVAL_SECONDS: u64 = 3_600;
pub const MAX_INTERVAL_SECONDS: u64 = 31_536_000;
pub const MIN_AMOUNT: u64 = 1;
/// 1,000,000 whole units at six fractional digits.
pub const MAX_AMOUNT: u64 = 1_000_000_000_000;
pub const ADDRESS_MIN_LEN: usize = 32;
pub const ADDRESS_MAX_LEN: usize = 44;
pub const MAX_SUBSCRIPTIONS: usize = 10_000;

/// Consecutive payment failures before a subscription is parked.
pub const AUTO_PAUSE_FAILURE_THRESHOLD: u32 = 10;
/// Cap on the failure-backoff interval multiplier.
pub const MAX_BACKOFF_MULTIPLIER: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Cancelled and Expired records never leave their state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled | SubscriptionStatus::Expired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    /// Payment-program id that owns this subscription's PDA.
    pub contract_address: String,
    pub payment_token_mint: String,
    pub subscriber_address: String,
    pub merchant_address: String,
    pub interval_seconds: u64,
    /// Base units of the payment token (six fractional digits).
    pub amount: u64,
    /// Days ahead of `next_execution` to emit a reminder trigger; 0 disables.
    pub reminder_days_before_payment: u32,
    pub next_execution: TimestampNs,
    pub status: SubscriptionStatus,
    pub created_at: TimestampNs,
    #[serde(default)]
    pub last_triggered: Option<TimestampNs>,
    #[serde(default)]
    pub trigger_count: u64,
    #[serde(default)]
    pub failed_payment_count: u32,
    #[serde(default)]
    pub last_failure_time: Option<TimestampNs>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub id: String,
    pub contract_address: String,
    pub payment_token_mint: String,
    pub subscriber_address: String,
    pub merchant_address: String,
    pub interval_seconds: u64,
    pub amount: u64,
    #[serde(default)]
    pub reminder_days_before_payment: u32,
    /// First execution instant; defaults to `now + interval_seconds`.
    #[serde(default)]
    pub start_time: Option<TimestampNs>,
}

impl CreateSubscriptionRequest {
    /// Field-level checks in their reporting order. Quota, duplicate-id, and
    /// initialization checks belong to the store/service, which run before
    /// and after these respectively.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.len() < ID_MIN_LEN {
            return Err(ValidationError::IdTooShort { len: self.id.len() });
        }
        if self.id.len() > ID_MAX_LEN {
            return Err(ValidationError::IdTooLong { len: self.id.len() });
        }
        if !self
            .id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(ValidationError::IdSyntax);
        }
        if self.interval_seconds < MIN_INTERVAL_SECONDS {
            return Err(ValidationError::IntervalTooSmall {
                seconds: self.interval_seconds,
            });
        }
        if self.interval_seconds > MAX_INTERVAL_SECONDS {
            return Err(ValidationError::IntervalTooLarge {
                seconds: self.interval_seconds,
            });
        }
        if self.amount < MIN_AMOUNT {
            return Err(ValidationError::AmountZero);
        }
        if self.amount > MAX_AMOUNT {
            return Err(ValidationError::AmountTooLarge { amount: self.amount });
        }
        for (kind, address) in [
            (AddressKind::Contract, &self.contract_address),
            (AddressKind::PaymentTokenMint, &self.payment_token_mint),
            (AddressKind::Subscriber, &self.subscriber_address),
            (AddressKind::Merchant, &self.merchant_address),
        ] {
            if !address_looks_valid(address) {
                return Err(ValidationError::AddressInvalid { field: kind });
            }
        }
        Ok(())
    }
}

/// Base58-style address: 32..=44 chars from the base58 alphabet.
pub fn address_looks_valid(address: &str) -> bool {
    (ADDRESS_MIN_LEN..=ADDRESS_MAX_LEN).contains(&address.len())
        && address
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() && !matches!(b, b'0' | b'I' | b'O' | b'l'))
}

/// Opaque encrypted blob attached to a subscription. The keeper never looks
/// inside; it only guards storage, retrieval, and admin-gated erasure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMetadata {
    pub data: String,
    pub iv: String,
    pub data_hash: String,
    pub encrypted_by: String,
    pub version: u32,
    pub created_at: TimestampNs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkEnv {
    Mainnet,
    Devnet,
    Testnet,
}

/// Keys derived from the threshold signer at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedKeys {
    pub main_address: String,
    pub fee_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DegradationReason {
    LowCycleBalance,
    CriticalCycleBalance,
    HighPaymentFailureRate,
    HighSubscriptionLoad,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub reasons: Vec<DegradationReason>,
    pub emergency_paused: bool,
    /// Fee-payer balance in lamports, when the node answered.
    pub payer_balance: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub total_subscriptions: usize,
    pub active_subscriptions: usize,
    pub paused_subscriptions: usize,
    pub cancelled_subscriptions: usize,
    pub expired_subscriptions: usize,
    pub armed_timers: usize,
    pub triggers_succeeded: u64,
    pub triggers_failed: u64,
    pub reminders_sent: u64,
    pub total_failed_payment_count: u64,
    pub uptime_seconds: u64,
}
