//! The trigger pipeline: build, sign, submit.
//!
//! One job per timer firing. The job carries a snapshot of the fields it
//! needs; it never holds the subscription record across a suspension point.
//! The service applies the outcome afterwards against a fresh read of the
//! store, so a pause or cancel that lands mid-flight wins.

use std::sync::Arc;

use metronome_tx::instruction::{build_trigger, TriggerAccounts, TriggerOpcode};
use metronome_tx::message::{signed_transaction, Message};
use metronome_tx::pubkey::Pubkey;
use metronome_tx::rpc::{Commitment, NodeRpc, SendOptions};
use metronome_tx::signer::{main_key_path, ThresholdSigner};

use crate::error::ServiceError;
use crate::types::{Subscription, MAX_BACKOFF_MULTIPLIER};

/// Which behavior a timer firing runs. A subscription's single timer is
/// armed at either the reminder lead instant or the payment due instant;
/// the service classifies the firing and tags the job with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Payment,
    Reminder,
}

/// Capabilities and derived keys shared by every trigger.
#[derive(Clone)]
pub struct TriggerEnv {
    pub signer: Arc<dyn ThresholdSigner>,
    pub rpc: Arc<dyn NodeRpc>,
    pub trigger_authority: Pubkey,
    pub fee_collection: Pubkey,
    pub commitment: Commitment,
    pub send_options: SendOptions,
}

/// Snapshot of one firing, taken before the first suspension point.
#[derive(Debug, Clone)]
pub struct TriggerJob {
    pub id: String,
    pub kind: TriggerKind,
    pub contract_address: String,
    pub subscriber_address: String,
    pub merchant_address: String,
    pub payment_token_mint: String,
    /// Seconds, as the payment program's timestamp field expects.
    pub unix_timestamp: i64,
}

impl TriggerJob {
    pub fn from_subscription(sub: &Subscription, kind: TriggerKind, now_secs: u64) -> Self {
        Self {
            id: sub.id.clone(),
            kind,
            contract_address: sub.contract_address.clone(),
            subscriber_address: sub.subscriber_address.clone(),
            merchant_address: sub.merchant_address.clone(),
            payment_token_mint: sub.payment_token_mint.clone(),
            unix_timestamp: now_secs as i64,
        }
    }
}

/// Result of one trigger, routed back to the service loop.
#[derive(Debug)]
pub struct TriggerOutcome {
    pub id: String,
    pub kind: TriggerKind,
    pub result: Result<String, ServiceError>,
}

/// Interval multiplier after `failed_count` consecutive failures:
/// `min(2^failed_count, 16)`.
pub fn backoff_multiplier(failed_count: u32) -> u64 {
    2u64.saturating_pow(failed_count).min(MAX_BACKOFF_MULTIPLIER)
}

fn parse_address(field: &str, value: &str) -> Result<Pubkey, ServiceError> {
    Pubkey::parse(value)
        .map_err(|e| ServiceError::internal(format!("stored {field} is not a pubkey: {e}")))
}

/// Run the full pipeline for one job and return the node's signature.
pub async fn execute(env: &TriggerEnv, job: &TriggerJob) -> Result<String, ServiceError> {
    let accounts = TriggerAccounts {
        program_id: parse_address("contract_address", &job.contract_address)?,
        subscriber: parse_address("subscriber_address", &job.subscriber_address)?,
        merchant: parse_address("merchant_address", &job.merchant_address)?,
        payment_token_mint: parse_address("payment_token_mint", &job.payment_token_mint)?,
        trigger_authority: env.trigger_authority,
        fee_collection: env.fee_collection,
    };

    let opcode = match job.kind {
        TriggerKind::Payment => TriggerOpcode::Payment,
        TriggerKind::Reminder => TriggerOpcode::Reminder,
    };

    let blockhash = env.rpc.latest_blockhash(env.commitment).await?;
    let instruction = build_trigger(&accounts, &job.id, opcode, job.unix_timestamp);
    let message = Message::compile(&env.trigger_authority, &[instruction], blockhash);
    let digest = message.signing_digest();
    let signature = env.signer.sign_digest(&main_key_path(), &digest).await?;
    let transaction = signed_transaction(&signature, &message.serialize());

    let node_signature = env.rpc.send_transaction(&transaction, &env.send_options).await?;
    tracing::debug!(
        subscription_id = %job.id,
        kind = ?job.kind,
        tx = %node_signature,
        "trigger submitted"
    );
    Ok(node_signature)
}
