//! Instruction model and the trigger-instruction builder.

use crate::encoding::FieldWriter;
use crate::hash::discriminator;
use crate::pda;
use crate::pubkey::{
    Pubkey, INSTRUCTIONS_SYSVAR, MEMO_PROGRAM, SYSTEM_PROGRAM, TOKEN_PROGRAM,
};

/// One account reference carried by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountMeta {
    pub pubkey: Pubkey,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl AccountMeta {
    pub fn writable(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: true,
        }
    }

    pub fn readonly(pubkey: Pubkey, is_signer: bool) -> Self {
        Self {
            pubkey,
            is_signer,
            is_writable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub program_id: Pubkey,
    pub accounts: Vec<AccountMeta>,
    pub data: Vec<u8>,
}

/// Which behavior the payment program runs for a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerOpcode {
    /// Move the subscription amount from subscriber to merchant + fee split.
    Payment = 0,
    /// Emit an upcoming-payment notification memo to the subscriber.
    Reminder = 1,
}

/// Everything the trigger instruction references.
///
/// The keeper resolves these from the stored subscription plus the two keys
/// it derived at initialization (trigger authority and fee collection).
#[derive(Debug, Clone)]
pub struct TriggerAccounts {
    pub program_id: Pubkey,
    pub subscriber: Pubkey,
    pub merchant: Pubkey,
    pub payment_token_mint: Pubkey,
    pub trigger_authority: Pubkey,
    pub fee_collection: Pubkey,
}

/// Build the `process_payment` instruction for one subscription trigger.
///
/// Account order is the program's ABI; the subscription PDA appears twice
/// (writable state account, then a readonly alias the program uses for
/// seed re-derivation).
pub fn build_trigger(
    accounts: &TriggerAccounts,
    subscription_id: &str,
    opcode: TriggerOpcode,
    unix_timestamp: i64,
) -> Instruction {
    let (subscription_pda, _) = pda::subscription_address(subscription_id, &accounts.program_id);
    let (config_pda, _) = pda::config_address(&accounts.program_id);
    let subscriber_token =
        pda::associated_token_address(&accounts.subscriber, &accounts.payment_token_mint);
    let merchant_token =
        pda::associated_token_address(&accounts.merchant, &accounts.payment_token_mint);
    let fee_token =
        pda::associated_token_address(&accounts.fee_collection, &accounts.payment_token_mint);

    let mut data = FieldWriter::new();
    data.write_bytes(&discriminator("process_payment"))
        .write_u8(opcode as u8)
        .write_str(subscription_id)
        .write_i64(unix_timestamp);

    Instruction {
        program_id: accounts.program_id,
        accounts: vec![
            AccountMeta::writable(subscription_pda, false),
            AccountMeta::readonly(config_pda, false),
            AccountMeta::writable(accounts.trigger_authority, true),
            AccountMeta::writable(subscriber_token, false),
            AccountMeta::writable(merchant_token, false),
            AccountMeta::writable(fee_token, false),
            AccountMeta::readonly(accounts.payment_token_mint, false),
            AccountMeta::readonly(subscription_pda, false),
            AccountMeta::writable(accounts.subscriber, false),
            AccountMeta::readonly(TOKEN_PROGRAM, false),
            AccountMeta::readonly(SYSTEM_PROGRAM, false),
            AccountMeta::readonly(MEMO_PROGRAM, false),
            AccountMeta::readonly(INSTRUCTIONS_SYSVAR, false),
        ],
        data: data.into_bytes(),
    }
}
