//! Legacy message compilation and the signed-transaction envelope.
//!
//! This layout is the external contract the on-chain verifier enforces, so
//! every byte matters: 3-byte header, compact-u16 framed account keys,
//! 32-byte recent blockhash, then the compiled instructions with their
//! account-index tables. The threshold signer receives `sha256(message)` as
//! its 32-byte digest.

use crate::encoding::{push_compact_u16, read_compact_u16};
use crate::hash::sha256;
use crate::instruction::{AccountMeta, Instruction};
use crate::pubkey::Pubkey;
use thiserror::Error;

pub const SIGNATURE_LEN: usize = 64;

/// A compiled message ready for signing and submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub num_required_signatures: u8,
    pub num_readonly_signed: u8,
    pub num_readonly_unsigned: u8,
    pub account_keys: Vec<Pubkey>,
    pub recent_blockhash: [u8; 32],
    pub instructions: Vec<CompiledInstruction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledInstruction {
    pub program_id_index: u8,
    pub account_indexes: Vec<u8>,
    pub data: Vec<u8>,
}

impl Message {
    /// Compile instructions against a fee payer.
    ///
    /// Unique keys are collected payer-first and ordered
    /// writable-signers, readonly-signers, writable non-signers, readonly
    /// non-signers; program ids come last as readonly non-signers unless an
    /// account reference already promoted them. Duplicate references OR
    /// their privileges together.
    pub fn compile(
        payer: &Pubkey,
        instructions: &[Instruction],
        recent_blockhash: [u8; 32],
    ) -> Self {
        // First-appearance order with merged privileges.
        let mut metas: Vec<AccountMeta> = vec![AccountMeta::writable(*payer, true)];
        let upsert = |meta: AccountMeta, metas: &mut Vec<AccountMeta>| {
            match metas.iter_mut().find(|m| m.pubkey == meta.pubkey) {
                Some(existing) => {
                    existing.is_signer |= meta.is_signer;
                    existing.is_writable |= meta.is_writable;
                }
                None => metas.push(meta),
            }
        };
        for ix in instructions {
            for account in &ix.accounts {
                upsert(*account, &mut metas);
            }
        }
        for ix in instructions {
            upsert(AccountMeta::readonly(ix.program_id, false), &mut metas);
        }

        let class = |m: &AccountMeta| match (m.is_signer, m.is_writable) {
            (true, true) => 0u8,
            (true, false) => 1,
            (false, true) => 2,
            (false, false) => 3,
        };
        // Stable: first-appearance order survives within each class, and the
        // payer stays at index 0 as the first writable signer.
        metas.sort_by_key(|m| class(m));

        let num_required_signatures = metas.iter().filter(|m| m.is_signer).count() as u8;
        let num_readonly_signed =
            metas.iter().filter(|m| m.is_signer && !m.is_writable).count() as u8;
        let num_readonly_unsigned =
            metas.iter().filter(|m| !m.is_signer && !m.is_writable).count() as u8;

        let index_of = |key: &Pubkey, metas: &[AccountMeta]| -> u8 {
            metas
                .iter()
                .position(|m| m.pubkey == *key)
                .map(|i| i as u8)
                .unwrap_or_else(|| unreachable!("every referenced key was collected"))
        };

        let compiled = instructions
            .iter()
            .map(|ix| CompiledInstruction {
                program_id_index: index_of(&ix.program_id, &metas),
                account_indexes: ix
                    .accounts
                    .iter()
                    .map(|a| index_of(&a.pubkey, &metas))
                    .collect(),
                data: ix.data.clone(),
            })
            .collect();

        Message {
            num_required_signatures,
            num_readonly_signed,
            num_readonly_unsigned,
            account_keys: metas.into_iter().map(|m| m.pubkey).collect(),
            recent_blockhash,
            instructions: compiled,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            3 + 2
                + self.account_keys.len() * 32
                + 32
                + self
                    .instructions
                    .iter()
                    .map(|ix| 1 + 3 + ix.account_indexes.len() + 3 + ix.data.len())
                    .sum::<usize>(),
        );
        buf.push(self.num_required_signatures);
        buf.push(self.num_readonly_signed);
        buf.push(self.num_readonly_unsigned);
        push_compact_u16(&mut buf, self.account_keys.len() as u16);
        for key in &self.account_keys {
            buf.extend_from_slice(key.as_bytes());
        }
        buf.extend_from_slice(&self.recent_blockhash);
        push_compact_u16(&mut buf, self.instructions.len() as u16);
        for ix in &self.instructions {
            buf.push(ix.program_id_index);
            push_compact_u16(&mut buf, ix.account_indexes.len() as u16);
            buf.extend_from_slice(&ix.account_indexes);
            push_compact_u16(&mut buf, ix.data.len() as u16);
            buf.extend_from_slice(&ix.data);
        }
        buf
    }

    /// The 32-byte digest handed to the threshold signer.
    pub fn signing_digest(&self) -> [u8; 32] {
        sha256(&self.serialize())
    }

    /// Privilege flags of the account at `index`, reconstructed from the
    /// header the same way the verifier does.
    pub fn account_meta_at(&self, index: usize) -> Option<AccountMeta> {
        let key = *self.account_keys.get(index)?;
        let signers = self.num_required_signatures as usize;
        let ro_signed = self.num_readonly_signed as usize;
        let ro_unsigned = self.num_readonly_unsigned as usize;
        let is_signer = index < signers;
        let is_writable = if is_signer {
            index < signers - ro_signed
        } else {
            index < self.account_keys.len() - ro_unsigned
        };
        Some(AccountMeta {
            pubkey: key,
            is_signer,
            is_writable,
        })
    }
}

/// `compact_u16(1) || signature || message`.
pub fn signed_transaction(signature: &[u8; SIGNATURE_LEN], message_bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + SIGNATURE_LEN + message_bytes.len());
    push_compact_u16(&mut buf, 1);
    buf.extend_from_slice(signature);
    buf.extend_from_slice(message_bytes);
    buf
}

// ── Independent decoder ──────────────────────────────────────────────────────
//
// A from-scratch parser of the serialized form, kept apart from the
// serializer so round-trip tests actually cross-check the layout.

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated at byte {0}")]
    Truncated(usize),

    #[error("account index {0} out of range")]
    AccountIndex(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub program_id: Pubkey,
    pub accounts: Vec<AccountMeta>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub account_keys: Vec<Pubkey>,
    pub recent_blockhash: [u8; 32],
    pub instructions: Vec<DecodedInstruction>,
}

pub fn decode_message(bytes: &[u8]) -> Result<DecodedMessage, DecodeError> {
    let take = |offset: usize, len: usize| -> Result<&[u8], DecodeError> {
        bytes
            .get(offset..offset + len)
            .ok_or(DecodeError::Truncated(offset))
    };

    let header = take(0, 3)?;
    let (num_signed, ro_signed, ro_unsigned) =
        (header[0] as usize, header[1] as usize, header[2] as usize);
    let mut offset = 3;

    let (key_count, next) =
        read_compact_u16(bytes, offset).ok_or(DecodeError::Truncated(offset))?;
    offset = next;
    let mut account_keys = Vec::with_capacity(key_count as usize);
    for _ in 0..key_count {
        let raw: [u8; 32] = take(offset, 32)?.try_into().expect("sliced 32 bytes");
        account_keys.push(Pubkey(raw));
        offset += 32;
    }

    let recent_blockhash: [u8; 32] = take(offset, 32)?.try_into().expect("sliced 32 bytes");
    offset += 32;

    let meta_at = |index: u8| -> Result<AccountMeta, DecodeError> {
        let i = index as usize;
        let key = *account_keys.get(i).ok_or(DecodeError::AccountIndex(index))?;
        let is_signer = i < num_signed;
        let is_writable = if is_signer {
            i < num_signed - ro_signed
        } else {
            i < account_keys.len() - ro_unsigned
        };
        Ok(AccountMeta {
            pubkey: key,
            is_signer,
            is_writable,
        })
    };

    let (ix_count, next) = read_compact_u16(bytes, offset).ok_or(DecodeError::Truncated(offset))?;
    offset = next;
    let mut instructions = Vec::with_capacity(ix_count as usize);
    for _ in 0..ix_count {
        let program_index = *bytes.get(offset).ok_or(DecodeError::Truncated(offset))?;
        offset += 1;
        let program_id = *account_keys
            .get(program_index as usize)
            .ok_or(DecodeError::AccountIndex(program_index))?;

        let (n_accounts, next) =
            read_compact_u16(bytes, offset).ok_or(DecodeError::Truncated(offset))?;
        offset = next;
        let mut accounts = Vec::with_capacity(n_accounts as usize);
        for _ in 0..n_accounts {
            let index = *bytes.get(offset).ok_or(DecodeError::Truncated(offset))?;
            offset += 1;
            accounts.push(meta_at(index)?);
        }

        let (data_len, next) =
            read_compact_u16(bytes, offset).ok_or(DecodeError::Truncated(offset))?;
        offset = next;
        let data = take(offset, data_len as usize)?.to_vec();
        offset += data_len as usize;

        instructions.push(DecodedInstruction {
            program_id,
            accounts,
            data,
        });
    }

    Ok(DecodedMessage {
        account_keys,
        recent_blockhash,
        instructions,
    })
}
