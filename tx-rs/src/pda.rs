//! Program-derived addresses.
//!
//! A PDA is the first candidate in a descending bump search whose hash is
//! *not* a valid Ed25519 point, so no private key can ever sign for it. The
//! payment program owns one PDA per subscription (`["subscription", id]`)
//! and a global config PDA (`["config"]`); token balances live in associated
//! token accounts, themselves PDAs of the associated-token program.

use crate::hash::sha256;
use crate::pubkey::{Pubkey, ASSOCIATED_TOKEN_PROGRAM, TOKEN_PROGRAM};

const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";

/// Search bumps 255..=0 for the first off-curve candidate of
/// `sha256(seeds || bump || program_id || marker)`.
///
/// Panics if every bump yields an on-curve point. Each candidate is an
/// independent hash with a ~50% chance of being on the curve, so 256
/// consecutive hits means the hash function itself is broken.
pub fn find_program_address(seeds: &[&[u8]], program_id: &Pubkey) -> (Pubkey, u8) {
    let mut preimage = Vec::with_capacity(
        seeds.iter().map(|s| s.len()).sum::<usize>() + 1 + 32 + PDA_MARKER.len(),
    );
    for seed in seeds {
        preimage.extend_from_slice(seed);
    }
    let bump_at = preimage.len();
    preimage.push(0);
    preimage.extend_from_slice(program_id.as_bytes());
    preimage.extend_from_slice(PDA_MARKER);

    for bump in (0..=255u8).rev() {
        preimage[bump_at] = bump;
        let candidate = Pubkey(sha256(&preimage));
        if !candidate.is_on_curve() {
            return (candidate, bump);
        }
    }
    panic!("no off-curve program address for the given seeds");
}

/// PDA of the subscription record: seeds `["subscription", id]`.
pub fn subscription_address(subscription_id: &str, program_id: &Pubkey) -> (Pubkey, u8) {
    find_program_address(&[b"subscription", subscription_id.as_bytes()], program_id)
}

/// PDA of the program's global config: seeds `["config"]`.
pub fn config_address(program_id: &Pubkey) -> (Pubkey, u8) {
    find_program_address(&[b"config"], program_id)
}

/// Associated token account of `owner` for `mint`:
/// seeds `[owner, token_program, mint]` under the associated-token program.
pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    find_program_address(
        &[
            owner.as_bytes(),
            TOKEN_PROGRAM.as_bytes(),
            mint.as_bytes(),
        ],
        &ASSOCIATED_TOKEN_PROGRAM,
    )
    .0
}
