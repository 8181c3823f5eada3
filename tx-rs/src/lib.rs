//! Chain toolkit for the Metronome keeper.
//!
//! Everything the keeper needs to talk to the payment program lives here:
//! pubkeys and program-derived addresses, Anchor-style instruction encoding,
//! legacy message serialization, a typed JSON-RPC facade over the node
//! endpoint, and a client for the remote threshold-signature service.
//!
//! The keeper injects [`signer::ThresholdSigner`] and [`rpc::NodeRpc`] as
//! capabilities, so the whole trigger pipeline can run against in-memory
//! fakes in tests.

pub mod encoding;
pub mod hash;
pub mod instruction;
pub mod message;
pub mod pda;
pub mod pubkey;
pub mod rpc;
pub mod signer;

pub use instruction::{AccountMeta, Instruction};
pub use pubkey::Pubkey;
