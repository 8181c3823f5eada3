//! SHA-256 plus the Anchor-style instruction discriminator.

use sha2::{Digest, Sha256};

/// One-shot SHA-256 over contiguous input.
pub fn sha256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher.finalize().into()
}

/// First 8 bytes of `sha256("global:<method>")`.
///
/// Always computed from the method name; the known constants are pinned in
/// tests, never pasted into the builder.
pub fn discriminator(method: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(b"global:");
    hasher.update(method.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}
