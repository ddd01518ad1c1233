//! # Hashing & Address Derivation
//!
//! Strata uses SHA-256 for one job: turning a list of seeds into a stable
//! account address. Every vault-owned account (the vault itself, its claim
//! mint, its pooled collateral account, each depositor's claim account) and
//! every venue account is addressed this way, so anyone holding the vault
//! name can recompute the whole account graph offline.

use sha2::{Digest, Sha256};

use super::keys::Pubkey;
use crate::config::DERIVED_ADDRESS_TAG;

/// SHA-256 of `data` as a fixed-size array.
///
/// ```
/// use strata_protocol::crypto::sha256;
///
/// assert_eq!(sha256(b"strata").len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Program id for a program seed: `sha256(seed)`.
pub fn program_id(seed: &[u8]) -> Pubkey {
    Pubkey::new(sha256(seed))
}

/// Derives an address from `seeds` under `program_id`.
///
/// `sha256(seed_0 || seed_1 || ... || program_id || DERIVED_ADDRESS_TAG)`.
/// Seeds are concatenated without separators, the same way callers pass
/// them, so `[b"ab", b"c"]` and `[b"a", b"bc"]` collide. Seed layouts are
/// fixed per account kind, which keeps this harmless.
pub fn derive_address(seeds: &[&[u8]], program_id: &Pubkey) -> Pubkey {
    let mut hasher = Sha256::new();
    for seed in seeds {
        hasher.update(seed);
    }
    hasher.update(program_id.as_bytes());
    hasher.update(DERIVED_ADDRESS_TAG);
    Pubkey::new(hasher.finalize().into())
}
