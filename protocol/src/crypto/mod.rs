//! # Identities and Derived Addresses
//!
//! Everything in Strata is addressed by a 32-byte [`Pubkey`]. Depositors and
//! admins hold Ed25519 keypairs; vault-owned accounts (claim mint, pooled
//! collateral, per-depositor claim accounts) have *derived* addresses that
//! no private key controls. Only the vault program can act for them.
//!
//! - **Ed25519** for signatures, via `ed25519-dalek`.
//! - **SHA-256** for address derivation.

pub mod hash;
pub mod keys;

pub use hash::{derive_address, program_id, sha256};
pub use keys::{KeyError, Keypair, Pubkey, Signature};
