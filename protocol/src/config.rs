//! # Protocol Configuration & Constants
//!
//! Every magic number in Strata lives here. Seeds in particular are part of
//! the address scheme: changing one after launch orphans every account
//! derived from it, so treat them as frozen.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// The full protocol version string.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Seed hashed into the vault program id. All vault-owned addresses are
/// derived under this id.
pub const PROGRAM_ID_SEED: &[u8] = b"strata-vault-program";

/// Seed hashed into the simulated venue's program id.
pub const EXCHANGE_PROGRAM_ID_SEED: &[u8] = b"strata-simulated-venue";

/// Domain tag appended to every address derivation so derived addresses can
/// never collide with a raw hash of the same seeds.
pub const DERIVED_ADDRESS_TAG: &[u8] = b"ProgramDerivedAddress";

// ---------------------------------------------------------------------------
// Collateral & Position Precision
// ---------------------------------------------------------------------------

/// Decimal places of the accepted collateral asset (USDC-style).
pub const COLLATERAL_DECIMALS: u8 = 6;

/// Multiplier for one whole unit of collateral.
pub const COLLATERAL_MULTIPLIER: u64 = 10u64.pow(COLLATERAL_DECIMALS as u32);

/// Claim tokens share the collateral's precision so deposits mint 1:1.
pub const CLAIM_DECIMALS: u8 = COLLATERAL_DECIMALS;

/// Decimal places of venue order sizes. 1_000 lots = one contract.
pub const POSITION_PRECISION: u32 = 3;

/// Multiplier for one whole contract in lots.
pub const POSITION_MULTIPLIER: u64 = 10u64.pow(POSITION_PRECISION);

// ---------------------------------------------------------------------------
// Vault Parameters
// ---------------------------------------------------------------------------

/// Vault names are packed into a fixed 20-byte field on the venue side.
pub const MAX_VAULT_NAME_LEN: usize = 20;

/// One week, in seconds. The default distance between consecutive epochs.
pub const DEFAULT_EPOCH_CADENCE_SECS: i64 = 604_800;

// ---------------------------------------------------------------------------
// Address Derivation Seeds
// ---------------------------------------------------------------------------

/// Seed for the vault's claim-token mint: `[name, CLAIM_MINT_SEED]`.
pub const CLAIM_MINT_SEED: &[u8] = b"redeemable_mint";

/// Seed for the vault's pooled collateral account: `[name, COLLATERAL_SEED]`.
pub const COLLATERAL_SEED: &[u8] = b"vault_usdc";

/// Seed for a depositor's claim account: `[owner, name, USER_CLAIM_SEED]`.
pub const USER_CLAIM_SEED: &[u8] = b"user_redeemable";

/// Venue seed for margin accounts: `[MARGIN_SEED, group, authority]`.
pub const MARGIN_SEED: &[u8] = b"margin";

/// Venue seed for open-orders accounts: `[OPEN_ORDERS_SEED, market, authority]`.
pub const OPEN_ORDERS_SEED: &[u8] = b"open-orders";

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default RPC API port.
pub const DEFAULT_RPC_PORT: u16 = 9841;

/// Default metrics (Prometheus) port.
pub const DEFAULT_METRICS_PORT: u16 = 9842;

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Tunables a node hands to its vault registry.
///
/// Defaults mirror the constants above; override per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultParams {
    /// Cadence for schedules submitted without one.
    pub default_cadence_secs: i64,
    /// Longest accepted vault name in bytes.
    pub max_name_len: usize,
}

impl Default for VaultParams {
    fn default() -> Self {
        Self {
            default_cadence_secs: DEFAULT_EPOCH_CADENCE_SECS,
            max_name_len: MAX_VAULT_NAME_LEN,
        }
    }
}

/// Validates a vault name: 1..=`max_len` bytes of printable ASCII.
///
/// Returns a human-readable reason on failure.
pub fn validate_vault_name(name: &str, max_len: usize) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".into());
    }
    if name.len() > max_len {
        return Err(format!("name is {} bytes, limit is {}", name.len(), max_len));
    }
    if !name.bytes().all(|b| b.is_ascii_graphic()) {
        return Err("name must be printable ASCII without spaces".into());
    }
    Ok(())
}
