use serde::{Deserialize, Serialize};

use crate::crypto::Pubkey;

/// One depositor's claim-token account within one vault.
///
/// Created on first deposit. Kept after the balance returns to zero so the
/// lifetime totals survive into later epochs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaim {
    /// The depositor.
    pub owner: Pubkey,
    /// Claim tokens currently held.
    pub balance: u64,
    /// Collateral deposited over the account's lifetime.
    pub total_deposited: u64,
    /// Collateral paid out over the account's lifetime.
    pub total_redeemed: u64,
}

impl UserClaim {
    pub fn new(owner: Pubkey) -> Self {
        Self {
            owner,
            balance: 0,
            total_deposited: 0,
            total_redeemed: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.balance == 0
    }
}
