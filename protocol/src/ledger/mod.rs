//! # Redeemable Ledger
//!
//! Each vault keeps one [`RedeemableLedger`]: the pooled collateral, the
//! outstanding claim-token supply, and one [`UserClaim`] per depositor.
//!
//! ## Arithmetic
//!
//! - **Mint** is 1:1. Depositing `n` units of collateral mints `n` claims,
//!   whatever the current exchange rate between the two happens to be.
//!   Deposits only happen during funding, before the pool is put to work,
//!   so the rate is 1 whenever minting is allowed.
//! - **Burn** is pro-rata: `payout = floor(collateral * claims / supply)`,
//!   computed in `u128`. Truncation leaves dust in the pool. The dust
//!   accrues to whoever redeems later, and once every claim is burned the
//!   admin can [`sweep`](RedeemableLedger::sweep) what is left.
//! - Margin moves ([`withdraw_collateral`](RedeemableLedger::withdraw_collateral)
//!   and [`return_collateral`](RedeemableLedger::return_collateral)) change
//!   the pool without touching claims. That is how auction profit and loss
//!   reach depositors.
//!
//! ## Invariant
//!
//! `claim_supply == sum(claim.balance)` after every operation. Operations
//! validate first and mutate second, so a failed call leaves the ledger as
//! it was.
//!
//! ## Persistence
//!
//! Only the two totals serialize with the ledger. Claim records are stored
//! one per key next to it, and the ledger remembers which records an
//! operation touched ([`dirty_claims`](RedeemableLedger::dirty_claims)) so
//! a commit writes just those.

mod claim;

pub use claim::UserClaim;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Pubkey;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by ledger arithmetic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Mint, burn and collateral moves all reject zero.
    #[error("amount must be greater than zero")]
    ZeroAmount,

    /// A claim holder or the pool does not have enough.
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        /// What the holder (or pool) actually has.
        available: u64,
        /// What the caller asked for.
        requested: u64,
    },

    /// Burn against zero outstanding supply. Any collateral still in the
    /// pool is residual and can only be swept.
    #[error("no claims outstanding ({collateral} collateral left as residual)")]
    LedgerEmpty {
        /// Collateral stranded in the pool.
        collateral: u64,
    },

    /// A sweep was attempted while claims are still outstanding.
    #[error("{supply} claims still outstanding")]
    OutstandingClaims {
        /// Current claim supply.
        supply: u64,
    },

    /// A total would exceed `u64::MAX`.
    #[error("ledger arithmetic overflow")]
    Overflow,
}

// ---------------------------------------------------------------------------
// RedeemableLedger
// ---------------------------------------------------------------------------

/// Pool, supply and per-depositor claims for one vault.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedeemableLedger {
    /// Collateral held in the vault's pool account, in minor units.
    collateral_balance: u64,

    /// Claim tokens outstanding.
    claim_supply: u64,

    /// Claim records by owner. Persisted separately.
    #[serde(skip)]
    claims: BTreeMap<Pubkey, UserClaim>,

    /// Owners whose records changed since the last [`clear_dirty`](Self::clear_dirty).
    #[serde(skip)]
    dirty: BTreeSet<Pubkey>,
}

impl RedeemableLedger {
    /// An empty ledger: no collateral, no claims.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a ledger from its persisted totals and claim records.
    pub fn restore(
        collateral_balance: u64,
        claim_supply: u64,
        claims: impl IntoIterator<Item = UserClaim>,
    ) -> Self {
        Self {
            collateral_balance,
            claim_supply,
            claims: claims.into_iter().map(|c| (c.owner, c)).collect(),
            dirty: BTreeSet::new(),
        }
    }

    /// Attaches claim records loaded from storage, replacing any in memory.
    pub fn attach_claims(&mut self, claims: impl IntoIterator<Item = UserClaim>) {
        self.claims = claims.into_iter().map(|c| (c.owner, c)).collect();
        self.dirty.clear();
    }

    pub fn collateral_balance(&self) -> u64 {
        self.collateral_balance
    }

    pub fn claim_supply(&self) -> u64 {
        self.claim_supply
    }

    pub fn claim(&self, owner: &Pubkey) -> Option<&UserClaim> {
        self.claims.get(owner)
    }

    /// Claim balance of `owner`, zero if they never deposited.
    pub fn balance_of(&self, owner: &Pubkey) -> u64 {
        self.claims.get(owner).map_or(0, |c| c.balance)
    }

    /// All claim records, ordered by owner.
    pub fn claims(&self) -> impl Iterator<Item = &UserClaim> {
        self.claims.values()
    }

    /// Number of depositors currently holding claims.
    pub fn holder_count(&self) -> usize {
        self.claims.values().filter(|c| !c.is_empty()).count()
    }

    /// Records touched since the last [`clear_dirty`](Self::clear_dirty).
    pub fn dirty_claims(&self) -> Vec<UserClaim> {
        self.dirty
            .iter()
            .filter_map(|owner| self.claims.get(owner).cloned())
            .collect()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// `claim_supply` equals the sum of all claim balances.
    pub fn is_conserved(&self) -> bool {
        let total: u128 = self.claims.values().map(|c| c.balance as u128).sum();
        total == self.claim_supply as u128
    }

    // -----------------------------------------------------------------------
    // Mint / burn
    // -----------------------------------------------------------------------

    /// Takes `amount` of collateral into the pool and mints as many claims
    /// to `owner`. Returns the claims minted.
    pub fn mint(&mut self, owner: Pubkey, amount: u64) -> Result<u64, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        let collateral = self
            .collateral_balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        let supply = self
            .claim_supply
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;

        let existing = self.claims.get(&owner);
        let balance = existing
            .map_or(0, |c| c.balance)
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        let deposited = existing
            .map_or(0, |c| c.total_deposited)
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;

        self.collateral_balance = collateral;
        self.claim_supply = supply;
        let record = self
            .claims
            .entry(owner)
            .or_insert_with(|| UserClaim::new(owner));
        record.balance = balance;
        record.total_deposited = deposited;
        self.dirty.insert(owner);

        Ok(amount)
    }

    /// Collateral that burning `claim_amount` would pay out right now.
    pub fn quote(&self, claim_amount: u64) -> Result<u64, LedgerError> {
        if claim_amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if self.claim_supply == 0 {
            return Err(LedgerError::LedgerEmpty {
                collateral: self.collateral_balance,
            });
        }
        if claim_amount > self.claim_supply {
            return Err(LedgerError::InsufficientBalance {
                available: self.claim_supply,
                requested: claim_amount,
            });
        }
        Ok(pro_rata(self.collateral_balance, claim_amount, self.claim_supply))
    }

    /// Burns `claim_amount` of `owner`'s claims and releases their pro-rata
    /// share of the pool. Returns the payout.
    pub fn burn(&mut self, owner: &Pubkey, claim_amount: u64) -> Result<u64, LedgerError> {
        if claim_amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if self.claim_supply == 0 {
            return Err(LedgerError::LedgerEmpty {
                collateral: self.collateral_balance,
            });
        }

        let held = self.balance_of(owner);
        if claim_amount > held {
            return Err(LedgerError::InsufficientBalance {
                available: held,
                requested: claim_amount,
            });
        }

        let payout = pro_rata(self.collateral_balance, claim_amount, self.claim_supply);

        // claim_amount <= held <= supply and payout <= collateral, so none
        // of these can underflow.
        self.collateral_balance -= payout;
        self.claim_supply -= claim_amount;
        if let Some(record) = self.claims.get_mut(owner) {
            record.balance -= claim_amount;
            record.total_redeemed = record.total_redeemed.saturating_add(payout);
        }
        self.dirty.insert(*owner);

        Ok(payout)
    }

    // -----------------------------------------------------------------------
    // Pool moves
    // -----------------------------------------------------------------------

    /// Moves `amount` out of the pool (to a margin account). Claims are
    /// unaffected.
    pub fn withdraw_collateral(&mut self, amount: u64) -> Result<(), LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        self.collateral_balance = self.collateral_balance.checked_sub(amount).ok_or(
            LedgerError::InsufficientBalance {
                available: self.collateral_balance,
                requested: amount,
            },
        )?;
        Ok(())
    }

    /// Moves `amount` back into the pool. Zero is accepted: a margin
    /// account can come back empty.
    pub fn return_collateral(&mut self, amount: u64) -> Result<(), LedgerError> {
        self.collateral_balance = self
            .collateral_balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    /// Empties the pool once every claim is burned. Returns the residual.
    pub fn sweep(&mut self) -> Result<u64, LedgerError> {
        if self.claim_supply != 0 {
            return Err(LedgerError::OutstandingClaims {
                supply: self.claim_supply,
            });
        }
        Ok(std::mem::take(&mut self.collateral_balance))
    }
}

/// `floor(pool * part / whole)` without intermediate overflow.
///
/// Callers guarantee `whole > 0` and `part <= whole`, so the result fits in
/// `u64` and never exceeds `pool`.
pub fn pro_rata(pool: u64, part: u64, whole: u64) -> u64 {
    ((pool as u128 * part as u128) / whole as u128) as u64
}
