//! # Derivatives Venue Interface
//!
//! Vaults never hold option positions themselves. They park collateral in a
//! margin account at an external venue and rest orders there. This module
//! is the boundary: the [`MarginExchange`] trait lists the calls a vault
//! makes, and [`SimulatedExchange`] is an in-memory venue that honours the
//! same contract for tests and devnet nodes.
//!
//! Every venue call is all-or-nothing. If it returns `Err`, the venue's
//! state is unchanged, and the vault aborts the enclosing operation.
//!
//! Account references travel as typed bundles ([`MarginAccounts`],
//! [`OrderAccounts`]) derived from the vault's address and checked once
//! when they are built.

mod simulated;
mod types;

pub use simulated::SimulatedExchange;
pub use types::{
    MarginAccountState, MarginAccounts, Market, OptionKind, Order, OrderAccounts, OrderId, Side,
};

use thiserror::Error;

use crate::crypto::Pubkey;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejections reported by a venue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("margin account {0} already exists")]
    MarginAccountExists(Pubkey),

    #[error("margin account {0} not found")]
    MarginAccountNotFound(Pubkey),

    #[error("open orders account {0} already exists")]
    OpenOrdersExists(Pubkey),

    #[error("open orders account {0} not found")]
    OpenOrdersNotFound(Pubkey),

    #[error("market {0} not found")]
    MarketNotFound(Pubkey),

    #[error("market {0} has expired")]
    MarketExpired(Pubkey),

    /// Not enough free margin to withdraw or to back an order.
    #[error("insufficient margin: free {available}, required {requested}")]
    InsufficientMargin {
        /// Margin not already committed to orders or positions.
        available: u64,
        /// What the call needed.
        requested: u64,
    },

    /// Cancel against an order that is not resting (filled, cancelled, or
    /// never placed).
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// An account in the bundle does not match its expected derivation.
    #[error("account mismatch: {0}")]
    AccountMismatch(String),

    /// The venue refused the call for reasons of its own.
    #[error("venue rejected the call: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// MarginExchange
// ---------------------------------------------------------------------------

/// The calls a vault makes against a derivatives venue.
///
/// Mutating calls take `&mut self`; the caller serializes access.
pub trait MarginExchange: Send {
    /// Address every venue account is derived under.
    fn program_id(&self) -> Pubkey;

    /// The venue's market group. Margin accounts are scoped to it.
    fn group(&self) -> Pubkey;

    fn initialize_margin_account(&mut self, accounts: &MarginAccounts) -> Result<(), ExchangeError>;

    /// Moves `amount` of collateral from the vault into its margin account.
    fn deposit(&mut self, accounts: &MarginAccounts, amount: u64) -> Result<(), ExchangeError>;

    /// Moves `amount` of free margin back to the vault.
    fn withdraw(&mut self, accounts: &MarginAccounts, amount: u64) -> Result<(), ExchangeError>;

    fn initialize_open_orders(&mut self, accounts: &OrderAccounts) -> Result<(), ExchangeError>;

    /// Rests (or fills) an order. `price` is collateral minor units per
    /// contract; `size` is in lots.
    fn place_order(
        &mut self,
        accounts: &OrderAccounts,
        price: u64,
        size: u64,
        side: Side,
        client_order_id: Option<u64>,
    ) -> Result<OrderId, ExchangeError>;

    fn cancel_order(
        &mut self,
        accounts: &OrderAccounts,
        side: Side,
        order_id: OrderId,
    ) -> Result<(), ExchangeError>;

    fn margin_state(&self, margin_account: &Pubkey) -> Result<MarginAccountState, ExchangeError>;

    fn market(&self, market: &Pubkey) -> Result<Market, ExchangeError>;
}
