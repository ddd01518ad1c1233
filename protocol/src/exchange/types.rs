use serde::{Deserialize, Serialize};
use std::fmt;

use super::ExchangeError;
use crate::config::{MARGIN_SEED, OPEN_ORDERS_SEED, POSITION_MULTIPLIER};
use crate::crypto::{derive_address, Pubkey};

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Bid,
    Ask,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => f.write_str("bid"),
            Side::Ask => f.write_str("ask"),
        }
    }
}

/// Venue-assigned order identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub u128);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resting order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub client_order_id: Option<u64>,
    pub market: Pubkey,
    /// The margin account backing the order.
    pub margin_account: Pubkey,
    pub side: Side,
    /// Collateral minor units per contract.
    pub price: u64,
    /// Unfilled lots.
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Markets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    Call,
    Put,
}

/// Read model of one option market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub key: Pubkey,
    pub kind: OptionKind,
    /// Strike in collateral minor units.
    pub strike: u64,
    /// Unix seconds.
    pub expiry: i64,
    /// Settlement price once the market has expired.
    pub settlement_price: Option<u64>,
}

impl Market {
    pub fn is_expired(&self) -> bool {
        self.settlement_price.is_some()
    }

    /// Intrinsic value of one contract at `price`.
    pub fn intrinsic_value(&self, price: u64) -> u64 {
        match self.kind {
            OptionKind::Call => price.saturating_sub(self.strike),
            OptionKind::Put => self.strike.saturating_sub(price),
        }
    }

    /// Collateral a short position of `size` lots must post: the strike per
    /// contract for a put, which is also the cap used for calls here.
    pub fn short_margin(&self, size: u64) -> u64 {
        lots_value(self.strike, size)
    }
}

/// Value of `size` lots at `per_contract`, in collateral minor units.
pub fn lots_value(per_contract: u64, size: u64) -> u64 {
    let value = per_contract as u128 * size as u128 / POSITION_MULTIPLIER as u128;
    u64::try_from(value).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Margin accounts
// ---------------------------------------------------------------------------

/// Read model of a margin account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginAccountState {
    pub authority: Pubkey,
    /// Collateral held, in minor units.
    pub balance: u64,
    /// Collateral committed to resting orders and open positions.
    pub initial_margin: u64,
    /// Mark-to-market on open positions. Negative when short options are
    /// in the money.
    pub unrealized_pnl: i64,
}

impl MarginAccountState {
    /// `balance + unrealized_pnl`.
    pub fn equity(&self) -> i64 {
        i64::try_from(self.balance)
            .unwrap_or(i64::MAX)
            .saturating_add(self.unrealized_pnl)
    }

    /// Balance not committed as initial margin.
    pub fn free_margin(&self) -> u64 {
        self.balance.saturating_sub(self.initial_margin)
    }
}

// ---------------------------------------------------------------------------
// Account bundles
// ---------------------------------------------------------------------------

/// Accounts for margin-account calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginAccounts {
    /// Owner of the margin account (the vault).
    pub authority: Pubkey,
    /// The vault's pooled collateral account; deposits come from here and
    /// withdrawals land here.
    pub collateral_account: Pubkey,
    pub group: Pubkey,
    pub margin_account: Pubkey,
}

impl MarginAccounts {
    /// Derives the bundle for `authority` under a venue.
    pub fn derive(
        authority: Pubkey,
        collateral_account: Pubkey,
        group: Pubkey,
        venue_program: &Pubkey,
    ) -> Self {
        let margin_account = derive_address(
            &[MARGIN_SEED, group.as_ref_bytes(), authority.as_ref_bytes()],
            venue_program,
        );
        Self {
            authority,
            collateral_account,
            group,
            margin_account,
        }
    }

    /// Checks `margin_account` against its derivation.
    pub fn verify(&self, venue_program: &Pubkey) -> Result<(), ExchangeError> {
        let expected = derive_address(
            &[MARGIN_SEED, self.group.as_ref_bytes(), self.authority.as_ref_bytes()],
            venue_program,
        );
        if expected != self.margin_account {
            return Err(ExchangeError::AccountMismatch(format!(
                "margin account {} is not derived from authority {}",
                self.margin_account, self.authority
            )));
        }
        Ok(())
    }
}

/// Accounts for order calls on one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAccounts {
    pub authority: Pubkey,
    pub margin_account: Pubkey,
    pub market: Pubkey,
    pub open_orders: Pubkey,
}

impl OrderAccounts {
    pub fn derive(
        authority: Pubkey,
        margin_account: Pubkey,
        market: Pubkey,
        venue_program: &Pubkey,
    ) -> Self {
        let open_orders = derive_address(
            &[OPEN_ORDERS_SEED, market.as_ref_bytes(), authority.as_ref_bytes()],
            venue_program,
        );
        Self {
            authority,
            margin_account,
            market,
            open_orders,
        }
    }

    pub fn verify(&self, venue_program: &Pubkey) -> Result<(), ExchangeError> {
        let expected = derive_address(
            &[OPEN_ORDERS_SEED, self.market.as_ref_bytes(), self.authority.as_ref_bytes()],
            venue_program,
        );
        if expected != self.open_orders {
            return Err(ExchangeError::AccountMismatch(format!(
                "open orders account {} is not derived from market {}",
                self.open_orders, self.market
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::program_id;

    fn put(strike: u64) -> Market {
        Market {
            key: Pubkey::new([4u8; 32]),
            kind: OptionKind::Put,
            strike,
            expiry: 100,
            settlement_price: None,
        }
    }

    #[test]
    fn test_intrinsic_value() {
        let p = put(100_000_000);
        assert_eq!(p.intrinsic_value(90_000_000), 10_000_000);
        assert_eq!(p.intrinsic_value(110_000_000), 0);

        let c = Market {
            kind: OptionKind::Call,
            ..put(100_000_000)
        };
        assert_eq!(c.intrinsic_value(110_000_000), 10_000_000);
    }

    #[test]
    fn test_short_margin_in_lots() {
        // 4.3 contracts at a 100 USDC strike need 430 USDC.
        assert_eq!(put(100_000_000).short_margin(4_300), 430_000_000);
    }

    #[test]
    fn test_equity() {
        let state = MarginAccountState {
            authority: Pubkey::default(),
            balance: 1_000,
            initial_margin: 400,
            unrealized_pnl: -250,
        };
        assert_eq!(state.equity(), 750);
        assert_eq!(state.free_margin(), 600);
    }

    #[test]
    fn test_equity_saturates_on_huge_balance() {
        let state = MarginAccountState {
            authority: Pubkey::default(),
            balance: u64::MAX,
            initial_margin: 0,
            unrealized_pnl: -1,
        };
        assert_eq!(state.equity(), i64::MAX - 1);
    }

    #[test]
    fn test_bundles_verify_their_derivation() {
        let venue = program_id(b"venue");
        let vault = Pubkey::new([1u8; 32]);
        let group = Pubkey::new([2u8; 32]);

        let margin = MarginAccounts::derive(vault, Pubkey::new([3u8; 32]), group, &venue);
        assert!(margin.verify(&venue).is_ok());
        assert!(margin.verify(&program_id(b"other")).is_err());

        let mut orders =
            OrderAccounts::derive(vault, margin.margin_account, Pubkey::new([4u8; 32]), &venue);
        assert!(orders.verify(&venue).is_ok());
        orders.open_orders = Pubkey::new([9u8; 32]);
        assert!(matches!(
            orders.verify(&venue),
            Err(ExchangeError::AccountMismatch(_))
        ));
    }
}
