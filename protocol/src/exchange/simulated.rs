//! In-memory venue.
//!
//! Enough of a derivatives venue to drive a vault end to end: listed option
//! markets, margin accounts, resting orders, manual fills, and expiry
//! settlement. There is no matching engine. Tests stand in for the
//! counterparty by calling [`SimulatedExchange::fill_order`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::lots_value;
use super::{
    ExchangeError, MarginAccountState, MarginAccounts, MarginExchange, Market, OptionKind, Order,
    OrderAccounts, OrderId, Side,
};
use crate::config::EXCHANGE_PROGRAM_ID_SEED;
use crate::crypto::{derive_address, program_id, Pubkey};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MarginBook {
    authority: Pubkey,
    balance: u64,
    /// Signed lots per market. Negative is short.
    positions: BTreeMap<Pubkey, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenOrdersBook {
    market: Pubkey,
    margin_account: Pubkey,
}

/// A single-process venue implementing [`MarginExchange`].
///
/// Serializable so a node can keep the venue's books next to its vaults.
/// An injected failure is not part of the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedExchange {
    program_id: Pubkey,
    group: Pubkey,
    markets: BTreeMap<Pubkey, Market>,
    mark_prices: BTreeMap<Pubkey, u64>,
    margins: BTreeMap<Pubkey, MarginBook>,
    open_orders: BTreeMap<Pubkey, OpenOrdersBook>,
    orders: BTreeMap<OrderId, Order>,
    next_order_id: u128,
    market_nonce: u64,
    #[serde(skip)]
    pending_failure: Option<String>,
}

impl Default for SimulatedExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedExchange {
    pub fn new() -> Self {
        let program_id = program_id(EXCHANGE_PROGRAM_ID_SEED);
        let group = derive_address(&[b"group"], &program_id);
        Self {
            program_id,
            group,
            markets: BTreeMap::new(),
            mark_prices: BTreeMap::new(),
            margins: BTreeMap::new(),
            open_orders: BTreeMap::new(),
            orders: BTreeMap::new(),
            next_order_id: 1,
            market_nonce: 0,
            pending_failure: None,
        }
    }

    // -----------------------------------------------------------------------
    // Venue administration
    // -----------------------------------------------------------------------

    /// Lists a new option market and returns its key.
    pub fn list_market(&mut self, kind: OptionKind, strike: u64, expiry: i64) -> Pubkey {
        let nonce = self.market_nonce;
        self.market_nonce += 1;
        let key = derive_address(&[b"market", &nonce.to_le_bytes()], &self.program_id);
        self.markets.insert(
            key,
            Market {
                key,
                kind,
                strike,
                expiry,
                settlement_price: None,
            },
        );
        debug!(market = %key, ?kind, strike, expiry, "listed market");
        key
    }

    /// Sets the price used to mark open positions.
    pub fn set_mark_price(&mut self, market: &Pubkey, price: u64) -> Result<(), ExchangeError> {
        if !self.markets.contains_key(market) {
            return Err(ExchangeError::MarketNotFound(*market));
        }
        self.mark_prices.insert(*market, price);
        Ok(())
    }

    /// Makes the next mutating call fail with [`ExchangeError::Rejected`].
    pub fn fail_next_call(&mut self, reason: impl Into<String>) {
        self.pending_failure = Some(reason.into());
    }

    /// Fills up to `size` lots of a resting order against an outside
    /// counterparty. The premium moves at the order's price. Returns the lots
    /// filled.
    pub fn fill_order(&mut self, order_id: OrderId, size: u64) -> Result<u64, ExchangeError> {
        let order = self
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(ExchangeError::OrderNotFound(order_id))?;
        let filled = size.min(order.size);
        if filled == 0 {
            return Err(ExchangeError::InvalidOrder("fill size must be positive".into()));
        }
        let premium = lots_value(order.price, filled);

        let book = self
            .margins
            .get_mut(&order.margin_account)
            .ok_or(ExchangeError::MarginAccountNotFound(order.margin_account))?;
        let lots = i64::try_from(filled)
            .map_err(|_| ExchangeError::InvalidOrder("fill size out of range".into()))?;
        match order.side {
            Side::Ask => {
                book.balance = book.balance.saturating_add(premium);
                *book.positions.entry(order.market).or_insert(0) -= lots;
            }
            Side::Bid => {
                book.balance = book.balance.checked_sub(premium).ok_or(
                    ExchangeError::InsufficientMargin {
                        available: book.balance,
                        requested: premium,
                    },
                )?;
                *book.positions.entry(order.market).or_insert(0) += lots;
            }
        }

        if filled == order.size {
            self.orders.remove(&order_id);
        } else if let Some(resting) = self.orders.get_mut(&order_id) {
            resting.size -= filled;
        }
        debug!(order = %order_id, filled, premium, side = %order.side, "order filled");
        Ok(filled)
    }

    /// Expires a market at `settlement_price`: resting orders are dropped,
    /// shorts pay intrinsic value out of their balance, longs receive it.
    pub fn expire_market(
        &mut self,
        market: &Pubkey,
        settlement_price: u64,
    ) -> Result<(), ExchangeError> {
        let entry = self
            .markets
            .get_mut(market)
            .ok_or(ExchangeError::MarketNotFound(*market))?;
        if entry.is_expired() {
            return Err(ExchangeError::MarketExpired(*market));
        }
        entry.settlement_price = Some(settlement_price);
        let intrinsic = entry.intrinsic_value(settlement_price);

        self.orders.retain(|_, order| order.market != *market);

        for book in self.margins.values_mut() {
            let Some(position) = book.positions.remove(market) else {
                continue;
            };
            let payoff = lots_value(intrinsic, position.unsigned_abs());
            if position < 0 {
                book.balance = book.balance.saturating_sub(payoff);
            } else {
                book.balance = book.balance.saturating_add(payoff);
            }
        }
        debug!(market = %market, settlement_price, intrinsic, "market expired");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// The live market with these terms, if one is listed.
    pub fn find_market(&self, kind: OptionKind, strike: u64, expiry: i64) -> Option<Pubkey> {
        self.markets
            .values()
            .find(|m| {
                m.kind == kind && m.strike == strike && m.expiry == expiry && !m.is_expired()
            })
            .map(|m| m.key)
    }

    /// Every listed market, expired ones included, ordered by key.
    pub fn markets(&self) -> Vec<Market> {
        self.markets.values().cloned().collect()
    }

    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    /// Resting orders backed by `margin_account`.
    pub fn orders_for(&self, margin_account: &Pubkey) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| o.margin_account == *margin_account)
            .cloned()
            .collect()
    }

    /// Signed position in lots.
    pub fn position(&self, margin_account: &Pubkey, market: &Pubkey) -> i64 {
        self.margins
            .get(margin_account)
            .and_then(|b| b.positions.get(market).copied())
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn take_failure(&mut self) -> Result<(), ExchangeError> {
        match self.pending_failure.take() {
            Some(reason) => Err(ExchangeError::Rejected(reason)),
            None => Ok(()),
        }
    }

    fn book_for(&self, accounts: &MarginAccounts) -> Result<&MarginBook, ExchangeError> {
        let book = self
            .margins
            .get(&accounts.margin_account)
            .ok_or(ExchangeError::MarginAccountNotFound(accounts.margin_account))?;
        if book.authority != accounts.authority {
            return Err(ExchangeError::AccountMismatch(format!(
                "{} does not own margin account {}",
                accounts.authority, accounts.margin_account
            )));
        }
        Ok(book)
    }

    fn initial_margin(&self, margin_account: &Pubkey, book: &MarginBook) -> u64 {
        let resting: u64 = self
            .orders
            .values()
            .filter(|o| o.margin_account == *margin_account)
            .filter_map(|o| {
                let market = self.markets.get(&o.market)?;
                Some(match o.side {
                    Side::Ask => market.short_margin(o.size),
                    Side::Bid => lots_value(o.price, o.size),
                })
            })
            .fold(0u64, u64::saturating_add);

        let positions: u64 = book
            .positions
            .iter()
            .filter(|(_, lots)| **lots < 0)
            .filter_map(|(key, lots)| {
                let market = self.markets.get(key)?;
                Some(market.short_margin(lots.unsigned_abs()))
            })
            .fold(0u64, u64::saturating_add);

        resting.saturating_add(positions)
    }

    fn unrealized_pnl(&self, book: &MarginBook) -> i64 {
        book.positions
            .iter()
            .filter_map(|(key, lots)| {
                let market = self.markets.get(key)?;
                let mark = self.mark_prices.get(key)?;
                let value = lots_value(market.intrinsic_value(*mark), lots.unsigned_abs());
                let value = i64::try_from(value).unwrap_or(i64::MAX);
                Some(if *lots < 0 { -value } else { value })
            })
            .fold(0i64, i64::saturating_add)
    }

    fn free_margin(&self, margin_account: &Pubkey, book: &MarginBook) -> u64 {
        book.balance
            .saturating_sub(self.initial_margin(margin_account, book))
    }
}

impl MarginExchange for SimulatedExchange {
    fn program_id(&self) -> Pubkey {
        self.program_id
    }

    fn group(&self) -> Pubkey {
        self.group
    }

    fn initialize_margin_account(&mut self, accounts: &MarginAccounts) -> Result<(), ExchangeError> {
        self.take_failure()?;
        accounts.verify(&self.program_id)?;
        if accounts.group != self.group {
            return Err(ExchangeError::AccountMismatch(format!(
                "unknown group {}",
                accounts.group
            )));
        }
        if self.margins.contains_key(&accounts.margin_account) {
            return Err(ExchangeError::MarginAccountExists(accounts.margin_account));
        }
        self.margins.insert(
            accounts.margin_account,
            MarginBook {
                authority: accounts.authority,
                balance: 0,
                positions: BTreeMap::new(),
            },
        );
        debug!(margin = %accounts.margin_account, "margin account created");
        Ok(())
    }

    fn deposit(&mut self, accounts: &MarginAccounts, amount: u64) -> Result<(), ExchangeError> {
        self.take_failure()?;
        if amount == 0 {
            return Err(ExchangeError::Rejected("deposit of zero".into()));
        }
        let balance = self
            .book_for(accounts)?
            .balance
            .checked_add(amount)
            .ok_or_else(|| ExchangeError::Rejected("margin balance overflow".into()))?;
        if let Some(book) = self.margins.get_mut(&accounts.margin_account) {
            book.balance = balance;
        }
        debug!(margin = %accounts.margin_account, amount, balance, "margin deposit");
        Ok(())
    }

    fn withdraw(&mut self, accounts: &MarginAccounts, amount: u64) -> Result<(), ExchangeError> {
        self.take_failure()?;
        let book = self.book_for(accounts)?;
        let free = self.free_margin(&accounts.margin_account, book);
        if amount > free {
            return Err(ExchangeError::InsufficientMargin {
                available: free,
                requested: amount,
            });
        }
        if let Some(book) = self.margins.get_mut(&accounts.margin_account) {
            book.balance -= amount;
        }
        debug!(margin = %accounts.margin_account, amount, "margin withdraw");
        Ok(())
    }

    fn initialize_open_orders(&mut self, accounts: &OrderAccounts) -> Result<(), ExchangeError> {
        self.take_failure()?;
        accounts.verify(&self.program_id)?;
        if !self.markets.contains_key(&accounts.market) {
            return Err(ExchangeError::MarketNotFound(accounts.market));
        }
        if !self.margins.contains_key(&accounts.margin_account) {
            return Err(ExchangeError::MarginAccountNotFound(accounts.margin_account));
        }
        if self.open_orders.contains_key(&accounts.open_orders) {
            return Err(ExchangeError::OpenOrdersExists(accounts.open_orders));
        }
        self.open_orders.insert(
            accounts.open_orders,
            OpenOrdersBook {
                market: accounts.market,
                margin_account: accounts.margin_account,
            },
        );
        debug!(open_orders = %accounts.open_orders, market = %accounts.market, "open orders created");
        Ok(())
    }

    fn place_order(
        &mut self,
        accounts: &OrderAccounts,
        price: u64,
        size: u64,
        side: Side,
        client_order_id: Option<u64>,
    ) -> Result<OrderId, ExchangeError> {
        self.take_failure()?;
        let oo = self
            .open_orders
            .get(&accounts.open_orders)
            .ok_or(ExchangeError::OpenOrdersNotFound(accounts.open_orders))?;
        if oo.market != accounts.market || oo.margin_account != accounts.margin_account {
            return Err(ExchangeError::AccountMismatch(
                "open orders account belongs to another market or margin account".into(),
            ));
        }
        let market = self
            .markets
            .get(&accounts.market)
            .ok_or(ExchangeError::MarketNotFound(accounts.market))?;
        if market.is_expired() {
            return Err(ExchangeError::MarketExpired(accounts.market));
        }
        if price == 0 || size == 0 {
            return Err(ExchangeError::InvalidOrder(format!(
                "price {price} and size {size} must both be positive"
            )));
        }

        let required = match side {
            Side::Ask => market.short_margin(size),
            Side::Bid => lots_value(price, size),
        };
        let book = self
            .margins
            .get(&accounts.margin_account)
            .ok_or(ExchangeError::MarginAccountNotFound(accounts.margin_account))?;
        let free = self.free_margin(&accounts.margin_account, book);
        if required > free {
            return Err(ExchangeError::InsufficientMargin {
                available: free,
                requested: required,
            });
        }

        let order_id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        self.orders.insert(
            order_id,
            Order {
                order_id,
                client_order_id,
                market: accounts.market,
                margin_account: accounts.margin_account,
                side,
                price,
                size,
            },
        );
        debug!(order = %order_id, %side, price, size, "order placed");
        Ok(order_id)
    }

    fn cancel_order(
        &mut self,
        accounts: &OrderAccounts,
        side: Side,
        order_id: OrderId,
    ) -> Result<(), ExchangeError> {
        self.take_failure()?;
        let matches = self.orders.get(&order_id).is_some_and(|o| {
            o.side == side && o.market == accounts.market && o.margin_account == accounts.margin_account
        });
        if !matches {
            return Err(ExchangeError::OrderNotFound(order_id));
        }
        self.orders.remove(&order_id);
        debug!(order = %order_id, "order cancelled");
        Ok(())
    }

    fn margin_state(&self, margin_account: &Pubkey) -> Result<MarginAccountState, ExchangeError> {
        let book = self
            .margins
            .get(margin_account)
            .ok_or(ExchangeError::MarginAccountNotFound(*margin_account))?;
        Ok(MarginAccountState {
            authority: book.authority,
            balance: book.balance,
            initial_margin: self.initial_margin(margin_account, book),
            unrealized_pnl: self.unrealized_pnl(book),
        })
    }

    fn market(&self, market: &Pubkey) -> Result<Market, ExchangeError> {
        self.markets
            .get(market)
            .cloned()
            .ok_or(ExchangeError::MarketNotFound(*market))
    }
}
