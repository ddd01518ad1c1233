//! # Vault Account
//!
//! The aggregate root of the vault program. A [`VaultAccount`] owns one
//! vault's identity, its epoch schedule, its [`RedeemableLedger`], and its
//! references to the venue margin account and open-orders accounts.
//!
//! Every operation follows the same shape:
//!
//! 1. Check the signer (admin-only calls).
//! 2. Check the phase against [`Operation::permitted_phases`].
//! 3. Validate and mutate the ledger.
//! 4. Make the venue call, if any. It is always the last fallible step.
//!
//! Operations mutate `self` in place and may leave it half-updated on
//! error. Callers run them on a copy and keep the copy only on success; the
//! [`VaultRegistry`](crate::registry::VaultRegistry) does exactly that.
//!
//! ## Epoch walk
//!
//! ```text
//!  Funding ─────────▶ AwaitingAuction ──▶ Trading ──────▶ AwaitingSettlement ──▶ Settlement ─────────▶ Stale
//!  deposit            deposit_to_margin   place_order     cancel_order            withdraw_from_margin   drain_residual
//!                     open_margin_position cancel_order                           close_margin_position  redeem
//!                                                                                 redeem                 rollover ──▶ Funding
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use strata_protocol::config::{
    validate_vault_name, VaultParams, CLAIM_MINT_SEED, COLLATERAL_SEED, POSITION_MULTIPLIER,
    PROGRAM_ID_SEED, USER_CLAIM_SEED,
};
use strata_protocol::crypto::{derive_address, program_id, Pubkey};
use strata_protocol::epoch::{EpochError, EpochTimes, Operation, Phase};
use strata_protocol::exchange::{
    ExchangeError, MarginAccounts, MarginExchange, OrderAccounts, OrderId, Side,
};
use strata_protocol::ledger::{LedgerError, RedeemableLedger, UserClaim};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a vault operation was refused. Every error aborts the whole
/// operation; nothing is partially applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    /// Called outside the phases that admit it. Retry later.
    #[error("{operation} is not permitted during {current} (allowed: {})", join_phases(.required))]
    PhaseViolation {
        operation: Operation,
        /// Phases that would have admitted the call.
        required: &'static [Phase],
        current: Phase,
    },

    /// A one-shot setup call was repeated.
    #[error("{0} is already initialized")]
    AlreadyInitialized(String),

    /// A redemption or pool move asked for more than is there.
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: u64, requested: u64 },

    /// Burn against zero claim supply. Whatever collateral remains is
    /// residual; see `drain_residual`.
    #[error("no claims outstanding; {collateral} collateral is residual")]
    LedgerEmpty { collateral: u64 },

    /// Cancel against an order the venue does not have resting. Usually
    /// means it already filled.
    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    /// The venue rejected a sub-call.
    #[error("venue call failed: {0}")]
    CpiFailure(ExchangeError),

    #[error("invalid epoch schedule: {0}")]
    InvalidEpochOrdering(EpochError),

    /// A non-admin signer on an admin-only call.
    #[error("{signer} is not authorized to {operation}")]
    Unauthorized { operation: Operation, signer: Pubkey },

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("invalid vault name: {0}")]
    InvalidName(String),

    #[error("margin account has not been initialized")]
    MarginAccountMissing,

    #[error("no open orders account for market {0}")]
    OpenOrdersMissing(Pubkey),

    /// `open_margin_position` already ran this epoch.
    #[error("margin position already opened in epoch {epoch_index}")]
    MarginAlreadyOpened { epoch_index: u64 },

    /// The margin balance does not cover one lot at the market's strike.
    #[error("margin balance {margin_balance} is too small for strike {strike}")]
    OrderTooSmall { margin_balance: u64, strike: u64 },

    /// Drain attempted while claims are outstanding.
    #[error("{supply} claims are still outstanding")]
    ResidualClaims { supply: u64 },

    #[error("arithmetic overflow")]
    ArithmeticOverflow,
}

impl VaultError {
    /// Stable snake_case tag for API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::PhaseViolation { .. } => "phase_violation",
            VaultError::AlreadyInitialized(_) => "already_initialized",
            VaultError::InsufficientBalance { .. } => "insufficient_balance",
            VaultError::LedgerEmpty { .. } => "ledger_empty",
            VaultError::OrderNotFound(_) => "order_not_found",
            VaultError::CpiFailure(_) => "cpi_failure",
            VaultError::InvalidEpochOrdering(_) => "invalid_epoch_ordering",
            VaultError::Unauthorized { .. } => "unauthorized",
            VaultError::ZeroAmount => "zero_amount",
            VaultError::InvalidName(_) => "invalid_name",
            VaultError::MarginAccountMissing => "margin_account_missing",
            VaultError::OpenOrdersMissing(_) => "open_orders_missing",
            VaultError::MarginAlreadyOpened { .. } => "margin_already_opened",
            VaultError::OrderTooSmall { .. } => "order_too_small",
            VaultError::ResidualClaims { .. } => "residual_claims",
            VaultError::ArithmeticOverflow => "arithmetic_overflow",
        }
    }
}

fn join_phases(phases: &[Phase]) -> String {
    phases
        .iter()
        .map(Phase::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<LedgerError> for VaultError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::ZeroAmount => VaultError::ZeroAmount,
            LedgerError::InsufficientBalance {
                available,
                requested,
            } => VaultError::InsufficientBalance {
                available,
                requested,
            },
            LedgerError::LedgerEmpty { collateral } => VaultError::LedgerEmpty { collateral },
            LedgerError::OutstandingClaims { supply } => VaultError::ResidualClaims { supply },
            LedgerError::Overflow => VaultError::ArithmeticOverflow,
        }
    }
}

impl From<EpochError> for VaultError {
    fn from(e: EpochError) -> Self {
        VaultError::InvalidEpochOrdering(e)
    }
}

impl From<ExchangeError> for VaultError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::OrderNotFound(id) => VaultError::OrderNotFound(id),
            other => VaultError::CpiFailure(other),
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Parameters of an auction order. The size is not among them: it is
/// always derived from the margin balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionOrder {
    pub market: Pubkey,
    /// Collateral minor units per contract.
    pub price: u64,
    pub side: Side,
    #[serde(default)]
    pub client_order_id: Option<u64>,
}

/// Read model of a vault, as served by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSummary {
    pub name: String,
    pub address: Pubkey,
    pub admin: Pubkey,
    pub phase: Phase,
    pub epoch: EpochTimes,
    pub epoch_index: u64,
    pub collateral_balance: u64,
    pub claim_supply: u64,
    pub holders: usize,
    pub margin_account: Option<Pubkey>,
    pub markets: Vec<Pubkey>,
}

/// One vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultAccount {
    /// Immutable identifier; every vault address derives from it.
    pub name: String,
    pub admin: Pubkey,
    pub address: Pubkey,
    pub claim_mint: Pubkey,
    /// The pooled collateral account.
    pub collateral_account: Pubkey,
    pub epoch: EpochTimes,
    /// Rollovers performed so far.
    pub epoch_index: u64,
    ledger: RedeemableLedger,
    /// Venue margin account, once initialized.
    pub margin: Option<MarginAccounts>,
    /// Open-orders accounts by market.
    pub open_orders: BTreeMap<Pubkey, OrderAccounts>,
    /// Epoch index in which `open_margin_position` last ran.
    pub margin_opened_in: Option<u64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl VaultAccount {
    /// Creates a vault with an empty ledger. Uniqueness of the name is the
    /// registry's concern.
    pub fn initialize(
        name: &str,
        epoch: EpochTimes,
        admin: Pubkey,
        params: &VaultParams,
        now: i64,
    ) -> VaultResult<Self> {
        validate_vault_name(name, params.max_name_len).map_err(VaultError::InvalidName)?;
        epoch.validate()?;
        if epoch.end_epoch <= now {
            return Err(EpochError::AlreadyEnded {
                end_epoch: epoch.end_epoch,
                now,
            }
            .into());
        }

        let program = program_id(PROGRAM_ID_SEED);
        let seed = name.as_bytes();
        Ok(Self {
            name: name.to_string(),
            admin,
            address: derive_address(&[seed], &program),
            claim_mint: derive_address(&[seed, CLAIM_MINT_SEED], &program),
            collateral_account: derive_address(&[seed, COLLATERAL_SEED], &program),
            epoch,
            epoch_index: 0,
            ledger: RedeemableLedger::new(),
            margin: None,
            open_orders: BTreeMap::new(),
            margin_opened_in: None,
            created_at: now,
            updated_at: now,
        })
    }

    // -- Reads --------------------------------------------------------------

    pub fn ledger(&self) -> &RedeemableLedger {
        &self.ledger
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut RedeemableLedger {
        &mut self.ledger
    }

    pub fn phase(&self, now: i64) -> Phase {
        self.epoch.phase_at(now)
    }

    pub fn collateral_balance(&self) -> u64 {
        self.ledger.collateral_balance()
    }

    pub fn claim_supply(&self) -> u64 {
        self.ledger.claim_supply()
    }

    pub fn claim_of(&self, owner: &Pubkey) -> Option<&UserClaim> {
        self.ledger.claim(owner)
    }

    /// Address of `owner`'s claim account in this vault.
    pub fn claim_address(&self, owner: &Pubkey) -> Pubkey {
        derive_address(
            &[owner.as_ref_bytes(), self.name.as_bytes(), USER_CLAIM_SEED],
            &program_id(PROGRAM_ID_SEED),
        )
    }

    /// Payout that burning `claim_amount` would yield now.
    pub fn redemption_quote(&self, claim_amount: u64) -> VaultResult<u64> {
        Ok(self.ledger.quote(claim_amount)?)
    }

    pub fn summary(&self, now: i64) -> VaultSummary {
        VaultSummary {
            name: self.name.clone(),
            address: self.address,
            admin: self.admin,
            phase: self.phase(now),
            epoch: self.epoch,
            epoch_index: self.epoch_index,
            collateral_balance: self.collateral_balance(),
            claim_supply: self.claim_supply(),
            holders: self.ledger.holder_count(),
            margin_account: self.margin.as_ref().map(|m| m.margin_account),
            markets: self.open_orders.keys().copied().collect(),
        }
    }

    // -- Guards -------------------------------------------------------------

    pub(crate) fn authorize(&self, operation: Operation, signer: &Pubkey) -> VaultResult<()> {
        if operation.admin_only() && *signer != self.admin {
            warn!(vault = %self.name, %operation, %signer, "rejected non-admin signer");
            return Err(VaultError::Unauthorized {
                operation,
                signer: *signer,
            });
        }
        Ok(())
    }

    pub(crate) fn gate(&self, operation: Operation, now: i64) -> VaultResult<Phase> {
        let current = self.phase(now);
        if !operation.is_permitted(current) {
            return Err(VaultError::PhaseViolation {
                operation,
                required: operation.permitted_phases(),
                current,
            });
        }
        Ok(current)
    }

    fn admit(&self, operation: Operation, signer: &Pubkey, now: i64) -> VaultResult<Phase> {
        self.authorize(operation, signer)?;
        self.gate(operation, now)
    }

    fn margin_accounts(&self) -> VaultResult<MarginAccounts> {
        self.margin.clone().ok_or(VaultError::MarginAccountMissing)
    }

    fn order_accounts(&self, market: &Pubkey) -> VaultResult<OrderAccounts> {
        self.open_orders
            .get(market)
            .cloned()
            .ok_or(VaultError::OpenOrdersMissing(*market))
    }

    // -- Depositor operations -----------------------------------------------

    /// Mints `amount` claims 1:1 for `depositor`. Funding only.
    pub fn deposit(&mut self, depositor: Pubkey, amount: u64, now: i64) -> VaultResult<u64> {
        self.admit(Operation::Deposit, &depositor, now)?;
        let minted = self.ledger.mint(depositor, amount)?;
        self.updated_at = now;
        Ok(minted)
    }

    /// Burns `claim_amount` of `depositor`'s claims for their pro-rata
    /// share of the pool. Returns the payout.
    pub fn redeem<E: MarginExchange>(
        &mut self,
        exchange: &E,
        depositor: Pubkey,
        claim_amount: u64,
        now: i64,
    ) -> VaultResult<u64> {
        self.admit(Operation::Redeem, &depositor, now)?;

        // Redeeming before the margin comes home prices claims off a partial
        // pool. Allowed, but worth a flag.
        if let Some(margin) = &self.margin {
            if let Ok(state) = exchange.margin_state(&margin.margin_account) {
                if state.balance > 0 {
                    warn!(
                        vault = %self.name,
                        margin_balance = state.balance,
                        "redemption while collateral is still at the venue"
                    );
                }
            }
        }

        let payout = self.ledger.burn(&depositor, claim_amount)?;
        self.updated_at = now;
        Ok(payout)
    }

    // -- Admin: margin ------------------------------------------------------

    /// Creates the vault's venue margin account. Once per vault.
    pub fn init_margin_account<E: MarginExchange>(
        &mut self,
        exchange: &mut E,
        signer: &Pubkey,
        now: i64,
    ) -> VaultResult<Pubkey> {
        self.admit(Operation::InitMarginAccount, signer, now)?;
        if self.margin.is_some() {
            return Err(VaultError::AlreadyInitialized("margin account".into()));
        }

        let accounts = MarginAccounts::derive(
            self.address,
            self.collateral_account,
            exchange.group(),
            &exchange.program_id(),
        );
        debug!(vault = %self.name, margin = %accounts.margin_account, "initializing margin account");
        exchange.initialize_margin_account(&accounts)?;

        let key = accounts.margin_account;
        self.margin = Some(accounts);
        self.updated_at = now;
        Ok(key)
    }

    /// Moves `amount` of pooled collateral into the margin account.
    pub fn deposit_to_margin<E: MarginExchange>(
        &mut self,
        exchange: &mut E,
        signer: &Pubkey,
        amount: u64,
        now: i64,
    ) -> VaultResult<()> {
        self.admit(Operation::DepositToMargin, signer, now)?;
        let accounts = self.margin_accounts()?;
        self.ledger.withdraw_collateral(amount)?;

        debug!(vault = %self.name, amount, "margin deposit");
        exchange.deposit(&accounts, amount)?;
        self.updated_at = now;
        Ok(())
    }

    /// Moves the whole pool into the margin account. Once per epoch.
    pub fn open_margin_position<E: MarginExchange>(
        &mut self,
        exchange: &mut E,
        signer: &Pubkey,
        now: i64,
    ) -> VaultResult<u64> {
        self.admit(Operation::OpenMarginPosition, signer, now)?;
        if self.margin_opened_in == Some(self.epoch_index) {
            return Err(VaultError::MarginAlreadyOpened {
                epoch_index: self.epoch_index,
            });
        }
        let accounts = self.margin_accounts()?;
        let amount = self.ledger.collateral_balance();
        self.ledger.withdraw_collateral(amount)?;
        self.margin_opened_in = Some(self.epoch_index);

        debug!(vault = %self.name, amount, "opening margin position");
        exchange.deposit(&accounts, amount)?;
        self.updated_at = now;
        Ok(amount)
    }

    /// Moves `amount` from the margin account back into the pool.
    pub fn withdraw_from_margin<E: MarginExchange>(
        &mut self,
        exchange: &mut E,
        signer: &Pubkey,
        amount: u64,
        now: i64,
    ) -> VaultResult<()> {
        self.admit(Operation::WithdrawFromMargin, signer, now)?;
        if amount == 0 {
            return Err(VaultError::ZeroAmount);
        }
        let accounts = self.margin_accounts()?;
        self.ledger.return_collateral(amount)?;

        debug!(vault = %self.name, amount, "margin withdraw");
        exchange.withdraw(&accounts, amount)?;
        self.updated_at = now;
        Ok(())
    }

    /// Pulls the entire margin balance back into the pool. Claim supply is
    /// untouched, so the auction's gain or loss lands on every claim alike.
    pub fn close_margin_position<E: MarginExchange>(
        &mut self,
        exchange: &mut E,
        signer: &Pubkey,
        now: i64,
    ) -> VaultResult<u64> {
        self.admit(Operation::CloseMarginPosition, signer, now)?;
        let accounts = self.margin_accounts()?;
        let amount = exchange.margin_state(&accounts.margin_account)?.balance;
        self.ledger.return_collateral(amount)?;

        if amount > 0 {
            debug!(vault = %self.name, amount, "closing margin position");
            exchange.withdraw(&accounts, amount)?;
        }
        self.updated_at = now;
        Ok(amount)
    }

    // -- Admin: orders ------------------------------------------------------

    /// Creates the open-orders account for `market`. Once per market.
    pub fn init_open_orders<E: MarginExchange>(
        &mut self,
        exchange: &mut E,
        signer: &Pubkey,
        market: Pubkey,
        now: i64,
    ) -> VaultResult<Pubkey> {
        self.admit(Operation::InitOpenOrders, signer, now)?;
        if self.open_orders.contains_key(&market) {
            return Err(VaultError::AlreadyInitialized(format!(
                "open orders for market {market}"
            )));
        }
        let margin = self.margin_accounts()?;
        let accounts = OrderAccounts::derive(
            self.address,
            margin.margin_account,
            market,
            &exchange.program_id(),
        );
        exchange.initialize_open_orders(&accounts)?;

        let key = accounts.open_orders;
        self.open_orders.insert(market, accounts);
        self.updated_at = now;
        Ok(key)
    }

    /// Places the auction order. Size is
    /// `margin_balance * POSITION_MULTIPLIER / strike` lots, so the order
    /// never commits more than the margin account holds.
    pub fn place_auction_order<E: MarginExchange>(
        &mut self,
        exchange: &mut E,
        signer: &Pubkey,
        order: AuctionOrder,
        now: i64,
    ) -> VaultResult<(OrderId, u64)> {
        self.admit(Operation::PlaceOrder, signer, now)?;
        let accounts = self.order_accounts(&order.market)?;
        let margin_balance = exchange.margin_state(&accounts.margin_account)?.balance;
        let strike = exchange.market(&order.market)?.strike;
        let size = auction_order_size(margin_balance, strike)?;

        debug!(vault = %self.name, market = %order.market, price = order.price, size, side = %order.side, "placing auction order");
        let order_id = exchange.place_order(
            &accounts,
            order.price,
            size,
            order.side,
            order.client_order_id,
        )?;
        self.updated_at = now;
        Ok((order_id, size))
    }

    /// Cancels a resting order. [`VaultError::OrderNotFound`] is expected
    /// when the order has already filled.
    pub fn cancel_auction_order<E: MarginExchange>(
        &mut self,
        exchange: &mut E,
        signer: &Pubkey,
        market: &Pubkey,
        side: Side,
        order_id: OrderId,
        now: i64,
    ) -> VaultResult<()> {
        self.admit(Operation::CancelOrder, signer, now)?;
        let accounts = self.order_accounts(market)?;
        exchange.cancel_order(&accounts, side, order_id)?;
        self.updated_at = now;
        Ok(())
    }

    // -- Admin: residual ----------------------------------------------------

    /// Sweeps the pool to the admin once every claim is burned. Returns the
    /// amount sent to `destination`.
    pub fn drain_residual(
        &mut self,
        signer: &Pubkey,
        destination: &Pubkey,
        now: i64,
    ) -> VaultResult<u64> {
        self.admit(Operation::DrainResidual, signer, now)?;
        let amount = self.ledger.sweep()?;
        debug!(vault = %self.name, amount, %destination, "residual drained");
        self.updated_at = now;
        Ok(amount)
    }
}

/// Lots of an auction order backed by `margin_balance` at `strike`.
pub fn auction_order_size(margin_balance: u64, strike: u64) -> VaultResult<u64> {
    if strike == 0 {
        return Err(VaultError::CpiFailure(ExchangeError::InvalidOrder(
            "market strike is not set".into(),
        )));
    }
    let size = margin_balance as u128 * POSITION_MULTIPLIER as u128 / strike as u128;
    let size = u64::try_from(size).map_err(|_| VaultError::ArithmeticOverflow)?;
    if size == 0 {
        return Err(VaultError::OrderTooSmall {
            margin_balance,
            strike,
        });
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_protocol::exchange::{OptionKind, SimulatedExchange};

    const USDC: u64 = 1_000_000;

    fn admin() -> Pubkey {
        Pubkey::new([0xAA; 32])
    }

    fn vault() -> VaultAccount {
        let times = EpochTimes::new(0, 10, 12, 15, 18, 20, 40).unwrap();
        VaultAccount::initialize("sol_put", times, admin(), &VaultParams::default(), 0).unwrap()
    }

    #[test]
    fn test_initialize_derives_addresses() {
        let v = vault();
        assert_eq!(v.collateral_balance(), 0);
        assert_eq!(v.claim_supply(), 0);
        assert_ne!(v.address, v.claim_mint);
        assert_ne!(v.claim_mint, v.collateral_account);
        assert_ne!(v.claim_address(&admin()), v.address);
    }

    #[test]
    fn test_error_kind_tags() {
        assert_eq!(VaultError::ZeroAmount.kind(), "zero_amount");
        let err = VaultError::PhaseViolation {
            operation: Operation::Deposit,
            required: Operation::Deposit.permitted_phases(),
            current: Phase::Trading,
        };
        assert_eq!(err.kind(), "phase_violation");
        assert_eq!(
            err.to_string(),
            "deposit is not permitted during trading (allowed: funding)"
        );
    }

    #[test]
    fn test_initialize_rejects_bad_input() {
        let times = EpochTimes::new(0, 10, 12, 15, 18, 20, 40).unwrap();
        let params = VaultParams::default();
        assert!(matches!(
            VaultAccount::initialize("", times, admin(), &params, 0),
            Err(VaultError::InvalidName(_))
        ));

        let mut bad = times;
        bad.end_auction = 11;
        assert!(matches!(
            VaultAccount::initialize("v", bad, admin(), &params, 0),
            Err(VaultError::InvalidEpochOrdering(_))
        ));

        // Already running is fine; already over is not.
        assert!(VaultAccount::initialize("v", times, admin(), &params, 19).is_ok());
        assert_eq!(
            VaultAccount::initialize("v", times, admin(), &params, 20).unwrap_err(),
            VaultError::InvalidEpochOrdering(EpochError::AlreadyEnded {
                end_epoch: 20,
                now: 20
            })
        );
    }

    #[test]
    fn test_deposit_outside_funding() {
        let mut v = vault();
        let err = v.deposit(Pubkey::new([1; 32]), 5, 10).unwrap_err();
        assert_eq!(
            err,
            VaultError::PhaseViolation {
                operation: Operation::Deposit,
                required: &[Phase::Funding],
                current: Phase::AwaitingAuction,
            }
        );
        assert_eq!(
            err.to_string(),
            "deposit is not permitted during awaiting_auction (allowed: funding)"
        );
    }

    #[test]
    fn test_admin_checks_come_before_phase() {
        let mut v = vault();
        let mut venue = SimulatedExchange::new();
        let stranger = Pubkey::new([7; 32]);
        assert!(matches!(
            v.init_margin_account(&mut venue, &stranger, 0),
            Err(VaultError::Unauthorized { .. })
        ));
        assert!(matches!(
            v.drain_residual(&stranger, &stranger, 1),
            Err(VaultError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_auction_order_size() {
        assert_eq!(auction_order_size(430 * USDC, 100 * USDC).unwrap(), 4_300);
        assert_eq!(auction_order_size(99 * USDC, 100 * USDC).unwrap(), 990);
        assert_eq!(
            auction_order_size(0, 100 * USDC),
            Err(VaultError::OrderTooSmall {
                margin_balance: 0,
                strike: 100 * USDC
            })
        );
        assert!(matches!(
            auction_order_size(1, 0),
            Err(VaultError::CpiFailure(_))
        ));
    }

    #[test]
    fn test_margin_flow_moves_pool_not_claims() {
        let mut v = vault();
        let mut venue = SimulatedExchange::new();
        let depositor = Pubkey::new([1; 32]);

        v.init_margin_account(&mut venue, &admin(), 0).unwrap();
        v.deposit(depositor, 100 * USDC, 5).unwrap();

        assert_eq!(v.open_margin_position(&mut venue, &admin(), 11).unwrap(), 100 * USDC);
        assert_eq!(v.collateral_balance(), 0);
        assert_eq!(v.claim_supply(), 100 * USDC);
        assert_eq!(
            v.open_margin_position(&mut venue, &admin(), 12),
            Err(VaultError::MarginAlreadyOpened { epoch_index: 0 })
        );

        assert_eq!(v.close_margin_position(&mut venue, &admin(), 18).unwrap(), 100 * USDC);
        assert_eq!(v.collateral_balance(), 100 * USDC);
    }

    #[test]
    fn test_place_order_needs_open_orders() {
        let mut v = vault();
        let mut venue = SimulatedExchange::new();
        let market = venue.list_market(OptionKind::Put, 100 * USDC, 15);
        v.init_margin_account(&mut venue, &admin(), 0).unwrap();

        let order = AuctionOrder {
            market,
            price: USDC,
            side: Side::Ask,
            client_order_id: None,
        };
        assert_eq!(
            v.place_auction_order(&mut venue, &admin(), order, 13),
            Err(VaultError::OpenOrdersMissing(market))
        );

        v.init_open_orders(&mut venue, &admin(), market, 1).unwrap();
        assert!(matches!(
            v.init_open_orders(&mut venue, &admin(), market, 1),
            Err(VaultError::AlreadyInitialized(_))
        ));
        // Empty margin account: nothing to size an order with.
        assert!(matches!(
            v.place_auction_order(&mut venue, &admin(), order, 13),
            Err(VaultError::OrderTooSmall { .. })
        ));
    }

    #[test]
    fn test_exchange_errors_map() {
        assert_eq!(
            VaultError::from(ExchangeError::OrderNotFound(OrderId(3))),
            VaultError::OrderNotFound(OrderId(3))
        );
        assert!(matches!(
            VaultError::from(ExchangeError::Rejected("down".into())),
            VaultError::CpiFailure(ExchangeError::Rejected(_))
        ));
    }
}
