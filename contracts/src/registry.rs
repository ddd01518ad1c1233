//! # Vault Registry
//!
//! Named vaults, each independently lockable, with all-or-nothing
//! operations.
//!
//! ## Execution model
//!
//! Every mutating call runs the same steps:
//!
//! 1. Lock the vault (then the venue, if the call touches it).
//! 2. Read the clock once.
//! 3. Run the operation on a *copy* of the vault and of the venue.
//! 4. Persist the copied vault and the claims it touched in one sled
//!    transaction, together with the copied venue when the call moved it.
//! 5. Swap the copies in and emit a [`VaultEvent`].
//!
//! A failure at any step drops the copies, so memory, disk and venue all
//! keep the state they had before the call. Lock order is always vault,
//! then venue.
//!
//! Calls on different vaults proceed in parallel unless both need the
//! venue.
//!
//! ## Replay protection
//!
//! Signed requests carry a per-signer nonce. [`VaultRegistry::accept_nonce`]
//! admits a nonce only if it is above every nonce already seen from that
//! signer, and records it in the database's metadata.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use strata_protocol::config::VaultParams;
use strata_protocol::crypto::Pubkey;
use strata_protocol::epoch::{Clock, EpochTimes, Operation};
use strata_protocol::exchange::{ExchangeError, MarginExchange, OrderId, Side};
use strata_protocol::ledger::UserClaim;
use strata_protocol::storage::{DbError, VaultDB};

use crate::events::{VaultEvent, VaultEventKind};
use crate::vault::{AuctionOrder, VaultAccount, VaultError, VaultSummary};

/// How many recent events the registry keeps for late subscribers.
const EVENT_HISTORY: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("vault {0} not found")]
    VaultNotFound(String),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    #[error("nonce {nonce} from {signer} is not above the last accepted nonce {last}")]
    StaleNonce { signer: Pubkey, nonce: u64, last: u64 },
}

impl RegistryError {
    /// The vault-level error, if this is one.
    pub fn vault_error(&self) -> Option<&VaultError> {
        match self {
            RegistryError::Vault(e) => Some(e),
            _ => None,
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

type EventSink = Box<dyn Fn(&VaultEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// VaultRegistry
// ---------------------------------------------------------------------------

/// All vaults served by one node, plus the venue they trade on.
pub struct VaultRegistry<E: MarginExchange + Clone> {
    vaults: DashMap<String, Arc<Mutex<VaultAccount>>>,
    exchange: Arc<Mutex<E>>,
    db: Option<VaultDB>,
    clock: Arc<dyn Clock>,
    params: VaultParams,
    sinks: RwLock<Vec<EventSink>>,
    history: Mutex<VecDeque<VaultEvent>>,
    nonces: DashMap<Pubkey, u64>,
}

impl<E> VaultRegistry<E>
where
    E: MarginExchange + Clone + Serialize + DeserializeOwned,
{
    /// A registry with no persistence.
    pub fn in_memory(exchange: E, clock: Arc<dyn Clock>, params: VaultParams) -> Self {
        Self {
            vaults: DashMap::new(),
            exchange: Arc::new(Mutex::new(exchange)),
            db: None,
            clock,
            params,
            sinks: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(EVENT_HISTORY)),
            nonces: DashMap::new(),
        }
    }

    /// A registry backed by `db`, loaded with every vault stored there.
    ///
    /// The venue snapshot stored in `db` replaces `exchange` when there is
    /// one; `exchange` only seeds a fresh database.
    pub fn open(
        db: VaultDB,
        exchange: E,
        clock: Arc<dyn Clock>,
        params: VaultParams,
    ) -> RegistryResult<Self> {
        let exchange = match db.load_venue::<E>()? {
            Some(stored) => {
                info!("venue restored from disk");
                stored
            }
            None => exchange,
        };
        let mut registry = Self::in_memory(exchange, clock, params);
        let stored: Vec<(String, VaultAccount)> = db.load_all()?;
        for (name, mut vault) in stored {
            let claims = db.load_claims(&name)?;
            vault.ledger_mut().attach_claims(claims);
            if !vault.ledger().is_conserved() {
                warn!(vault = %name, "stored claims do not sum to claim supply");
            }
            registry
                .vaults
                .insert(name, Arc::new(Mutex::new(vault)));
        }
        info!(vaults = registry.vaults.len(), "vault registry loaded");
        registry.db = Some(db);
        Ok(registry)
    }

    // -- Plumbing -----------------------------------------------------------

    pub fn params(&self) -> &VaultParams {
        &self.params
    }

    pub fn now(&self) -> i64 {
        self.clock.unix_timestamp()
    }

    /// The shared venue. Lock it only while no vault call is in flight on
    /// this thread.
    pub fn exchange(&self) -> &Arc<Mutex<E>> {
        &self.exchange
    }

    /// Registers a callback for every committed event.
    pub fn subscribe(&self, sink: impl Fn(&VaultEvent) + Send + Sync + 'static) {
        self.sinks.write().push(Box::new(sink));
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<VaultEvent> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    fn slot(&self, name: &str) -> RegistryResult<Arc<Mutex<VaultAccount>>> {
        self.vaults
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::VaultNotFound(name.to_string()))
    }

    fn persist(&self, vault: &VaultAccount, venue: Option<&E>) -> RegistryResult<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let claims = vault.ledger().dirty_claims();
        match venue {
            Some(venue) => db.commit_with_venue(&vault.name, vault, &claims, venue)?,
            None => db.commit(&vault.name, vault, &claims)?,
        };
        Ok(())
    }

    fn emit(&self, event: VaultEvent) {
        for sink in self.sinks.read().iter() {
            sink(&event);
        }
        let mut history = self.history.lock();
        if history.len() == EVENT_HISTORY {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Runs an operation that does not touch the venue.
    fn execute<T>(
        &self,
        name: &str,
        operation: Operation,
        f: impl FnOnce(&mut VaultAccount, &E, i64) -> Result<(T, VaultEventKind), VaultError>,
    ) -> RegistryResult<T> {
        let slot = self.slot(name)?;
        let mut vault = slot.lock();
        let now = self.now();

        let mut draft = vault.clone();
        draft.ledger_mut().clear_dirty();
        let (value, kind) = {
            let exchange = self.exchange.lock();
            f(&mut draft, &*exchange, now)?
        };

        self.persist(&draft, None)?;
        draft.ledger_mut().clear_dirty();
        *vault = draft;
        drop(vault);

        info!(vault = name, %operation, "operation committed");
        self.emit(VaultEvent::new(name, now, kind));
        Ok(value)
    }

    /// Runs an operation that mutates the venue. The venue is staged on a
    /// copy and swapped in together with the vault.
    fn execute_with_venue<T>(
        &self,
        name: &str,
        operation: Operation,
        f: impl FnOnce(&mut VaultAccount, &mut E, i64) -> Result<(T, VaultEventKind), VaultError>,
    ) -> RegistryResult<T> {
        let slot = self.slot(name)?;
        let mut vault = slot.lock();
        let mut exchange = self.exchange.lock();
        let now = self.now();

        let mut draft = vault.clone();
        draft.ledger_mut().clear_dirty();
        let mut venue = exchange.clone();
        let (value, kind) = f(&mut draft, &mut venue, now)?;

        self.persist(&draft, Some(&venue))?;
        draft.ledger_mut().clear_dirty();
        *exchange = venue;
        *vault = draft;
        drop(exchange);
        drop(vault);

        info!(vault = name, %operation, "operation committed");
        self.emit(VaultEvent::new(name, now, kind));
        Ok(value)
    }

    /// Runs `f` on a copy of the venue, stores the copy, then swaps it in.
    /// For venue administration outside any vault call, such as listing
    /// markets.
    pub fn with_venue<T>(
        &self,
        f: impl FnOnce(&mut E) -> Result<T, ExchangeError>,
    ) -> RegistryResult<T> {
        let mut exchange = self.exchange.lock();
        let mut venue = exchange.clone();
        let value = f(&mut venue).map_err(VaultError::CpiFailure)?;
        if let Some(db) = &self.db {
            db.store_venue(&venue)?;
        }
        *exchange = venue;
        Ok(value)
    }

    /// Admits `nonce` from `signer` if it is above the last one accepted,
    /// and records it. A nonce is spent even if the call it came with fails.
    pub fn accept_nonce(&self, signer: &Pubkey, nonce: u64) -> RegistryResult<()> {
        let entry = self.nonces.entry(*signer);
        let last = match &entry {
            Entry::Occupied(seen) => Some(*seen.get()),
            Entry::Vacant(_) => match &self.db {
                Some(db) => db.last_nonce(signer)?,
                None => None,
            },
        };
        if let Some(last) = last {
            if nonce <= last {
                warn!(%signer, nonce, last, "rejected replayed or stale nonce");
                return Err(RegistryError::StaleNonce {
                    signer: *signer,
                    nonce,
                    last,
                });
            }
        }
        if let Some(db) = &self.db {
            db.record_nonce(signer, nonce)?;
        }
        match entry {
            Entry::Occupied(mut seen) => {
                seen.insert(nonce);
            }
            Entry::Vacant(slot) => {
                slot.insert(nonce);
            }
        }
        Ok(())
    }

    // -- Setup --------------------------------------------------------------

    /// Creates vault `name`. Exactly one of any number of racing calls for
    /// the same name succeeds; the rest get `AlreadyInitialized`.
    pub fn initialize(
        &self,
        name: &str,
        epoch: EpochTimes,
        admin: Pubkey,
    ) -> RegistryResult<VaultSummary> {
        let now = self.now();
        let summary = match self.vaults.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(VaultError::AlreadyInitialized(format!("vault {name}")).into());
            }
            Entry::Vacant(slot) => {
                let vault = VaultAccount::initialize(name, epoch, admin, &self.params, now)?;
                self.persist(&vault, None)?;
                let summary = vault.summary(now);
                slot.insert(Arc::new(Mutex::new(vault)));
                summary
            }
        };

        info!(vault = name, %admin, start = epoch.start_epoch, "vault initialized");
        self.emit(VaultEvent::new(
            name,
            now,
            VaultEventKind::Initialized { admin, epoch },
        ));
        Ok(summary)
    }

    pub fn init_margin_account(&self, name: &str, signer: &Pubkey) -> RegistryResult<Pubkey> {
        self.execute_with_venue(name, Operation::InitMarginAccount, |v, ex, now| {
            let margin_account = v.init_margin_account(ex, signer, now)?;
            Ok((
                margin_account,
                VaultEventKind::MarginAccountInitialized { margin_account },
            ))
        })
    }

    pub fn init_open_orders(
        &self,
        name: &str,
        signer: &Pubkey,
        market: Pubkey,
    ) -> RegistryResult<Pubkey> {
        self.execute_with_venue(name, Operation::InitOpenOrders, |v, ex, now| {
            let open_orders = v.init_open_orders(ex, signer, market, now)?;
            Ok((
                open_orders,
                VaultEventKind::OpenOrdersInitialized {
                    market,
                    open_orders,
                },
            ))
        })
    }

    // -- Depositors ---------------------------------------------------------

    /// Deposits `amount` for `depositor`. Returns the claims minted.
    pub fn deposit(&self, name: &str, depositor: &Pubkey, amount: u64) -> RegistryResult<u64> {
        self.execute(name, Operation::Deposit, |v, _, now| {
            let minted = v.deposit(*depositor, amount, now)?;
            Ok((
                minted,
                VaultEventKind::Deposited {
                    depositor: *depositor,
                    amount,
                },
            ))
        })
    }

    /// Redeems `claim_amount` of `depositor`'s claims. Returns the payout.
    pub fn redeem(&self, name: &str, depositor: &Pubkey, claim_amount: u64) -> RegistryResult<u64> {
        self.execute(name, Operation::Redeem, |v, ex, now| {
            let payout = v.redeem(ex, *depositor, claim_amount, now)?;
            Ok((
                payout,
                VaultEventKind::Redeemed {
                    depositor: *depositor,
                    claims_burned: claim_amount,
                    payout,
                },
            ))
        })
    }

    // -- Admin --------------------------------------------------------------

    pub fn deposit_to_margin(&self, name: &str, signer: &Pubkey, amount: u64) -> RegistryResult<()> {
        self.execute_with_venue(name, Operation::DepositToMargin, |v, ex, now| {
            v.deposit_to_margin(ex, signer, amount, now)?;
            Ok(((), VaultEventKind::MarginDeposited { amount }))
        })
    }

    /// Moves the whole pool to margin. Returns the amount moved.
    pub fn open_margin_position(&self, name: &str, signer: &Pubkey) -> RegistryResult<u64> {
        self.execute_with_venue(name, Operation::OpenMarginPosition, |v, ex, now| {
            let amount = v.open_margin_position(ex, signer, now)?;
            Ok((amount, VaultEventKind::MarginPositionOpened { amount }))
        })
    }

    /// Places the auction order. Returns the venue order id and the derived
    /// size in lots.
    pub fn place_order(
        &self,
        name: &str,
        signer: &Pubkey,
        order: AuctionOrder,
    ) -> RegistryResult<(OrderId, u64)> {
        self.execute_with_venue(name, Operation::PlaceOrder, |v, ex, now| {
            let (order_id, size) = v.place_auction_order(ex, signer, order, now)?;
            Ok((
                (order_id, size),
                VaultEventKind::OrderPlaced {
                    market: order.market,
                    order_id,
                    price: order.price,
                    size,
                    side: order.side,
                },
            ))
        })
    }

    pub fn cancel_order(
        &self,
        name: &str,
        signer: &Pubkey,
        market: &Pubkey,
        side: Side,
        order_id: OrderId,
    ) -> RegistryResult<()> {
        self.execute_with_venue(name, Operation::CancelOrder, |v, ex, now| {
            v.cancel_auction_order(ex, signer, market, side, order_id, now)?;
            Ok((
                (),
                VaultEventKind::OrderCancelled {
                    market: *market,
                    order_id,
                },
            ))
        })
    }

    pub fn withdraw_from_margin(
        &self,
        name: &str,
        signer: &Pubkey,
        amount: u64,
    ) -> RegistryResult<()> {
        self.execute_with_venue(name, Operation::WithdrawFromMargin, |v, ex, now| {
            v.withdraw_from_margin(ex, signer, amount, now)?;
            Ok(((), VaultEventKind::MarginWithdrawn { amount }))
        })
    }

    /// Brings the whole margin balance home. Returns the amount.
    pub fn close_margin_position(&self, name: &str, signer: &Pubkey) -> RegistryResult<u64> {
        self.execute_with_venue(name, Operation::CloseMarginPosition, |v, ex, now| {
            let amount = v.close_margin_position(ex, signer, now)?;
            Ok((amount, VaultEventKind::MarginPositionClosed { amount }))
        })
    }

    /// Sweeps residual collateral to `destination`. Returns the amount.
    pub fn drain_residual(
        &self,
        name: &str,
        signer: &Pubkey,
        destination: &Pubkey,
    ) -> RegistryResult<u64> {
        self.execute(name, Operation::DrainResidual, |v, _, now| {
            let amount = v.drain_residual(signer, destination, now)?;
            Ok((
                amount,
                VaultEventKind::ResidualDrained {
                    destination: *destination,
                    amount,
                },
            ))
        })
    }

    pub fn rollover(
        &self,
        name: &str,
        signer: &Pubkey,
        new_cadence: Option<i64>,
    ) -> RegistryResult<EpochTimes> {
        self.execute(name, Operation::Rollover, |v, _, now| {
            let epoch = v.rollover(signer, new_cadence, now)?;
            Ok((
                epoch,
                VaultEventKind::RolledOver {
                    epoch_index: v.epoch_index,
                    epoch,
                },
            ))
        })
    }

    // -- Reads --------------------------------------------------------------

    pub fn contains(&self, name: &str) -> bool {
        self.vaults.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    /// A snapshot of vault `name`.
    pub fn vault(&self, name: &str) -> RegistryResult<VaultAccount> {
        Ok(self.slot(name)?.lock().clone())
    }

    pub fn summary(&self, name: &str) -> RegistryResult<VaultSummary> {
        let now = self.now();
        Ok(self.slot(name)?.lock().summary(now))
    }

    /// Summaries of every vault, ordered by name.
    pub fn list(&self) -> Vec<VaultSummary> {
        let now = self.now();
        let slots: Vec<_> = self
            .vaults
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut out: Vec<_> = slots.iter().map(|s| s.lock().summary(now)).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn claim(&self, name: &str, owner: &Pubkey) -> RegistryResult<Option<UserClaim>> {
        Ok(self.slot(name)?.lock().claim_of(owner).cloned())
    }

    pub fn redemption_quote(&self, name: &str, claim_amount: u64) -> RegistryResult<u64> {
        Ok(self.slot(name)?.lock().redemption_quote(claim_amount)?)
    }

    /// Pooled collateral and claim supply summed over every vault.
    pub fn totals(&self) -> (u64, u64) {
        let slots: Vec<_> = self
            .vaults
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        slots.iter().fold((0u64, 0u64), |(c, s), slot| {
            let v = slot.lock();
            (
                c.saturating_add(v.collateral_balance()),
                s.saturating_add(v.claim_supply()),
            )
        })
    }
}
