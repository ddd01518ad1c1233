//! End-to-end tests for the protocol primitives.
//!
//! These drive a claim ledger through one full epoch against the simulated
//! venue without the vault program on top: fund, move the pool to margin,
//! sell a put, settle, bring the margin home, redeem, persist, reload.
//! They prove the pieces compose: the epoch gate, ledger arithmetic, venue
//! margin accounting, and sled persistence.

use strata_protocol::config::{
    CLAIM_MINT_SEED, COLLATERAL_SEED, POSITION_MULTIPLIER, PROGRAM_ID_SEED,
};
use strata_protocol::crypto::{derive_address, program_id, Keypair, Pubkey};
use strata_protocol::epoch::{EpochTimes, ManualClock, Clock, Operation, Phase};
use strata_protocol::exchange::{
    MarginAccounts, MarginExchange, OptionKind, OrderAccounts, Side, SimulatedExchange,
};
use strata_protocol::ledger::{RedeemableLedger, UserClaim};
use strata_protocol::storage::VaultDB;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const USDC: u64 = 1_000_000;
const STRIKE: u64 = 100 * USDC;

struct Setup {
    clock: ManualClock,
    times: EpochTimes,
    ledger: RedeemableLedger,
    venue: SimulatedExchange,
    margin: MarginAccounts,
    orders: OrderAccounts,
}

fn setup() -> Setup {
    let program = program_id(PROGRAM_ID_SEED);
    let vault = derive_address(&[b"sol_put"], &program);
    let pool = derive_address(&[b"sol_put", COLLATERAL_SEED], &program);

    let mut venue = SimulatedExchange::new();
    let market = venue.list_market(OptionKind::Put, STRIKE, 15);
    let margin = MarginAccounts::derive(vault, pool, venue.group(), &venue.program_id());
    let orders = OrderAccounts::derive(vault, margin.margin_account, market, &venue.program_id());
    venue.initialize_margin_account(&margin).unwrap();
    venue.initialize_open_orders(&orders).unwrap();

    Setup {
        clock: ManualClock::new(0),
        times: EpochTimes::new(0, 10, 12, 15, 18, 20, 40).unwrap(),
        ledger: RedeemableLedger::new(),
        venue,
        margin,
        orders,
    }
}

fn gate(s: &Setup, op: Operation) -> Phase {
    let phase = s.times.phase_at(s.clock.unix_timestamp());
    assert!(op.is_permitted(phase), "{op} not permitted in {phase}");
    phase
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn full_epoch_with_premium_is_shared_pro_rata() {
    let mut s = setup();
    let alice = Keypair::from_seed(&[1u8; 32]).pubkey();
    let bob = Keypair::from_seed(&[2u8; 32]).pubkey();

    // Funding.
    s.clock.set(5);
    gate(&s, Operation::Deposit);
    s.ledger.mint(alice, 100 * USDC).unwrap();
    s.ledger.mint(bob, 300 * USDC).unwrap();

    // Pool to margin before the auction.
    s.clock.set(11);
    gate(&s, Operation::OpenMarginPosition);
    let pool = s.ledger.collateral_balance();
    s.ledger.withdraw_collateral(pool).unwrap();
    s.venue.deposit(&s.margin, pool).unwrap();

    // Sell 4 puts at 2 USDC, sized off the margin balance.
    s.clock.set(13);
    gate(&s, Operation::PlaceOrder);
    let balance = s.venue.margin_state(&s.margin.margin_account).unwrap().balance;
    let size = balance * POSITION_MULTIPLIER / STRIKE;
    assert_eq!(size, 4_000);
    let id = s
        .venue
        .place_order(&s.orders, 2 * USDC, size, Side::Ask, None)
        .unwrap();
    s.venue.fill_order(id, size).unwrap();

    // Expires out of the money; the premium stays.
    s.venue.expire_market(&s.orders.market, 120 * USDC).unwrap();

    s.clock.set(18);
    gate(&s, Operation::CloseMarginPosition);
    let back = s.venue.margin_state(&s.margin.margin_account).unwrap().balance;
    assert_eq!(back, 408 * USDC);
    s.venue.withdraw(&s.margin, back).unwrap();
    s.ledger.return_collateral(back).unwrap();

    gate(&s, Operation::Redeem);
    assert_eq!(s.ledger.burn(&alice, 100 * USDC).unwrap(), 102 * USDC);
    assert_eq!(s.ledger.burn(&bob, 300 * USDC).unwrap(), 306 * USDC);
    assert_eq!(s.ledger.collateral_balance(), 0);
    assert!(s.ledger.is_conserved());
}

#[test]
fn assigned_put_loss_is_shared_pro_rata() {
    let mut s = setup();
    let alice = Pubkey::new([1u8; 32]);
    let bob = Pubkey::new([2u8; 32]);

    s.ledger.mint(alice, 100 * USDC).unwrap();
    s.ledger.mint(bob, 100 * USDC).unwrap();
    s.ledger.withdraw_collateral(200 * USDC).unwrap();
    s.venue.deposit(&s.margin, 200 * USDC).unwrap();

    let id = s
        .venue
        .place_order(&s.orders, 5 * USDC, 2_000, Side::Ask, None)
        .unwrap();
    s.venue.fill_order(id, 2_000).unwrap();
    // Settles 30 USDC below strike: 2 contracts pay 60, premium was 10.
    s.venue.expire_market(&s.orders.market, 70 * USDC).unwrap();

    let back = s.venue.margin_state(&s.margin.margin_account).unwrap().balance;
    assert_eq!(back, 150 * USDC);
    s.venue.withdraw(&s.margin, back).unwrap();
    s.ledger.return_collateral(back).unwrap();

    assert_eq!(s.ledger.quote(100 * USDC).unwrap(), 75 * USDC);
    assert_eq!(s.ledger.burn(&alice, 100 * USDC).unwrap(), 75 * USDC);
    assert_eq!(s.ledger.burn(&bob, 100 * USDC).unwrap(), 75 * USDC);
}

#[test]
fn ledger_survives_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let alice = Pubkey::new([1u8; 32]);
    let bob = Pubkey::new([2u8; 32]);

    {
        let db = VaultDB::open(dir.path()).unwrap();
        let mut ledger = RedeemableLedger::new();
        ledger.mint(alice, 10).unwrap();
        ledger.mint(bob, 30).unwrap();
        db.commit("sol_put", &ledger, &ledger.dirty_claims()).unwrap();
        ledger.clear_dirty();

        ledger.burn(&bob, 5).unwrap();
        db.commit("sol_put", &ledger, &ledger.dirty_claims()).unwrap();
    }

    let db = VaultDB::open(dir.path()).unwrap();
    let mut ledger: RedeemableLedger = db.load_vault("sol_put").unwrap().unwrap();
    let claims: Vec<UserClaim> = db.load_claims("sol_put").unwrap();
    ledger.attach_claims(claims);

    assert_eq!(ledger.claim_supply(), 35);
    assert_eq!(ledger.collateral_balance(), 35);
    assert_eq!(ledger.balance_of(&bob), 25);
    assert!(ledger.is_conserved());
    assert_eq!(db.commit_seq().unwrap(), 2);
}

#[test]
fn vault_addresses_are_recomputable_from_the_name() {
    let program = program_id(PROGRAM_ID_SEED);
    let mint_a = derive_address(&[b"sol_put", CLAIM_MINT_SEED], &program);
    let mint_b = derive_address(&[b"sol_put", CLAIM_MINT_SEED], &program);
    let other = derive_address(&[b"eth_put", CLAIM_MINT_SEED], &program);
    assert_eq!(mint_a, mint_b);
    assert_ne!(mint_a, other);
}
