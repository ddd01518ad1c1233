//! Registry-level tests: concurrency, persistence, atomic abort, events.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_contracts::{RegistryError, VaultError, VaultEventKind, VaultRegistry};
use strata_protocol::config::VaultParams;
use strata_protocol::crypto::Pubkey;
use strata_protocol::epoch::{EpochTimes, ManualClock};
use strata_protocol::exchange::{MarginExchange, OptionKind, SimulatedExchange};
use strata_protocol::storage::VaultDB;

const VAULT: &str = "sol_put";

fn admin() -> Pubkey {
    Pubkey::new([0xAA; 32])
}

fn depositor(i: u8) -> Pubkey {
    Pubkey::new([i; 32])
}

fn times() -> EpochTimes {
    EpochTimes::new(0, 10, 12, 15, 18, 20, 40).unwrap()
}

fn registry_with(
    db: Option<VaultDB>,
    clock: Arc<ManualClock>,
) -> VaultRegistry<SimulatedExchange> {
    match db {
        Some(db) => VaultRegistry::open(db, SimulatedExchange::new(), clock, VaultParams::default())
            .unwrap(),
        None => VaultRegistry::in_memory(SimulatedExchange::new(), clock, VaultParams::default()),
    }
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn racing_initializers_exactly_one_wins() {
    let registry = registry_with(None, Arc::new(ManualClock::new(0)));

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let registry = &registry;
                s.spawn(move || registry.initialize(VAULT, times(), depositor(i + 1)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(
            err.vault_error(),
            Some(VaultError::AlreadyInitialized(_))
        ));
    }
    assert_eq!(registry.len(), 1);
}

#[test]
fn concurrent_deposits_conserve_supply() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry_with(None, clock.clone());
    registry.initialize(VAULT, times(), admin()).unwrap();
    clock.set(5);

    std::thread::scope(|s| {
        for i in 0..8u8 {
            let registry = &registry;
            s.spawn(move || {
                for _ in 0..50 {
                    registry.deposit(VAULT, &depositor(i + 1), 3).unwrap();
                }
            });
        }
    });

    let vault = registry.vault(VAULT).unwrap();
    assert_eq!(vault.claim_supply(), 8 * 50 * 3);
    assert_eq!(vault.collateral_balance(), 8 * 50 * 3);
    assert!(vault.ledger().is_conserved());
    assert_eq!(vault.ledger().holder_count(), 8);
}

#[test]
fn vaults_are_independent() {
    let clock = Arc::new(ManualClock::new(5));
    let registry = registry_with(None, clock);
    registry.initialize("a", times(), admin()).unwrap();
    registry.initialize("b", times(), admin()).unwrap();

    registry.deposit("a", &depositor(1), 100).unwrap();
    assert_eq!(registry.summary("a").unwrap().claim_supply, 100);
    assert_eq!(registry.summary("b").unwrap().claim_supply, 0);
    assert_eq!(registry.totals(), (100, 100));

    let names: Vec<_> = registry.list().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn unknown_vault() {
    let registry = registry_with(None, Arc::new(ManualClock::new(5)));
    assert!(matches!(
        registry.deposit("nope", &depositor(1), 1),
        Err(RegistryError::VaultNotFound(name)) if name == "nope"
    ));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));

    {
        let registry = registry_with(Some(VaultDB::open(dir.path()).unwrap()), clock.clone());
        registry.initialize(VAULT, times(), admin()).unwrap();
        clock.set(5);
        registry.deposit(VAULT, &depositor(1), 10_000_000).unwrap();
        registry.deposit(VAULT, &depositor(2), 420_000_000).unwrap();
    }

    let registry = registry_with(Some(VaultDB::open(dir.path()).unwrap()), clock.clone());
    assert!(registry.contains(VAULT));
    let s = registry.summary(VAULT).unwrap();
    assert_eq!(s.collateral_balance, 430_000_000);
    assert_eq!(s.claim_supply, 430_000_000);
    assert_eq!(s.holders, 2);
    assert_eq!(
        registry.claim(VAULT, &depositor(2)).unwrap().unwrap().balance,
        420_000_000
    );

    // The reloaded vault keeps working.
    clock.set(19);
    assert_eq!(registry.redeem(VAULT, &depositor(1), 2_000_000).unwrap(), 2_000_000);
    assert!(registry.vault(VAULT).unwrap().ledger().is_conserved());
}

#[test]
fn rejected_operation_writes_nothing() {
    let db = VaultDB::open_temporary().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry_with(Some(db.clone()), clock.clone());
    registry.initialize(VAULT, times(), admin()).unwrap();
    let seq = db.commit_seq().unwrap();

    clock.set(12);
    assert!(registry.deposit(VAULT, &depositor(1), 5).is_err());
    assert_eq!(db.commit_seq().unwrap(), seq);
    assert_eq!(db.claim_count(), 0);

    clock.set(5);
    registry.deposit(VAULT, &depositor(1), 5).unwrap();
    assert_eq!(db.commit_seq().unwrap(), seq + 1);
    assert_eq!(db.load_claim(VAULT, &depositor(1)).unwrap().unwrap().balance, 5);
}

#[test]
fn margin_collateral_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));

    let margin = {
        let registry = registry_with(Some(VaultDB::open(dir.path()).unwrap()), clock.clone());
        registry.initialize(VAULT, times(), admin()).unwrap();
        let margin = registry.init_margin_account(VAULT, &admin()).unwrap();
        clock.set(5);
        registry.deposit(VAULT, &depositor(1), 100).unwrap();
        clock.set(11);
        assert_eq!(registry.open_margin_position(VAULT, &admin()).unwrap(), 100);
        margin
    };

    let registry = registry_with(Some(VaultDB::open(dir.path()).unwrap()), clock.clone());
    assert_eq!(
        registry.exchange().lock().margin_state(&margin).unwrap().balance,
        100
    );
    assert!(matches!(
        registry
            .init_margin_account(VAULT, &admin())
            .unwrap_err()
            .vault_error(),
        Some(VaultError::AlreadyInitialized(_))
    ));

    clock.set(18);
    assert_eq!(registry.close_margin_position(VAULT, &admin()).unwrap(), 100);
    clock.set(19);
    assert_eq!(registry.redeem(VAULT, &depositor(1), 100).unwrap(), 100);
    assert_eq!(registry.summary(VAULT).unwrap().collateral_balance, 0);
}

#[test]
fn venue_administration_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));

    let market = {
        let registry = registry_with(Some(VaultDB::open(dir.path()).unwrap()), clock.clone());
        registry
            .with_venue(|venue| Ok(venue.list_market(OptionKind::Put, 100_000_000, 15)))
            .unwrap()
    };

    let registry = registry_with(Some(VaultDB::open(dir.path()).unwrap()), clock);
    let venue = registry.exchange().lock();
    assert_eq!(venue.find_market(OptionKind::Put, 100_000_000, 15), Some(market));
    assert_eq!(venue.markets().len(), 1);
}

// ---------------------------------------------------------------------------
// Nonces
// ---------------------------------------------------------------------------

#[test]
fn nonces_must_increase_per_signer() {
    let registry = registry_with(None, Arc::new(ManualClock::new(0)));
    registry.accept_nonce(&depositor(1), 1).unwrap();
    registry.accept_nonce(&depositor(1), 5).unwrap();

    let err = registry.accept_nonce(&depositor(1), 5).unwrap_err();
    assert!(matches!(
        err,
        RegistryError::StaleNonce {
            nonce: 5,
            last: 5,
            ..
        }
    ));
    assert!(registry.accept_nonce(&depositor(1), 3).is_err());

    // Another signer has its own sequence.
    registry.accept_nonce(&depositor(2), 1).unwrap();
}

#[test]
fn nonces_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    {
        let registry = registry_with(Some(VaultDB::open(dir.path()).unwrap()), clock.clone());
        registry.accept_nonce(&admin(), 42).unwrap();
    }

    let registry = registry_with(Some(VaultDB::open(dir.path()).unwrap()), clock);
    assert!(matches!(
        registry.accept_nonce(&admin(), 42),
        Err(RegistryError::StaleNonce { last: 42, .. })
    ));
    registry.accept_nonce(&admin(), 43).unwrap();
}

// ---------------------------------------------------------------------------
// Venue failure
// ---------------------------------------------------------------------------

#[test]
fn venue_failure_rolls_back_everything() {
    let db = VaultDB::open_temporary().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry_with(Some(db.clone()), clock.clone());
    registry.initialize(VAULT, times(), admin()).unwrap();
    let margin = registry.init_margin_account(VAULT, &admin()).unwrap();

    clock.set(5);
    registry.deposit(VAULT, &depositor(1), 1_000).unwrap();
    let before = registry.summary(VAULT).unwrap();
    let seq = db.commit_seq().unwrap();

    clock.set(11);
    registry.exchange().lock().fail_next_call("venue halted");
    let err = registry.open_margin_position(VAULT, &admin()).unwrap_err();
    assert!(matches!(err.vault_error(), Some(VaultError::CpiFailure(_))));

    assert_eq!(registry.summary(VAULT).unwrap(), before);
    assert_eq!(db.commit_seq().unwrap(), seq);
    assert_eq!(
        registry.exchange().lock().margin_state(&margin).unwrap().balance,
        0
    );

    // The injected failure was consumed, so a retry goes through.
    assert_eq!(registry.open_margin_position(VAULT, &admin()).unwrap(), 1_000);
    assert_eq!(
        registry.exchange().lock().margin_state(&margin).unwrap().balance,
        1_000
    );
}

#[test]
fn failed_margin_init_can_be_retried() {
    let registry = registry_with(None, Arc::new(ManualClock::new(0)));
    registry.initialize(VAULT, times(), admin()).unwrap();

    registry.exchange().lock().fail_next_call("busy");
    assert!(registry.init_margin_account(VAULT, &admin()).is_err());
    assert_eq!(registry.summary(VAULT).unwrap().margin_account, None);

    let margin = registry.init_margin_account(VAULT, &admin()).unwrap();
    assert_eq!(registry.summary(VAULT).unwrap().margin_account, Some(margin));
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[test]
fn subscribers_see_committed_operations_only() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry_with(None, clock.clone());
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    registry.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    registry.initialize(VAULT, times(), admin()).unwrap();
    clock.set(5);
    registry.deposit(VAULT, &depositor(1), 7).unwrap();
    assert!(registry.deposit(VAULT, &depositor(1), 0).is_err());
    assert!(registry.rollover(VAULT, &admin(), None).is_err());

    assert_eq!(seen.load(Ordering::SeqCst), 2);

    let events = registry.recent_events(10);
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0].kind, VaultEventKind::Initialized { .. }));
    assert_eq!(
        events[1].kind,
        VaultEventKind::Deposited {
            depositor: depositor(1),
            amount: 7
        }
    );
    assert_eq!(events[1].vault, VAULT);
    assert_eq!(events[1].timestamp.timestamp(), 5);
}

#[test]
fn recent_events_returns_newest_tail() {
    let registry = registry_with(None, Arc::new(ManualClock::new(5)));
    registry.initialize(VAULT, times(), admin()).unwrap();
    for amount in 1..=5 {
        registry.deposit(VAULT, &depositor(1), amount).unwrap();
    }
    let tail = registry.recent_events(2);
    let amounts: Vec<_> = tail
        .iter()
        .map(|e| match e.kind {
            VaultEventKind::Deposited { amount, .. } => amount,
            _ => 0,
        })
        .collect();
    assert_eq!(amounts, vec![4, 5]);
}
