//! # Vault Events
//!
//! One event per committed operation. Rejected operations emit nothing.
//! The node forwards these to WebSocket subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use strata_protocol::crypto::Pubkey;
use strata_protocol::epoch::EpochTimes;
use strata_protocol::exchange::{OrderId, Side};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultEventKind {
    Initialized {
        admin: Pubkey,
        epoch: EpochTimes,
    },
    MarginAccountInitialized {
        margin_account: Pubkey,
    },
    Deposited {
        depositor: Pubkey,
        amount: u64,
    },
    MarginDeposited {
        amount: u64,
    },
    MarginPositionOpened {
        amount: u64,
    },
    OpenOrdersInitialized {
        market: Pubkey,
        open_orders: Pubkey,
    },
    OrderPlaced {
        market: Pubkey,
        order_id: OrderId,
        price: u64,
        size: u64,
        side: Side,
    },
    OrderCancelled {
        market: Pubkey,
        order_id: OrderId,
    },
    MarginWithdrawn {
        amount: u64,
    },
    MarginPositionClosed {
        amount: u64,
    },
    Redeemed {
        depositor: Pubkey,
        claims_burned: u64,
        payout: u64,
    },
    ResidualDrained {
        destination: Pubkey,
        amount: u64,
    },
    RolledOver {
        epoch_index: u64,
        epoch: EpochTimes,
    },
}

/// A committed vault operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultEvent {
    pub event_id: Uuid,
    pub vault: String,
    /// Vault clock time of the operation.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: VaultEventKind,
}

impl VaultEvent {
    pub fn new(vault: &str, now: i64, kind: VaultEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            vault: vault.to_string(),
            timestamp: DateTime::from_timestamp(now, 0).unwrap_or_else(Utc::now),
            kind,
        }
    }
}
