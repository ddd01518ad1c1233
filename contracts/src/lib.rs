// Copyright (c) 2026 Strata Contributors. MIT License.
// See LICENSE for details.

//! # Strata Vault Program
//!
//! The logic that turns the primitives in `strata-protocol` into running
//! vaults:
//!
//! - **Vault**: the per-vault aggregate: deposits, redemptions, margin and
//!   auction-order management, residual drains.
//! - **Lifecycle**: rolling a stale vault into its next epoch.
//! - **Registry**: named vaults with atomic, persisted operations.
//! - **Events**: a record of every committed operation.
//!
//! ## Design Principles
//!
//! 1. Every operation is all-or-nothing. A vault is never left with a
//!    balance updated and the matching transfer missing.
//! 2. Phase checks go through one admission table, never ad-hoc time
//!    comparisons.
//! 3. Money arithmetic is checked; pro-rata math widens to `u128`.
//! 4. Every public type is serializable (serde) for the API and for disk.

pub mod events;
pub mod lifecycle;
pub mod registry;
pub mod vault;

pub use events::{VaultEvent, VaultEventKind};
pub use registry::{RegistryError, RegistryResult, VaultRegistry};
pub use vault::{AuctionOrder, VaultAccount, VaultError, VaultResult, VaultSummary};
