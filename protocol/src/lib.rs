// Copyright (c) 2026 Strata Contributors. MIT License.
// See LICENSE for details.

//! # Strata Protocol Core Library
//!
//! Strata runs pooled-capital vaults that cycle through fixed, time-boxed
//! epochs. Depositors swap collateral for claim tokens while the epoch is
//! funding, the vault admin sells a short-dated option on an external
//! derivatives venue during the auction window, and after settlement the
//! claim tokens are redeemed pro-rata against whatever collateral came back.
//!
//! This crate holds the pieces every vault is built from. The vault program
//! itself lives in `strata-contracts`.
//!
//! ## Architecture
//!
//! - **config**: Protocol constants and tunables. Every magic number lives here.
//! - **crypto**: Identities (`Pubkey`, `Keypair`) and derived addresses.
//! - **epoch**: The epoch clock: timestamps, phases, and what each phase allows.
//! - **ledger**: The redeemable claim ledger and its mint/burn arithmetic.
//! - **exchange**: The derivatives-venue interface plus an in-memory venue.
//! - **storage**: sled persistence for vault records and claim records.
//!
//! ## Design Philosophy
//!
//! 1. All amounts are `u64` minor units. No floating point, ever.
//! 2. Every state transition is explicit: enum variants, not boolean flags.
//! 3. Arithmetic that touches money is checked. Overflow is an error, not a wrap.
//! 4. Every public state type is serializable for the wire and for disk.

pub mod config;
pub mod crypto;
pub mod epoch;
pub mod exchange;
pub mod ledger;
pub mod storage;
