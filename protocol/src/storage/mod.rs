//! # Storage Module
//!
//! Persistent storage for vaults. One record per vault keyed by name, one
//! record per (vault, depositor) claim, and a little metadata. Bincode on
//! disk; JSON is for the API.

pub mod db;

pub use db::{DbError, DbResult, VaultDB};
