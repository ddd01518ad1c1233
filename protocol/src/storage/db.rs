//! # VaultDB Persistent Storage
//!
//! Vault state on disk, built on sled's embedded key-value store.
//!
//! ## Tree Layout
//!
//! | Tree       | Key                           | Value                |
//! |------------|-------------------------------|----------------------|
//! | `vaults`   | `name` (UTF-8)                | `bincode(vault)`     |
//! | `claims`   | `name` ‖ `0x00` ‖ `owner` (32B) | `bincode(UserClaim)` |
//! | `venue`    | `state`                       | `bincode(venue)`     |
//! | `metadata` | key (UTF-8)                   | value (bytes)        |
//!
//! Vault names are printable ASCII, so the `0x00` separator makes
//! `name ‖ 0x00` an exact prefix for one vault's claims.
//!
//! The vault record type is a parameter: this crate stores whatever the
//! vault program hands it, as long as it is serde-serializable.
//!
//! ## Atomicity
//!
//! [`VaultDB::commit`] writes a vault record and every claim record an
//! operation touched in one multi-tree sled transaction. A crash or error
//! leaves either the old state or the new state on disk, never a mix.
//! [`VaultDB::commit_with_venue`] adds the venue snapshot to the same
//! transaction, so collateral parked at the venue survives a restart.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use std::path::Path;
use tracing::debug;

use crate::crypto::Pubkey;
use crate::ledger::UserClaim;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt record under key {0}")]
    Corrupt(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

/// Monotonic count of committed operations (8B BE).
const META_COMMIT_SEQ: &[u8] = b"commit_seq";

/// On-disk layout version.
const META_SCHEMA_VERSION: &[u8] = b"schema_version";

const SCHEMA_VERSION: u32 = 2;

/// Prefix of the per-signer request nonces (`nonce:` ‖ signer, 8B BE).
const META_NONCE_PREFIX: &[u8] = b"nonce:";

/// Key of the single venue snapshot.
const VENUE_STATE: &[u8] = b"state";

// ---------------------------------------------------------------------------
// VaultDB
// ---------------------------------------------------------------------------

/// Persistent store for vault records and claim records.
///
/// Cheap to clone; clones share the same sled handle.
#[derive(Debug, Clone)]
pub struct VaultDB {
    db: Db,
    vaults: Tree,
    claims: Tree,
    venue: Tree,
    metadata: Tree,
}

impl VaultDB {
    /// Open or create a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A throwaway database, removed when dropped. For tests.
    pub fn open_temporary() -> DbResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        let vaults = db.open_tree("vaults")?;
        let claims = db.open_tree("claims")?;
        let venue = db.open_tree("venue")?;
        let metadata = db.open_tree("metadata")?;

        if metadata.get(META_SCHEMA_VERSION)?.is_none() {
            metadata.insert(META_SCHEMA_VERSION, SCHEMA_VERSION.to_be_bytes().to_vec())?;
        }

        Ok(Self {
            db,
            vaults,
            claims,
            venue,
            metadata,
        })
    }

    // -- Commit -------------------------------------------------------------

    /// Writes `record` under `name` together with `claims`, atomically.
    ///
    /// Returns the new commit sequence number.
    pub fn commit<V: Serialize>(
        &self,
        name: &str,
        record: &V,
        claims: &[UserClaim],
    ) -> DbResult<u64> {
        self.commit_rows(name, encode(record)?, claims, None)
    }

    /// Like [`commit`](Self::commit), with the venue snapshot written in the
    /// same transaction.
    pub fn commit_with_venue<V: Serialize, S: Serialize>(
        &self,
        name: &str,
        record: &V,
        claims: &[UserClaim],
        venue: &S,
    ) -> DbResult<u64> {
        self.commit_rows(name, encode(record)?, claims, Some(encode(venue)?))
    }

    fn commit_rows(
        &self,
        name: &str,
        record_bytes: Vec<u8>,
        claims: &[UserClaim],
        venue_bytes: Option<Vec<u8>>,
    ) -> DbResult<u64> {
        // Serialize up front: the transaction closure may run more than once.
        let claim_rows = claims
            .iter()
            .map(|c| Ok((claim_key(name, &c.owner), encode(c)?)))
            .collect::<DbResult<Vec<_>>>()?;

        let result: Result<u64, TransactionError<DbError>> = (
            &self.vaults,
            &self.claims,
            &self.venue,
            &self.metadata,
        )
            .transaction(|(vaults, claim_tree, venue, meta)| {
                vaults.insert(name.as_bytes(), record_bytes.as_slice())?;
                for (key, value) in &claim_rows {
                    claim_tree.insert(key.as_slice(), value.as_slice())?;
                }
                if let Some(bytes) = &venue_bytes {
                    venue.insert(VENUE_STATE, bytes.as_slice())?;
                }

                let seq = match meta.get(META_COMMIT_SEQ)? {
                    Some(bytes) => decode_u64(&bytes).ok_or_else(|| {
                        ConflictableTransactionError::Abort(DbError::Corrupt(
                            "commit_seq".to_string(),
                        ))
                    })?,
                    None => 0,
                } + 1;
                meta.insert(META_COMMIT_SEQ, seq.to_be_bytes().to_vec())?;
                Ok(seq)
            });

        let seq = result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => DbError::Sled(e),
        })?;
        self.db.flush()?;
        debug!(
            vault = name,
            claims = claim_rows.len(),
            venue = venue_bytes.is_some(),
            seq,
            "vault committed"
        );
        Ok(seq)
    }

    // -- Venue --------------------------------------------------------------

    /// The last committed venue snapshot, if any.
    pub fn load_venue<S: DeserializeOwned>(&self) -> DbResult<Option<S>> {
        match self.venue.get(VENUE_STATE)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Replaces the venue snapshot outside any vault commit.
    pub fn store_venue<S: Serialize>(&self, venue: &S) -> DbResult<()> {
        self.venue.insert(VENUE_STATE, encode(venue)?)?;
        self.db.flush()?;
        Ok(())
    }

    // -- Vault records ------------------------------------------------------

    pub fn load_vault<V: DeserializeOwned>(&self, name: &str) -> DbResult<Option<V>> {
        match self.vaults.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every stored vault record, ordered by name.
    pub fn load_all<V: DeserializeOwned>(&self) -> DbResult<Vec<(String, V)>> {
        let mut out = Vec::with_capacity(self.vaults.len());
        for entry in self.vaults.iter() {
            let (key, value) = entry?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|_| DbError::Corrupt(hex::encode(&key)))?;
            out.push((name, decode(&value)?));
        }
        Ok(out)
    }

    pub fn contains_vault(&self, name: &str) -> DbResult<bool> {
        Ok(self.vaults.contains_key(name.as_bytes())?)
    }

    // -- Claim records ------------------------------------------------------

    pub fn load_claim(&self, name: &str, owner: &Pubkey) -> DbResult<Option<UserClaim>> {
        match self.claims.get(claim_key(name, owner))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every claim record of vault `name`, ordered by owner.
    pub fn load_claims(&self, name: &str) -> DbResult<Vec<UserClaim>> {
        let mut prefix = name.as_bytes().to_vec();
        prefix.push(0);

        let mut out = Vec::new();
        for entry in self.claims.scan_prefix(prefix) {
            let (_key, value) = entry?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    // -- Metadata -----------------------------------------------------------

    /// Number of commits ever made to this database.
    pub fn commit_seq(&self) -> DbResult<u64> {
        match self.metadata.get(META_COMMIT_SEQ)? {
            Some(bytes) => {
                decode_u64(&bytes).ok_or_else(|| DbError::Corrupt("commit_seq".to_string()))
            }
            None => Ok(0),
        }
    }

    /// Highest request nonce accepted from `signer`.
    pub fn last_nonce(&self, signer: &Pubkey) -> DbResult<Option<u64>> {
        match self.metadata.get(nonce_key(signer))? {
            Some(bytes) => decode_u64(&bytes)
                .map(Some)
                .ok_or_else(|| DbError::Corrupt(format!("nonce for {signer}"))),
            None => Ok(None),
        }
    }

    /// Records `nonce` as the highest accepted from `signer`.
    pub fn record_nonce(&self, signer: &Pubkey, nonce: u64) -> DbResult<()> {
        self.metadata
            .insert(nonce_key(signer), nonce.to_be_bytes().to_vec())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn schema_version(&self) -> DbResult<Option<u32>> {
        match self.metadata.get(META_SCHEMA_VERSION)? {
            Some(bytes) => {
                let arr: [u8; 4] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| DbError::Corrupt("schema_version".to_string()))?;
                Ok(Some(u32::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    // -- Utility ------------------------------------------------------------

    pub fn vault_count(&self) -> usize {
        self.vaults.len()
    }

    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }

    /// Blocks until all pending writes are durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn claim_key(name: &str, owner: &Pubkey) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 1 + 32);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key.extend_from_slice(owner.as_bytes());
    key
}

fn nonce_key(signer: &Pubkey) -> Vec<u8> {
    let mut key = META_NONCE_PREFIX.to_vec();
    key.extend_from_slice(signer.as_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        collateral: u64,
        supply: u64,
    }

    fn claim(byte: u8, balance: u64) -> UserClaim {
        UserClaim {
            owner: Pubkey::new([byte; 32]),
            balance,
            total_deposited: balance,
            total_redeemed: 0,
        }
    }

    #[test]
    fn open_temporary_database() {
        let db = VaultDB::open_temporary().expect("should create temp db");
        assert_eq!(db.vault_count(), 0);
        assert_eq!(db.commit_seq().unwrap(), 0);
        assert_eq!(db.schema_version().unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn commit_writes_vault_and_claims() {
        let db = VaultDB::open_temporary().unwrap();
        let record = Record {
            collateral: 30,
            supply: 30,
        };
        let seq = db
            .commit("sol_put", &record, &[claim(1, 10), claim(2, 20)])
            .unwrap();
        assert_eq!(seq, 1);

        let loaded: Record = db.load_vault("sol_put").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(db.load_claims("sol_put").unwrap().len(), 2);
        assert_eq!(
            db.load_claim("sol_put", &Pubkey::new([2u8; 32]))
                .unwrap()
                .unwrap()
                .balance,
            20
        );
    }

    #[test]
    fn claims_are_scoped_per_vault() {
        let db = VaultDB::open_temporary().unwrap();
        let record = Record {
            collateral: 0,
            supply: 0,
        };
        db.commit("eth", &record, &[claim(1, 5)]).unwrap();
        db.commit("eth_put", &record, &[claim(1, 7), claim(3, 1)])
            .unwrap();

        // "eth" must not pick up "eth_put" claims.
        let eth = db.load_claims("eth").unwrap();
        assert_eq!(eth.len(), 1);
        assert_eq!(eth[0].balance, 5);
        assert_eq!(db.load_claims("eth_put").unwrap().len(), 2);
        assert_eq!(db.commit_seq().unwrap(), 2);
    }

    #[test]
    fn commit_overwrites_claims() {
        let db = VaultDB::open_temporary().unwrap();
        let record = Record {
            collateral: 10,
            supply: 10,
        };
        db.commit("v", &record, &[claim(1, 10)]).unwrap();
        db.commit("v", &record, &[claim(1, 4)]).unwrap();
        assert_eq!(db.claim_count(), 1);
        assert_eq!(db.load_claims("v").unwrap()[0].balance, 4);
    }

    #[test]
    fn load_all_in_name_order() {
        let db = VaultDB::open_temporary().unwrap();
        for (name, c) in [("b", 2u64), ("a", 1), ("c", 3)] {
            db.commit(
                name,
                &Record {
                    collateral: c,
                    supply: c,
                },
                &[],
            )
            .unwrap();
        }
        let all: Vec<(String, Record)> = db.load_all().unwrap();
        let names: Vec<_> = all.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert!(db.contains_vault("a").unwrap());
        assert!(!db.contains_vault("z").unwrap());
    }

    #[test]
    fn venue_snapshot_commits_with_vault() {
        let db = VaultDB::open_temporary().unwrap();
        let record = Record {
            collateral: 0,
            supply: 100,
        };
        assert_eq!(db.load_venue::<Record>().unwrap(), None);

        let venue = Record {
            collateral: 100,
            supply: 0,
        };
        db.commit_with_venue("v", &record, &[claim(1, 100)], &venue)
            .unwrap();
        assert_eq!(db.load_venue::<Record>().unwrap(), Some(venue));

        // A plain commit leaves the snapshot alone.
        db.commit("v", &record, &[]).unwrap();
        assert_eq!(db.load_venue::<Record>().unwrap().unwrap().collateral, 100);
        assert_eq!(db.commit_seq().unwrap(), 2);
    }

    #[test]
    fn nonces_are_tracked_per_signer() {
        let db = VaultDB::open_temporary().unwrap();
        let alice = Pubkey::new([1u8; 32]);
        let bob = Pubkey::new([2u8; 32]);
        assert_eq!(db.last_nonce(&alice).unwrap(), None);
        db.record_nonce(&alice, 7).unwrap();
        assert_eq!(db.last_nonce(&alice).unwrap(), Some(7));
        assert_eq!(db.last_nonce(&bob).unwrap(), None);
    }

    #[test]
    fn reopen_keeps_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = VaultDB::open(dir.path()).unwrap();
            db.commit(
                "v",
                &Record {
                    collateral: 9,
                    supply: 9,
                },
                &[claim(1, 9)],
            )
            .unwrap();
        }
        let db = VaultDB::open(dir.path()).unwrap();
        let loaded: Option<Record> = db.load_vault("v").unwrap();
        assert_eq!(loaded.unwrap().collateral, 9);
        assert_eq!(db.load_claims("v").unwrap().len(), 1);
        assert_eq!(db.commit_seq().unwrap(), 1);
    }
}
