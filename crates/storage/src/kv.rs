//! Bucketed durable KV over redb.
//!
//! Four tables back the dispersal protocol:
//! - `fpccs`: object id -> wire-encoded FPCC, pinned once per object
//! - `echo_seen` / `ready_seen`: `"<object>|<peer>"` -> 1, vote evidence
//! - `meta`: object id -> creation time (unix millis), the GC anchor
//!
//! redb gives single-writer transactions; readers may observe pre-commit
//! state, which the protocol tolerates (evidence is advisory).

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;

const FPCCS: TableDefinition<&str, &[u8]> = TableDefinition::new("fpccs");
const ECHO_SEEN: TableDefinition<&str, &[u8]> = TableDefinition::new("echo_seen");
const READY_SEEN: TableDefinition<&str, &[u8]> = TableDefinition::new("ready_seen");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

#[derive(Debug, Error)]
pub enum KvError {
    #[error("open database: {0}")]
    Open(#[from] redb::DatabaseError),

    #[error("begin transaction: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("open table: {0}")]
    Table(#[from] redb::TableError),

    #[error("table operation: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit transaction: {0}")]
    Commit(#[from] redb::CommitError),
}

/// The two vote-evidence buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteBucket {
    Echo,
    Ready,
}

impl VoteBucket {
    pub fn name(self) -> &'static str {
        match self {
            VoteBucket::Echo => "echo_seen",
            VoteBucket::Ready => "ready_seen",
        }
    }
}

/// Current wall-clock time in unix milliseconds.
pub fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Durable node metadata: pinned FPCCs, vote evidence, creation times.
pub struct MetaDb {
    db: Database,
}

impl MetaDb {
    /// Open (or create) the database and ensure all buckets exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let db = Database::create(path)?;
        let tx = db.begin_write()?;
        {
            tx.open_table(FPCCS)?;
            tx.open_table(ECHO_SEEN)?;
            tx.open_table(READY_SEEN)?;
            tx.open_table(META)?;
        }
        tx.commit()?;
        Ok(MetaDb { db })
    }

    /// Persist the FPCC for `object` unless one is already pinned.
    /// Re-pinning never overwrites.
    pub fn pin_fpcc(&self, object: &str, encoded: &[u8]) -> Result<(), KvError> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(FPCCS)?;
            if table.get(object)?.is_none() {
                table.insert(object, encoded)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// The pinned FPCC bytes for `object`, if any.
    pub fn fpcc(&self, object: &str) -> Result<Option<Vec<u8>>, KvError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(FPCCS)?;
        Ok(table.get(object)?.map(|guard| guard.value().to_vec()))
    }

    /// All pinned FPCCs, for startup warm-up.
    pub fn fpcc_entries(&self) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(FPCCS)?;
        let mut entries = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }

    /// Record `object`'s creation time unless already present.
    pub fn record_created_at(&self, object: &str, at_ms: u64) -> Result<(), KvError> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(META)?;
            if table.get(object)?.is_none() {
                table.insert(object, at_ms)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn created_at(&self, object: &str) -> Result<Option<u64>, KvError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(META)?;
        Ok(table.get(object)?.map(|guard| guard.value()))
    }

    /// All `(object, created_at)` pairs, for GC scans and warm-up.
    pub fn meta_entries(&self) -> Result<Vec<(String, u64)>, KvError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(META)?;
        let mut entries = Vec::new();
        for row in table.iter()? {
            let (key, value) = row?;
            entries.push((key.value().to_string(), value.value()));
        }
        Ok(entries)
    }

    /// Insert a batch of `"<object>|<peer>"` evidence keys in one
    /// transaction. Re-insertion is harmless (idempotent evidence).
    pub fn record_vote_keys(&self, bucket: VoteBucket, keys: &[String]) -> Result<(), KvError> {
        let def = match bucket {
            VoteBucket::Echo => ECHO_SEEN,
            VoteBucket::Ready => READY_SEEN,
        };
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(def)?;
            for key in keys {
                table.insert(key.as_str(), [1u8].as_slice())?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All `(object, peer)` vote pairs in a bucket, for startup warm-up.
    pub fn vote_entries(&self, bucket: VoteBucket) -> Result<Vec<(String, String)>, KvError> {
        let def = match bucket {
            VoteBucket::Echo => ECHO_SEEN,
            VoteBucket::Ready => READY_SEEN,
        };
        let tx = self.db.begin_read()?;
        let table = tx.open_table(def)?;
        let mut entries = Vec::new();
        for row in table.iter()? {
            let (key, _) = row?;
            if let Some((object, peer)) = key.value().split_once('|') {
                entries.push((object.to_string(), peer.to_string()));
            }
        }
        Ok(entries)
    }

    /// Tear down every row belonging to `object` across all buckets in a
    /// single transaction: FPCC, meta, and all `"<object>|*"` evidence.
    pub fn delete_object(&self, object: &str) -> Result<(), KvError> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(FPCCS)?;
            table.remove(object)?;
            let mut table = tx.open_table(META)?;
            table.remove(object)?;

            let prefix = format!("{object}|");
            for def in [ECHO_SEEN, READY_SEEN] {
                let mut table = tx.open_table(def)?;
                let mut doomed = Vec::new();
                for row in table.range(prefix.as_str()..)? {
                    let (key, _) = row?;
                    let key = key.value();
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    doomed.push(key.to_string());
                }
                for key in &doomed {
                    table.remove(key.as_str())?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}
