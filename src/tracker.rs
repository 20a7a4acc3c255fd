//! Durable change tracking and whole-database versioning.
//!
//! Every local mutation lands in the append-only `change_log` table together
//! with a per-table content hash, and bumps the single-row `version` table's
//! `last_modified` timestamp. Deltas between nodes are answered straight from
//! the log; the database version is recomputed from table contents on demand
//! rather than cached.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::params;
use rusqlite::types::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::store::{TapStore, TRACKED_TABLES};
use crate::types::{
    now_timestamp, ChangeLogEntry, DbVersion, Operation, EPOCH_TIMESTAMP, TIMESTAMP_FORMAT,
};

/// Cursor batch size for log reads.
const READ_BATCH: usize = 1000;

/// Past this many entries in one delta the log probably wants pruning.
const HUGE_CHANGESET: usize = 100_000;

#[derive(Clone)]
pub struct ChangeTracker {
    store: TapStore,
}

impl ChangeTracker {
    /// Wrap a store and create the tracking tables if they are missing.
    pub fn new(store: TapStore) -> Result<Self> {
        let tracker = Self { store };
        tracker.initialize()?;
        Ok(tracker)
    }

    pub fn store(&self) -> &TapStore {
        &self.store
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.store.pool().get();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS change_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name TEXT NOT NULL,
                operation TEXT NOT NULL,
                row_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                content_hash TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS version (
                last_modified TEXT
             );",
        )
        .context("failed to create tracking tables")?;

        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM version", [], |r| r.get(0))?;
        if rows == 0 {
            conn.execute(
                "INSERT INTO version (last_modified) VALUES (?1)",
                params![now_timestamp()],
            )?;
        }
        info!("change tracking tables initialized");
        Ok(())
    }

    /// Record one local mutation. Invoked by every write path, including
    /// changes replayed from a peer. Errors are returned to the caller; the
    /// local write itself is never rolled back from here.
    pub fn log_change(&self, table: &str, operation: Operation, row_id: i64) -> Result<()> {
        let timestamp = now_timestamp();
        let content_hash = self.table_hash(table)?;

        let conn = self.store.pool().get();
        conn.execute(
            "INSERT INTO change_log (table_name, operation, row_id, timestamp, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![table, operation.as_str(), row_id, timestamp, content_hash],
        )?;
        conn.execute(
            "UPDATE version SET last_modified = ?1",
            params![timestamp],
        )?;
        debug!("logged {operation} on {table} row {row_id}");
        Ok(())
    }

    /// All change-log entries strictly after `since`, ascending by timestamp.
    /// Read through a cursor in batches so an unbounded log never has to fit
    /// in one allocation step.
    pub fn changes_since(&self, since: &str) -> Result<Vec<ChangeLogEntry>> {
        let conn = self.store.pool().get();
        let mut stmt = conn.prepare(
            "SELECT table_name, operation, row_id, timestamp, content_hash
             FROM change_log
             WHERE timestamp > ?1
             ORDER BY timestamp",
        )?;

        let mut changes = Vec::new();
        let mut rows = stmt.query(params![since])?;
        let mut batch = 0usize;
        while let Some(row) = rows.next()? {
            let op: String = row.get(1)?;
            let operation = Operation::parse(&op)
                .with_context(|| format!("unknown operation {op:?} in change log"))?;
            changes.push(ChangeLogEntry {
                table_name: row.get(0)?,
                operation,
                row_id: row.get(2)?,
                timestamp: row.get(3)?,
                content_hash: row.get(4)?,
            });
            batch += 1;
            if batch == READ_BATCH {
                batch = 0;
                if changes.len() > HUGE_CHANGESET {
                    warn!(
                        "very large change set ({} entries); consider pruning the change log",
                        changes.len()
                    );
                }
            }
        }
        Ok(changes)
    }

    /// Replay a change list received from a peer.
    ///
    /// Each entry is re-applied by re-reading the affected row and issuing
    /// the equivalent overwrite-by-rowid (or delete), then re-logged with its
    /// original timestamp and hash. A failing entry is logged and skipped;
    /// the rest still apply. Returns the number of entries applied.
    pub fn apply_changes(&self, changes: &[ChangeLogEntry]) -> Result<usize> {
        let mut applied = 0usize;
        let mut last_timestamp: Option<&str> = None;

        for entry in changes {
            match self.apply_one(entry) {
                Ok(()) => {
                    applied += 1;
                    last_timestamp = Some(&entry.timestamp);
                }
                Err(e) => warn!(
                    "skipping change ({} {} row {}): {e:#}",
                    entry.operation, entry.table_name, entry.row_id
                ),
            }
        }

        if let Some(timestamp) = last_timestamp {
            let conn = self.store.pool().get();
            conn.execute(
                "UPDATE version SET last_modified = ?1",
                params![timestamp],
            )?;
        }
        info!("applied {applied}/{} changes", changes.len());
        Ok(applied)
    }

    fn apply_one(&self, entry: &ChangeLogEntry) -> Result<()> {
        match entry.operation {
            Operation::Insert | Operation::Update => {
                if let Some(values) = self.store.read_row(&entry.table_name, entry.row_id)? {
                    self.store.write_row(
                        &entry.table_name,
                        entry.row_id,
                        &values,
                        entry.operation,
                    )?;
                }
            }
            Operation::Delete => {
                self.store
                    .write_row(&entry.table_name, entry.row_id, &[], Operation::Delete)?;
            }
        }

        // Re-log under the original timestamp so the entry forwards to the
        // next peer. Replays therefore do create fresh log rows.
        let conn = self.store.pool().get();
        conn.execute(
            "INSERT INTO change_log (table_name, operation, row_id, timestamp, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.table_name,
                entry.operation.as_str(),
                entry.row_id,
                entry.timestamp,
                entry.content_hash
            ],
        )?;
        Ok(())
    }

    /// Current whole-database version. Never fails: a missing file reports
    /// the empty version, and a missing or unreadable version row is
    /// re-initialized to the epoch.
    pub fn db_version(&self) -> DbVersion {
        if !self.store.pool().path().exists() {
            return DbVersion::empty();
        }

        let hash = match self.content_hash() {
            Ok(hash) => hash,
            Err(e) => {
                warn!("failed to compute content hash: {e:#}");
                return DbVersion::empty();
            }
        };

        let conn = self.store.pool().get();
        let last_modified: Option<String> = conn
            .query_row("SELECT last_modified FROM version LIMIT 1", [], |r| r.get(0))
            .ok()
            .flatten();

        match last_modified {
            Some(timestamp) => DbVersion { hash, timestamp },
            None => {
                warn!("version row missing or unreadable; re-initializing to epoch");
                let _ = conn.execute("DELETE FROM version", []);
                let _ = conn.execute(
                    "INSERT INTO version (last_modified) VALUES (?1)",
                    params![EPOCH_TIMESTAMP],
                );
                DbVersion {
                    hash,
                    timestamp: EPOCH_TIMESTAMP.to_string(),
                }
            }
        }
    }

    /// SHA-256 over the ordered concatenation of all tracked tables' hashes.
    fn content_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for table in TRACKED_TABLES {
            hasher.update(self.table_hash(table)?.as_bytes());
        }
        Ok(hex_digest(hasher))
    }

    /// Hash one table's rows in rowid order; "0" for an empty table.
    fn table_hash(&self, table: &str) -> Result<String> {
        let rows = self.store.table_rows(table)?;
        if rows.is_empty() {
            return Ok("0".to_string());
        }
        let mut hasher = Sha256::new();
        for row in &rows {
            for value in row {
                hash_value(&mut hasher, value);
            }
            hasher.update([0xff]);
        }
        Ok(hex_digest(hasher))
    }

    /// Delete change-log entries older than `days_to_keep` days. Optional
    /// retention; nothing schedules this by default.
    pub fn prune_change_log(&self, days_to_keep: i64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(days_to_keep))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let conn = self.store.pool().get();
        let deleted = conn.execute(
            "DELETE FROM change_log WHERE timestamp < ?1",
            params![cutoff],
        )?;
        info!("pruned {deleted} old change log entries");
        Ok(deleted)
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Feed one SQLite value into the hasher with an unambiguous type prefix.
fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n:"),
        Value::Integer(i) => {
            hasher.update(b"i:");
            hasher.update(i.to_be_bytes());
        }
        Value::Real(f) => {
            hasher.update(b"r:");
            hasher.update(f.to_be_bytes());
        }
        Value::Text(s) => {
            hasher.update(b"t:");
            hasher.update(s.as_bytes());
        }
        Value::Blob(b) => {
            hasher.update(b"b:");
            hasher.update(b);
        }
    }
    hasher.update([0x00]);
}
