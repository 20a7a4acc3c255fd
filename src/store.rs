//! Local tap-list data store.
//!
//! This is the CRUD collaborator the sync core replicates: a couple of small
//! relational tables plus the generic row access the change replay needs
//! (read/write arbitrary rows by table + rowid, enumerate a table
//! deterministically, list its columns).
//!
//! Mutations here do not log or broadcast anything themselves; the node wires
//! the post-mutation hook (`log_change` + `notify_update`) around them.

use anyhow::{bail, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pool::ConnectionPool;
use crate::types::Operation;

/// Tables covered by change tracking and content hashing, in hash order.
pub const TRACKED_TABLES: &[&str] = &["beers", "taps"];

/// A beer record as stored in the `beers` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beer {
    pub id: i64,
    pub name: String,
    pub abv: Option<f64>,
    pub description: Option<String>,
}

/// Thin handle over the pooled database; cheap to clone.
#[derive(Clone)]
pub struct TapStore {
    pool: ConnectionPool,
}

impl TapStore {
    /// Wrap a pool and create the data tables if they are missing.
    pub fn open(pool: ConnectionPool) -> Result<Self> {
        let store = Self { pool };
        store.init_tables()?;
        Ok(store)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.pool.get();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS beers (
                idBeer INTEGER PRIMARY KEY,
                Name TEXT NOT NULL,
                ABV REAL,
                Description TEXT
             );
             CREATE TABLE IF NOT EXISTS taps (
                idTap INTEGER PRIMARY KEY,
                idBeer INTEGER
             );",
        )
        .context("failed to create data tables")?;
        info!("data tables initialized");
        Ok(())
    }

    // ---- beer CRUD ----

    pub fn add_beer(
        &self,
        name: &str,
        abv: Option<f64>,
        description: Option<&str>,
    ) -> Result<i64> {
        let conn = self.pool.get();
        conn.execute(
            "INSERT INTO beers (Name, ABV, Description) VALUES (?1, ?2, ?3)",
            params![name, abv, description],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Overwrite a beer's fields; returns false when the row does not exist.
    pub fn update_beer(
        &self,
        id: i64,
        name: &str,
        abv: Option<f64>,
        description: Option<&str>,
    ) -> Result<bool> {
        let conn = self.pool.get();
        let updated = conn.execute(
            "UPDATE beers SET Name = ?1, ABV = ?2, Description = ?3 WHERE idBeer = ?4",
            params![name, abv, description, id],
        )?;
        Ok(updated > 0)
    }

    pub fn delete_beer(&self, id: i64) -> Result<bool> {
        let conn = self.pool.get();
        let deleted = conn.execute("DELETE FROM beers WHERE idBeer = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn get_beer(&self, id: i64) -> Result<Option<Beer>> {
        let conn = self.pool.get();
        conn.query_row(
            "SELECT idBeer, Name, ABV, Description FROM beers WHERE idBeer = ?1",
            params![id],
            |row| {
                Ok(Beer {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    abv: row.get(2)?,
                    description: row.get(3)?,
                })
            },
        )
        .optional()
        .context("failed to read beer")
    }

    pub fn all_beers(&self) -> Result<Vec<Beer>> {
        let conn = self.pool.get();
        let mut stmt =
            conn.prepare("SELECT idBeer, Name, ABV, Description FROM beers ORDER BY idBeer")?;
        let beers = stmt
            .query_map([], |row| {
                Ok(Beer {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    abv: row.get(2)?,
                    description: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(beers)
    }

    // ---- tap CRUD ----

    /// Point a tap at a beer (or at nothing), creating the tap if needed.
    pub fn set_tap(&self, tap_id: i64, beer_id: Option<i64>) -> Result<()> {
        let conn = self.pool.get();
        conn.execute(
            "INSERT INTO taps (idTap, idBeer) VALUES (?1, ?2)
             ON CONFLICT(idTap) DO UPDATE SET idBeer = excluded.idBeer",
            params![tap_id, beer_id],
        )?;
        Ok(())
    }

    pub fn all_taps(&self) -> Result<Vec<(i64, Option<i64>)>> {
        let conn = self.pool.get();
        let mut stmt = conn.prepare("SELECT idTap, idBeer FROM taps ORDER BY idTap")?;
        let taps = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(taps)
    }

    // ---- generic row access for change replay and hashing ----

    /// Table names come off the wire; only tracked tables may be spliced
    /// into SQL.
    fn ensure_tracked(table: &str) -> Result<()> {
        if TRACKED_TABLES.contains(&table) {
            Ok(())
        } else {
            bail!("unknown table {table:?}")
        }
    }

    pub fn list_columns(&self, table: &str) -> Result<Vec<String>> {
        Self::ensure_tracked(table)?;
        let conn = self.pool.get();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    /// Read one row by rowid, values in column order.
    pub fn read_row(&self, table: &str, row_id: i64) -> Result<Option<Vec<Value>>> {
        Self::ensure_tracked(table)?;
        let conn = self.pool.get();
        let mut stmt = conn.prepare(&format!("SELECT * FROM {table} WHERE rowid = ?1"))?;
        let row = stmt
            .query_row(params![row_id], |row| {
                let n = row.as_ref().column_count();
                (0..n).map(|i| row.get::<_, Value>(i)).collect::<rusqlite::Result<Vec<_>>>()
            })
            .optional()?;
        Ok(row)
    }

    /// Write one row at an explicit rowid (overwrite-by-id), or delete it.
    pub fn write_row(
        &self,
        table: &str,
        row_id: i64,
        values: &[Value],
        op: Operation,
    ) -> Result<()> {
        Self::ensure_tracked(table)?;
        let conn = self.pool.get();
        match op {
            Operation::Delete => {
                conn.execute(&format!("DELETE FROM {table} WHERE rowid = ?1"), params![row_id])?;
            }
            Operation::Insert | Operation::Update => {
                let columns = self.list_columns(table)?;
                if columns.len() != values.len() {
                    bail!(
                        "row shape mismatch for {table}: {} columns, {} values",
                        columns.len(),
                        values.len()
                    );
                }
                let column_list = columns.join(", ");
                let placeholders = (2..=values.len() + 1)
                    .map(|i| format!("?{i}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "INSERT OR REPLACE INTO {table} (rowid, {column_list}) VALUES (?1, {placeholders})"
                );
                let mut params: Vec<&dyn rusqlite::ToSql> = vec![&row_id];
                for value in values {
                    params.push(value);
                }
                conn.execute(&sql, params.as_slice())?;
            }
        }
        Ok(())
    }

    /// Enumerate a table's rows deterministically (rowid order) for hashing.
    pub fn table_rows(&self, table: &str) -> Result<Vec<Vec<Value>>> {
        Self::ensure_tracked(table)?;
        let conn = self.pool.get();
        let mut stmt = conn.prepare(&format!("SELECT rowid, * FROM {table} ORDER BY rowid"))?;
        let rows = stmt
            .query_map([], |row| {
                let n = row.as_ref().column_count();
                (0..n).map(|i| row.get::<_, Value>(i)).collect::<rusqlite::Result<Vec<_>>>()
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
