//! Bounded, serialized access to the local SQLite file.
//!
//! Every database touch in the crate goes through a [`ConnectionPool`]: a
//! fixed set of [`rusqlite::Connection`]s handed out one at a time. Callers
//! acquire, use, and drop the guard before doing any network I/O; a
//! connection is never held across a socket call.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::warn;

pub const DEFAULT_POOL_SIZE: usize = 5;

struct PoolInner {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
    /// Bumped by [`ConnectionPool::refresh`]; guards from an older generation
    /// hold connections to a replaced file and must not return to the pool.
    generation: AtomicU64,
}

impl PoolInner {
    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open database {}", self.path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

/// Fixed-size pool of connections to one database file.
///
/// Cloning is cheap; clones share the same set of connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Open a pool of [`DEFAULT_POOL_SIZE`] connections, creating the
    /// database file if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_size(path, DEFAULT_POOL_SIZE)
    }

    pub fn with_size(path: impl AsRef<Path>, size: usize) -> Result<Self> {
        let inner = Arc::new(PoolInner {
            path: path.as_ref().to_path_buf(),
            idle: Mutex::new(Vec::with_capacity(size)),
            available: Condvar::new(),
            generation: AtomicU64::new(0),
        });
        let mut idle = inner.idle.lock().expect("pool lock poisoned");
        for _ in 0..size.max(1) {
            idle.push(inner.open_connection()?);
        }
        drop(idle);
        Ok(Self { inner })
    }

    /// Block until a connection is free and return it behind a guard. The
    /// connection goes back to the pool when the guard drops.
    pub fn get(&self) -> PooledConnection {
        let mut idle = self.inner.idle.lock().expect("pool lock poisoned");
        loop {
            if let Some(conn) = idle.pop() {
                return PooledConnection {
                    conn: Some(conn),
                    pool: Arc::clone(&self.inner),
                    generation: self.inner.generation.load(Ordering::Acquire),
                };
            }
            idle = self
                .inner
                .available
                .wait(idle)
                .expect("pool lock poisoned");
        }
    }

    /// Close every idle connection and open fresh ones against the current
    /// file. Called after the database file is swapped out underneath the
    /// pool. Connections checked out at that moment are reopened when their
    /// guard drops.
    pub fn refresh(&self) -> Result<()> {
        let mut idle = self.inner.idle.lock().expect("pool lock poisoned");
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let count = idle.len();
        idle.clear();
        for _ in 0..count {
            idle.push(self.inner.open_connection()?);
        }
        drop(idle);
        self.inner.available.notify_all();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

/// Guard around a checked-out connection.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    generation: u64,
}

impl PooledConnection {
    /// Drop the underlying connection instead of returning it, replacing it
    /// with a freshly opened one. Used after errors that may leave a
    /// connection in a bad state. If the reopen fails the slot is lost and
    /// the pool shrinks by one.
    pub fn discard(mut self) {
        self.conn.take();
        match self.pool.open_connection() {
            Ok(fresh) => {
                let mut idle = self.pool.idle.lock().expect("pool lock poisoned");
                idle.push(fresh);
                drop(idle);
                self.pool.available.notify_one();
            }
            Err(e) => warn!("failed to replace discarded connection: {e:#}"),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        // A connection from before a refresh points at the replaced file.
        if self.generation != self.pool.generation.load(Ordering::Acquire) {
            drop(conn);
            match self.pool.open_connection() {
                Ok(fresh) => {
                    let mut idle = self.pool.idle.lock().expect("pool lock poisoned");
                    idle.push(fresh);
                    drop(idle);
                    self.pool.available.notify_one();
                }
                Err(e) => warn!("failed to reopen stale connection: {e:#}"),
            }
            return;
        }
        let mut idle = self.pool.idle.lock().expect("pool lock poisoned");
        idle.push(conn);
        drop(idle);
        self.pool.available.notify_one();
    }
}
