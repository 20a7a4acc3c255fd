//! tapsync - peer-to-peer synchronization for a small SQLite tap-list database
//!
//! Several independent nodes each hold a local copy of a small relational
//! dataset (beer and tap records) and keep it convergent without any central
//! coordinator. Edits propagate over the local network and a node that was
//! offline catches up when it comes back.
//!
//! # Key pieces
//!
//! - **Peer-to-peer**: every node is equal; there is no leader
//! - **Change log**: every local mutation lands in a durable append-only log
//!   used to compute deltas between nodes
//! - **Gossip**: UDP broadcast heartbeats and update notifications detect
//!   version drift; a custom framed TCP protocol moves the data
//! - **Last full snapshot wins**: the whole-database version with the latest
//!   last-modified timestamp is authoritative; syncing replaces the local
//!   file wholesale (keeping one rolling backup)
//!
//! # Quick start
//!
//! ```no_run
//! use tapsync::{SyncConfig, SyncedDb};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let node = SyncedDb::start(SyncConfig::new("kegs.db")).await?;
//! node.add_beer("Amber Ale", Some(5.2), None).await?;
//! node.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Non-goals
//!
//! No per-row conflict resolution, no strict consistency, no schema
//! migration, and no encryption or authentication of peer traffic.

pub mod discovery;
pub mod gossip;
pub mod message;
pub mod node;
pub mod peers;
pub mod pool;
pub mod store;
pub mod tracker;
pub mod transfer;
pub mod types;

pub use node::{SyncConfig, SyncedDb};
pub use types::{ChangeLogEntry, DbVersion, Operation};

#[cfg(test)]
mod tests;
