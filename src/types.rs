use std::net::IpAddr;
use std::time::Instant;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp format used everywhere: UTC, second precision, ISO-8601.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// The epoch rendered in [`TIMESTAMP_FORMAT`]; baseline for "give me everything".
pub const EPOCH_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

/// Render the current wall-clock time in the shared timestamp format.
pub fn now_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp in the shared format.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Row-level mutation kind recorded in the change log.
///
/// Serialized as the upper-case SQL verb both on the wire and in the
/// `change_log` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable record of a local mutation. Append-only; ordering key is the
/// timestamp, not log-insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub table_name: String,
    pub operation: Operation,
    pub row_id: i64,
    pub timestamp: String,
    pub content_hash: String,
}

/// Whole-database version summary: a content hash over every tracked table
/// plus the timestamp of the most recent change-log entry.
///
/// Two databases with identical table contents produce identical hashes no
/// matter how they got there, which is what lets peers skip no-op syncs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbVersion {
    pub hash: String,
    pub timestamp: String,
}

impl DbVersion {
    /// Version of a database that does not exist yet.
    pub fn empty() -> Self {
        Self {
            hash: "0".to_string(),
            timestamp: EPOCH_TIMESTAMP.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hash == "0"
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    /// Whole-database last-writer-wins policy.
    ///
    /// Anything beats an empty database. With two real versions the later
    /// last-modified timestamp wins; if either timestamp fails to parse, any
    /// hash difference is treated as "worth syncing".
    pub fn is_newer_than(&self, other: &DbVersion) -> bool {
        if other.is_empty() {
            return true;
        }
        match (self.parsed_timestamp(), other.parsed_timestamp()) {
            (Some(mine), Some(theirs)) => mine > theirs,
            _ => self.hash != other.hash,
        }
    }
}

impl std::fmt::Display for DbVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Hashes arrive off the wire as arbitrary strings; truncate by
        // character, not byte, so formatting can never panic.
        let short: String = self.hash.chars().take(8).collect();
        write!(f, "{short}@{}", self.timestamp)
    }
}

/// What the node knows about one peer. Owned exclusively by the
/// [`PeerDirectory`](crate::peers::PeerDirectory).
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: IpAddr,
    pub version: DbVersion,
    pub sync_port: u16,
    pub last_seen: Instant,
}
