//! Wire messages for both protocols.
//!
//! UDP datagrams ([`Gossip`]) and TCP envelopes ([`Envelope`]) are single JSON
//! objects tagged by a `type` field. Anything that fails to decode is a
//! protocol error surfaced to the caller; nothing is interpreted "best guess".
//!
//! TCP envelopes are framed with a big-endian `u32` byte length so a reader
//! never has to guess where one message ends. Raw database bytes that follow
//! an envelope are always announced with an explicit size up front, on both
//! the incremental and the snapshot path.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::types::DbVersion;

/// Largest envelope we will accept. Change lists are the only envelopes that
/// grow with data volume and they are batched well below this.
const MAX_ENVELOPE_BYTES: u32 = 64 * 1024 * 1024;

/// Datagrams exchanged on the shared UDP broadcast port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Gossip {
    /// Startup probe: "who is out there, and how new are you?"
    Discovery { version: DbVersion, sync_port: u16 },
    /// Periodic liveness + version advertisement.
    Heartbeat { version: DbVersion, sync_port: u16 },
    /// A local write happened; peers should compare versions.
    Update { version: DbVersion, sync_port: u16 },
}

impl Gossip {
    pub fn version(&self) -> &DbVersion {
        match self {
            Gossip::Discovery { version, .. }
            | Gossip::Heartbeat { version, .. }
            | Gossip::Update { version, .. } => version,
        }
    }

    pub fn sync_port(&self) -> u16 {
        match self {
            Gossip::Discovery { sync_port, .. }
            | Gossip::Heartbeat { sync_port, .. }
            | Gossip::Update { sync_port, .. } => *sync_port,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("gossip messages always serialize")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("malformed gossip datagram")
    }
}

/// Envelopes exchanged on a TCP sync connection, one JSON object per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Client asks for every change after `last_timestamp`.
    SyncRequest {
        version: DbVersion,
        last_timestamp: String,
        sync_port: u16,
    },
    /// Server's answer; when `has_changes` the change list and a database
    /// stream follow.
    SyncResponse { version: DbVersion, has_changes: bool },
    /// Client asks for the whole database file.
    FullDbRequest { version: DbVersion, sync_port: u16 },
    /// Server announces exactly `db_size` raw bytes to follow (0 = no file).
    FullDbResponse { version: DbVersion, db_size: u64 },
    /// Bare acknowledgement separating protocol phases.
    Ack,
}

/// Write one length-prefixed envelope.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let body = serde_json::to_vec(envelope).context("failed to encode envelope")?;
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed envelope.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope>
where
    R: AsyncReadExt + Unpin,
{
    let len = reader.read_u32().await.context("connection closed")?;
    if len > MAX_ENVELOPE_BYTES {
        bail!("envelope of {len} bytes exceeds protocol limit");
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .context("truncated envelope")?;
    serde_json::from_slice(&body).context("malformed envelope")
}

/// Read an envelope and require it to be a bare [`Envelope::Ack`].
pub async fn expect_ack<R>(reader: &mut R) -> Result<()>
where
    R: AsyncReadExt + Unpin,
{
    match read_envelope(reader).await? {
        Envelope::Ack => Ok(()),
        other => bail!("expected ack, got {other:?}"),
    }
}
