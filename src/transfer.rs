//! TCP message exchange: serving and requesting change batches and full
//! database byte streams.
//!
//! One connection per exchange. The server side walks a small state machine
//! (await request → sync or full-db path → streaming → closed); any error
//! inside a handler logs and closes that connection only. Database bytes are
//! always announced with an explicit size before streaming, on both paths.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::message::{expect_ack, read_envelope, write_envelope, Envelope};
use crate::peers::PeerDirectory;
use crate::tracker::ChangeTracker;
use crate::types::{ChangeLogEntry, DbVersion};

/// Chunk size for raw database streaming.
const DB_CHUNK: usize = 8 * 1024;

/// Upper bound on a serialized change list frame.
const MAX_CHANGE_FRAME: u32 = 256 * 1024 * 1024;

/// Everything a connection handler needs; cheap to clone per connection.
#[derive(Clone)]
pub struct TransferContext {
    pub tracker: ChangeTracker,
    pub sync_port: u16,
}

impl TransferContext {
    fn db_path(&self) -> PathBuf {
        self.tracker.store().pool().path().to_path_buf()
    }
}

/// Serve one inbound sync connection.
///
/// Returns the requester's address and sync port when its declared version is
/// newer than ours; the caller then pulls from it, which is what lets a
/// broadcast-deaf network still converge through direct TCP contact.
pub async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: TransferContext,
    peers: &PeerDirectory,
) -> Result<Option<(IpAddr, u16)>> {
    let request = read_envelope(&mut stream).await?;

    match request {
        Envelope::SyncRequest {
            version,
            last_timestamp,
            sync_port,
        } => {
            peers.add_or_update(peer.ip(), version.clone(), sync_port);
            serve_sync(&mut stream, &ctx, &last_timestamp).await?;

            let local = local_version(&ctx).await;
            if version.is_newer_than(&local) {
                return Ok(Some((peer.ip(), sync_port)));
            }
            Ok(None)
        }
        Envelope::FullDbRequest { version, sync_port } => {
            peers.add_or_update(peer.ip(), version, sync_port);
            serve_full_db(&mut stream, &ctx).await?;
            Ok(None)
        }
        other => bail!("unexpected opening message {other:?}"),
    }
}

async fn local_version(ctx: &TransferContext) -> DbVersion {
    let tracker = ctx.tracker.clone();
    spawn_blocking(move || tracker.db_version())
        .await
        .unwrap_or_else(|_| DbVersion::empty())
}

/// Incremental path: change list, then the whole current database file.
async fn serve_sync(stream: &mut TcpStream, ctx: &TransferContext, since: &str) -> Result<()> {
    let tracker = ctx.tracker.clone();
    let since = since.to_string();
    let changes = spawn_blocking(move || tracker.changes_since(&since))
        .await
        .context("changes task panicked")??;
    let version = local_version(ctx).await;

    if changes.is_empty() {
        write_envelope(
            stream,
            &Envelope::SyncResponse {
                version,
                has_changes: false,
            },
        )
        .await?;
        return Ok(());
    }

    write_envelope(
        stream,
        &Envelope::SyncResponse {
            version,
            has_changes: true,
        },
    )
    .await?;
    expect_ack(stream).await?;

    write_change_list(stream, &changes).await?;
    expect_ack(stream).await?;

    stream_database(stream, &ctx.db_path()).await?;
    info!("served {} changes and database to peer", changes.len());
    Ok(())
}

/// Snapshot path: explicit size header, then exactly that many bytes.
async fn serve_full_db(stream: &mut TcpStream, ctx: &TransferContext) -> Result<()> {
    let db_path = ctx.db_path();
    let db_size = match tokio::fs::metadata(&db_path).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    let version = local_version(ctx).await;

    write_envelope(stream, &Envelope::FullDbResponse { version, db_size }).await?;
    if db_size == 0 {
        return Ok(());
    }
    expect_ack(stream).await?;

    stream_database(stream, &db_path).await?;
    info!("served full database ({db_size} bytes) to peer");
    Ok(())
}

async fn write_change_list(stream: &mut TcpStream, changes: &[ChangeLogEntry]) -> Result<()> {
    let body = serde_json::to_vec(changes).context("failed to encode change list")?;
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_change_list(stream: &mut TcpStream) -> Result<Vec<ChangeLogEntry>> {
    let len = stream.read_u32().await?;
    if len > MAX_CHANGE_FRAME {
        bail!("change list of {len} bytes exceeds protocol limit");
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    serde_json::from_slice(&body).context("malformed change list")
}

/// Stream a file preceded by its byte count.
async fn stream_database(stream: &mut TcpStream, path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let db_size = file.metadata().await?.len();

    stream.write_u64(db_size).await?;
    let mut buf = [0u8; DB_CHUNK];
    let mut sent = 0u64;
    while sent < db_size {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            bail!("database file shrank mid-stream");
        }
        stream.write_all(&buf[..n]).await?;
        sent += n as u64;
    }
    stream.flush().await?;
    Ok(())
}

/// Counter making temp file names unique; the broadcast listener can spawn
/// several concurrent pulls and they must not share a temp file.
static TRANSFER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Read an announced number of raw bytes into a sibling temp file.
async fn receive_database(stream: &mut TcpStream, db_path: &Path, db_size: u64) -> Result<PathBuf> {
    let seq = TRANSFER_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = db_path.with_extension(format!("sync.{seq}.tmp"));
    let mut tmp = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut buf = [0u8; DB_CHUNK];
    let mut received = 0u64;
    while received < db_size {
        let want = DB_CHUNK.min((db_size - received) as usize);
        let n = stream.read(&mut buf[..want]).await?;
        if n == 0 {
            bail!("peer closed connection {received}/{db_size} bytes in");
        }
        tmp.write_all(&buf[..n]).await?;
        received += n as u64;
    }
    tmp.flush().await?;
    Ok(tmp_path)
}

/// Swap the live database file for `incoming`, keeping one rolling backup of
/// the previous file. The only place the live file is ever replaced.
pub fn replace_database_file(db_path: &Path, incoming: &Path) -> Result<()> {
    if db_path.exists() {
        let backup = db_path.with_extension("db.bak");
        fs_err::copy(db_path, &backup).context("failed to back up previous database")?;
    }
    fs_err::rename(incoming, db_path).context("failed to move new database into place")?;
    Ok(())
}

/// Pull a peer's missing changes plus its current database file.
///
/// Returns true when the local database was updated. The caller is expected
/// to recompute its version afterwards.
pub async fn pull_sync(peer: IpAddr, peer_sync_port: u16, ctx: &TransferContext) -> Result<bool> {
    let tracker = ctx.tracker.clone();
    let version = spawn_blocking(move || tracker.db_version())
        .await
        .context("version task panicked")?;

    let mut stream = TcpStream::connect((peer, peer_sync_port))
        .await
        .with_context(|| format!("failed to connect to {peer}:{peer_sync_port}"))?;

    write_envelope(
        &mut stream,
        &Envelope::SyncRequest {
            last_timestamp: version.timestamp.clone(),
            version,
            sync_port: ctx.sync_port,
        },
    )
    .await?;

    match read_envelope(&mut stream).await? {
        Envelope::SyncResponse {
            has_changes: false, ..
        } => {
            debug!("peer {peer} has no changes for us");
            Ok(false)
        }
        Envelope::SyncResponse {
            has_changes: true, ..
        } => {
            write_envelope(&mut stream, &Envelope::Ack).await?;
            let changes = read_change_list(&mut stream).await?;
            write_envelope(&mut stream, &Envelope::Ack).await?;

            let db_size = stream.read_u64().await?;
            let tmp_path = receive_database(&mut stream, &ctx.db_path(), db_size).await?;

            // Apply the change list first, then adopt the peer's file
            // wholesale. Last full snapshot wins.
            let tracker = ctx.tracker.clone();
            let applied = spawn_blocking(move || tracker.apply_changes(&changes))
                .await
                .context("apply task panicked")??;

            let db_path = ctx.db_path();
            let pool = ctx.tracker.store().pool().clone();
            spawn_blocking(move || -> Result<()> {
                replace_database_file(&db_path, &tmp_path)?;
                pool.refresh()
            })
            .await
            .context("replace task panicked")??;

            info!("synchronized from {peer}: {applied} changes applied, database replaced");
            Ok(true)
        }
        other => bail!("unexpected sync response {other:?}"),
    }
}

/// Pull a peer's entire database file, replacing the local one.
///
/// Returns true when a file was received; a peer with no database yet
/// (size 0) leaves the local file untouched.
pub async fn pull_full_db(peer: IpAddr, peer_sync_port: u16, ctx: &TransferContext) -> Result<bool> {
    let tracker = ctx.tracker.clone();
    let version = spawn_blocking(move || tracker.db_version())
        .await
        .context("version task panicked")?;

    let mut stream = TcpStream::connect((peer, peer_sync_port))
        .await
        .with_context(|| format!("failed to connect to {peer}:{peer_sync_port}"))?;

    write_envelope(
        &mut stream,
        &Envelope::FullDbRequest {
            version,
            sync_port: ctx.sync_port,
        },
    )
    .await?;

    let db_size = match read_envelope(&mut stream).await? {
        Envelope::FullDbResponse { db_size, .. } => db_size,
        other => bail!("unexpected full db response {other:?}"),
    };
    if db_size == 0 {
        debug!("peer {peer} has no database file yet");
        return Ok(false);
    }
    write_envelope(&mut stream, &Envelope::Ack).await?;

    // The size header precedes the raw bytes on this path too.
    let announced = stream.read_u64().await?;
    if announced != db_size {
        warn!("peer {peer} announced {db_size} then streamed {announced} bytes");
    }
    let tmp_path = receive_database(&mut stream, &ctx.db_path(), announced).await?;

    let db_path = ctx.db_path();
    let pool = ctx.tracker.store().pool().clone();
    spawn_blocking(move || -> Result<()> {
        replace_database_file(&db_path, &tmp_path)?;
        pool.refresh()
    })
    .await
    .context("replace task panicked")??;

    info!("received full database ({db_size} bytes) from {peer}");
    Ok(true)
}
