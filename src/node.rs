//! The running node: one database, one peer directory, one set of
//! background tasks.
//!
//! Lifecycle: construct with a database path and two ports, run discovery
//! once (blocking the startup path), start the gossip loops, serve until
//! [`SyncedDb::stop`]. Local writes go through here so the post-mutation
//! hook (change logging + update notification) is never forgotten.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::{spawn_blocking, JoinHandle};
use tracing::{info, warn};

use crate::discovery;
use crate::gossip::{self, GossipContext};
use crate::peers::PeerDirectory;
use crate::pool::{ConnectionPool, DEFAULT_POOL_SIZE};
use crate::store::{Beer, TapStore};
use crate::tracker::ChangeTracker;
use crate::transfer::{pull_full_db, TransferContext};
use crate::types::{DbVersion, Operation, PeerInfo};

/// How long `stop()` waits for each background task before abandoning it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    /// UDP port shared by every node on the network.
    pub broadcast_port: u16,
    /// TCP port unique to this node. 0 picks an ephemeral port.
    pub sync_port: u16,
    pub pool_size: usize,
    /// Skip discovery and all UDP traffic; the TCP sync listener still runs.
    /// Also treats no address as "local" so loopback peers work in tests.
    pub test_mode: bool,
}

impl SyncConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            broadcast_port: 5002,
            sync_port: 5003,
            pool_size: DEFAULT_POOL_SIZE,
            test_mode: false,
        }
    }
}

/// A locally editable database that keeps itself convergent with its peers.
pub struct SyncedDb {
    store: TapStore,
    tracker: ChangeTracker,
    ctx: Arc<GossipContext>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    test_mode: bool,
}

impl SyncedDb {
    /// Open the database, bind both sockets, run discovery, start gossip.
    /// A socket bind failure aborts construction.
    pub async fn start(config: SyncConfig) -> Result<Self> {
        let db_path = config.db_path.clone();
        let pool_size = config.pool_size;
        let (store, tracker) = spawn_blocking(move || -> Result<(TapStore, ChangeTracker)> {
            let pool = ConnectionPool::with_size(&db_path, pool_size)?;
            let store = TapStore::open(pool)?;
            let tracker = ChangeTracker::new(store.clone())?;
            Ok((store, tracker))
        })
        .await
        .context("database init task panicked")??;

        let socket = if config.test_mode {
            UdpSocket::bind("127.0.0.1:0")
                .await
                .context("failed to bind test socket")?
        } else {
            bind_broadcast_socket(config.broadcast_port)?
        };

        let listener = TcpListener::bind(("0.0.0.0", config.sync_port))
            .await
            .with_context(|| format!("failed to bind sync port {}", config.sync_port))?;
        let sync_port = listener.local_addr()?.port();

        let local_addrs = if config.test_mode {
            HashSet::new()
        } else {
            PeerDirectory::local_addresses()
        };

        let ctx = Arc::new(GossipContext {
            socket: Arc::new(socket),
            broadcast_port: config.broadcast_port,
            sync_port,
            peers: Arc::new(PeerDirectory::new(local_addrs)),
            transfer: TransferContext {
                tracker: tracker.clone(),
                sync_port,
            },
            version: RwLock::new(DbVersion::empty()),
        });
        ctx.refresh_version().await;

        // Bootstrap before anything else runs so the node cannot race
        // itself: no heartbeat or listener exists yet.
        if !config.test_mode {
            discovery::run(&ctx).await?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        tasks.push((
            "sync_listener",
            tokio::spawn(gossip::sync_listener(
                listener,
                Arc::clone(&ctx),
                shutdown_rx.clone(),
            )),
        ));
        if !config.test_mode {
            tasks.push((
                "broadcast_listener",
                tokio::spawn(gossip::broadcast_listener(
                    Arc::clone(&ctx),
                    shutdown_rx.clone(),
                )),
            ));
            tasks.push((
                "heartbeat",
                tokio::spawn(gossip::heartbeat_loop(
                    Arc::clone(&ctx),
                    shutdown_rx.clone(),
                )),
            ));
            tasks.push((
                "peer_cleanup",
                tokio::spawn(gossip::cleanup_loop(Arc::clone(&ctx), shutdown_rx)),
            ));
        }

        info!(
            "node started on sync port {sync_port} (broadcast {})",
            config.broadcast_port
        );
        Ok(Self {
            store,
            tracker,
            ctx,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            test_mode: config.test_mode,
        })
    }

    /// Stop gossiping and listening. Each task gets a bounded join; a task
    /// that fails to stop in time is abandoned, not killed.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task lock poisoned"));
        for (name, handle) in tasks {
            if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                warn!("{name} did not stop within {JOIN_TIMEOUT:?}; abandoning");
            }
        }
        info!("node stopped");
    }

    // ---- write path (CRUD + post-mutation hook) ----

    pub async fn add_beer(
        &self,
        name: &str,
        abv: Option<f64>,
        description: Option<&str>,
    ) -> Result<i64> {
        let store = self.store.clone();
        let tracker = self.tracker.clone();
        let name = name.to_string();
        let description = description.map(str::to_string);
        let id = spawn_blocking(move || -> Result<i64> {
            let id = store.add_beer(&name, abv, description.as_deref())?;
            log_or_warn(&tracker, "beers", Operation::Insert, id);
            Ok(id)
        })
        .await
        .context("write task panicked")??;
        self.notify_update().await;
        Ok(id)
    }

    pub async fn update_beer(
        &self,
        id: i64,
        name: &str,
        abv: Option<f64>,
        description: Option<&str>,
    ) -> Result<bool> {
        let store = self.store.clone();
        let tracker = self.tracker.clone();
        let name = name.to_string();
        let description = description.map(str::to_string);
        let updated = spawn_blocking(move || -> Result<bool> {
            let updated = store.update_beer(id, &name, abv, description.as_deref())?;
            if updated {
                log_or_warn(&tracker, "beers", Operation::Update, id);
            }
            Ok(updated)
        })
        .await
        .context("write task panicked")??;
        if updated {
            self.notify_update().await;
        }
        Ok(updated)
    }

    pub async fn delete_beer(&self, id: i64) -> Result<bool> {
        let store = self.store.clone();
        let tracker = self.tracker.clone();
        let deleted = spawn_blocking(move || -> Result<bool> {
            let deleted = store.delete_beer(id)?;
            if deleted {
                log_or_warn(&tracker, "beers", Operation::Delete, id);
            }
            Ok(deleted)
        })
        .await
        .context("write task panicked")??;
        if deleted {
            self.notify_update().await;
        }
        Ok(deleted)
    }

    pub async fn set_tap(&self, tap_id: i64, beer_id: Option<i64>) -> Result<()> {
        let store = self.store.clone();
        let tracker = self.tracker.clone();
        spawn_blocking(move || -> Result<()> {
            let existed = store.all_taps()?.iter().any(|(id, _)| *id == tap_id);
            store.set_tap(tap_id, beer_id)?;
            let op = if existed {
                Operation::Update
            } else {
                Operation::Insert
            };
            log_or_warn(&tracker, "taps", op, tap_id);
            Ok(())
        })
        .await
        .context("write task panicked")??;
        self.notify_update().await;
        Ok(())
    }

    /// The post-mutation hook: external write paths (web form, CRUD API)
    /// call this after any committed local mutation.
    pub async fn notify_update(&self) {
        if self.test_mode {
            self.ctx.refresh_version().await;
        } else {
            gossip::notify_update(&self.ctx).await;
        }
    }

    // ---- administrative operations ----

    /// Register a peer by hand and immediately pull its full database,
    /// whatever version it may declare.
    pub async fn add_peer(&self, addr: IpAddr, sync_port: u16) -> Result<()> {
        self.ctx
            .peers
            .add_or_update(addr, DbVersion::empty(), sync_port);
        info!("manually added peer {addr}:{sync_port}; pulling full database");
        if pull_full_db(addr, sync_port, &self.ctx.transfer).await? {
            self.ctx.refresh_version().await;
        }
        Ok(())
    }

    // ---- read accessors ----

    /// Recompute and return the current database version.
    pub async fn db_version(&self) -> DbVersion {
        self.ctx.refresh_version().await
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.ctx.peers.peers()
    }

    /// The TCP port this node actually listens on (useful with port 0).
    pub fn sync_port(&self) -> u16 {
        self.ctx.sync_port
    }

    pub async fn all_beers(&self) -> Result<Vec<Beer>> {
        let store = self.store.clone();
        spawn_blocking(move || store.all_beers())
            .await
            .context("read task panicked")?
    }

    pub async fn all_taps(&self) -> Result<Vec<(i64, Option<i64>)>> {
        let store = self.store.clone();
        spawn_blocking(move || store.all_taps())
            .await
            .context("read task panicked")?
    }

    pub fn store(&self) -> &TapStore {
        &self.store
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }
}

/// A failed change-log write must not fail the local mutation.
fn log_or_warn(tracker: &ChangeTracker, table: &str, op: Operation, row_id: i64) {
    if let Err(e) = tracker.log_change(table, op, row_id) {
        warn!("failed to log {op} on {table} row {row_id}: {e:#}");
    }
}

/// Bind the shared UDP broadcast port with address reuse, so several nodes
/// on one host can all listen.
fn bind_broadcast_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create broadcast socket")?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind broadcast port {port}"))?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into()).context("failed to register broadcast socket")
}
