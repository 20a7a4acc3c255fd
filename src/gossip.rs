//! Steady-state background activity.
//!
//! Four loops run for the life of the node: the broadcast listener, the
//! heartbeat sender, the peer-directory sweep, and the TCP sync listener.
//! All are cancelled through one watch channel and exit within roughly a
//! second of `stop()`. Nothing in here is fatal; every loop body catches,
//! logs and keeps going.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::spawn_blocking;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::message::Gossip;
use crate::peers::{PeerDirectory, PEER_TTL};
use crate::transfer::{pull_sync, serve_connection, TransferContext};
use crate::types::DbVersion;

/// Period of the heartbeat and cleanup loops.
pub const GOSSIP_PERIOD: Duration = Duration::from_secs(5);

/// Shared state every gossip loop needs.
pub struct GossipContext {
    pub socket: Arc<UdpSocket>,
    pub broadcast_port: u16,
    pub sync_port: u16,
    pub peers: Arc<PeerDirectory>,
    pub transfer: TransferContext,
    /// Cached local version; refreshed after every local write and sync.
    pub version: RwLock<DbVersion>,
}

impl GossipContext {
    pub fn current_version(&self) -> DbVersion {
        self.version.read().expect("version lock poisoned").clone()
    }

    /// Recompute the version from the database and publish it.
    pub async fn refresh_version(&self) -> DbVersion {
        let tracker = self.transfer.tracker.clone();
        let version = spawn_blocking(move || tracker.db_version())
            .await
            .unwrap_or_else(|_| DbVersion::empty());
        *self.version.write().expect("version lock poisoned") = version.clone();
        version
    }

    fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.broadcast_port)
    }

    async fn send_gossip(&self, msg: &Gossip, dest: SocketAddr) -> bool {
        match self.socket.send_to(&msg.encode(), dest).await {
            Ok(_) => true,
            Err(e) => {
                debug!("failed to send gossip to {dest}: {e}");
                false
            }
        }
    }
}

/// React to one datagram from the broadcast port. Local senders are ignored;
/// everything else refreshes the peer directory, and an update datagram with
/// a different version triggers a pull from its sender.
async fn handle_datagram(ctx: &Arc<GossipContext>, buf: &[u8], from: SocketAddr) {
    let msg = match Gossip::decode(buf) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("dropping datagram from {from}: {e:#}");
            return;
        }
    };
    if ctx.peers.is_local(from.ip()) {
        return;
    }

    ctx.peers
        .add_or_update(from.ip(), msg.version().clone(), msg.sync_port());

    match msg {
        Gossip::Discovery { .. } => {
            // Answer directly so the prober learns us inside its window.
            let reply = Gossip::Heartbeat {
                version: ctx.current_version(),
                sync_port: ctx.sync_port,
            };
            ctx.send_gossip(&reply, from).await;
        }
        Gossip::Update { version, sync_port } => {
            if version != ctx.current_version() {
                info!("peer {} advertises version {version}, pulling", from.ip());
                let ctx = Arc::clone(ctx);
                tokio::spawn(async move {
                    match pull_sync(from.ip(), sync_port, &ctx.transfer).await {
                        Ok(true) => {
                            ctx.refresh_version().await;
                        }
                        Ok(false) => {}
                        Err(e) => warn!("pull from {} failed: {e:#}", from.ip()),
                    }
                });
            }
        }
        Gossip::Heartbeat { .. } => {}
    }
}

/// Receive datagrams on the shared broadcast port until shutdown.
pub async fn broadcast_listener(ctx: Arc<GossipContext>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = [0u8; 2048];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = ctx.socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => handle_datagram(&ctx, &buf[..n], from).await,
                Err(e) => {
                    warn!("broadcast receive error: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            },
        }
    }
    debug!("broadcast listener stopped");
}

/// Broadcast a heartbeat every period, unconditionally.
pub async fn heartbeat_loop(ctx: Arc<GossipContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(GOSSIP_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let msg = Gossip::Heartbeat {
                    version: ctx.current_version(),
                    sync_port: ctx.sync_port,
                };
                ctx.send_gossip(&msg, ctx.broadcast_addr()).await;
            }
        }
    }
    debug!("heartbeat sender stopped");
}

/// Sweep stale peers every period.
pub async fn cleanup_loop(ctx: Arc<GossipContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(GOSSIP_PERIOD);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let evicted = ctx.peers.evict_stale(PEER_TTL);
                if evicted > 0 {
                    debug!("evicted {evicted} stale peers");
                }
            }
        }
    }
    debug!("peer cleanup stopped");
}

/// Accept sync connections and spawn one handler per connection. Handler
/// failures never reach the accept loop.
pub async fn sync_listener(
    listener: TcpListener,
    ctx: Arc<GossipContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    match serve_connection(stream, peer, ctx.transfer.clone(), &ctx.peers).await {
                        Ok(Some((addr, sync_port))) => {
                            // The requester is ahead of us; pull from it.
                            info!("requester {addr} is newer, pulling back");
                            match pull_sync(addr, sync_port, &ctx.transfer).await {
                                Ok(true) => {
                                    ctx.refresh_version().await;
                                }
                                Ok(false) => {}
                                Err(e) => warn!("pull-back from {addr} failed: {e:#}"),
                            }
                        }
                        Ok(None) => {}
                        Err(e) => error!("sync handler for {peer} failed: {e:#}"),
                    }
                });
            }
        }
    }
    debug!("sync listener stopped");
}

/// Tell the world about a local write.
///
/// Recomputes the version, broadcasts an update, and best-effort sends the
/// same datagram straight to every known peer. When not a single datagram
/// goes out but peers are known, falls back to a direct TCP sync request to
/// each of them: the server side registers us from the request and pulls
/// back if we are newer, so convergence survives a broadcast-deaf network.
pub async fn notify_update(ctx: &Arc<GossipContext>) {
    let version = ctx.refresh_version().await;
    let msg = Gossip::Update {
        version: version.clone(),
        sync_port: ctx.sync_port,
    };

    let mut sent = 0usize;
    if ctx.send_gossip(&msg, ctx.broadcast_addr()).await {
        sent += 1;
    }
    let peers = ctx.peers.peers();
    for peer in &peers {
        let dest = SocketAddr::new(peer.addr, ctx.broadcast_port);
        if ctx.send_gossip(&msg, dest).await {
            sent += 1;
        }
    }
    info!("notified peers of update to {version} ({sent} datagrams)");

    if sent == 0 && !peers.is_empty() {
        warn!("no update datagrams went out; contacting peers over TCP");
        for peer in &peers {
            match pull_sync(peer.addr, peer.sync_port, &ctx.transfer).await {
                Ok(true) => {
                    ctx.refresh_version().await;
                }
                Ok(false) => {}
                Err(e) => warn!("direct sync with {} failed: {e:#}", peer.addr),
            }
        }
    }
}
