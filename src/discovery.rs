//! One-shot bootstrap discovery, run before any background loop starts.
//!
//! The node broadcasts a probe, collects answers for a fixed window, and,
//! if any peer declares a strictly newer version, pulls a full snapshot
//! from the best one. Blocking the startup path here is deliberate: nothing
//! else is running yet, so the node cannot race itself during bootstrap.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::gossip::GossipContext;
use crate::message::Gossip;
use crate::transfer::pull_full_db;

/// How long to collect discovery responses.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(5);

/// Broadcast a probe, fill the peer directory from the answers, then catch
/// up from the newest peer if one is ahead of us.
pub async fn run(ctx: &Arc<GossipContext>) -> Result<()> {
    let local = ctx.refresh_version().await;
    info!("starting discovery at version {local}");

    let probe = Gossip::Discovery {
        version: local.clone(),
        sync_port: ctx.sync_port,
    };
    let dest = std::net::SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::BROADCAST),
        ctx.broadcast_port,
    );
    if let Err(e) = ctx.socket.send_to(&probe.encode(), dest).await {
        warn!("discovery broadcast failed: {e}");
    }

    let deadline = Instant::now() + DISCOVERY_WINDOW;
    let mut buf = [0u8; 2048];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let received = tokio::time::timeout(remaining, ctx.socket.recv_from(&mut buf)).await;
        let (n, from) = match received {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("discovery receive error: {e}");
                continue;
            }
            Err(_) => break, // window closed
        };
        if ctx.peers.is_local(from.ip()) {
            continue;
        }
        match Gossip::decode(&buf[..n]) {
            Ok(msg) => {
                debug!("discovery response from {}", from.ip());
                ctx.peers
                    .add_or_update(from.ip(), msg.version().clone(), msg.sync_port());
            }
            Err(e) => warn!("dropping discovery datagram from {from}: {e:#}"),
        }
    }

    let known = ctx.peers.len();
    match ctx.peers.best_candidate(&local) {
        Some(peer) => {
            info!(
                "discovery found {known} peers; pulling full database from {} ({})",
                peer.addr, peer.version
            );
            match pull_full_db(peer.addr, peer.sync_port, &ctx.transfer).await {
                Ok(true) => {
                    let version = ctx.refresh_version().await;
                    info!("bootstrapped to version {version}");
                }
                Ok(false) => debug!("peer {} had no database to offer", peer.addr),
                Err(e) => warn!("bootstrap pull from {} failed: {e:#}", peer.addr),
            }
        }
        None => info!("discovery found {known} peers; local database is current"),
    }
    Ok(())
}
