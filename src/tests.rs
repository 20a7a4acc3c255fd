use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::params;
use tempfile::TempDir;
use tokio::time::sleep;

use crate::message::{expect_ack, read_envelope, write_envelope, Envelope, Gossip};
use crate::node::{SyncConfig, SyncedDb};
use crate::peers::PeerDirectory;
use crate::pool::ConnectionPool;
use crate::store::TapStore;
use crate::tracker::ChangeTracker;
use crate::transfer::{pull_full_db, pull_sync, TransferContext};
use crate::types::{ChangeLogEntry, DbVersion, Operation, EPOCH_TIMESTAMP};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn db_path(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn open_tracker(dir: &TempDir, name: &str) -> ChangeTracker {
    let pool = ConnectionPool::with_size(db_path(dir, name), 2).unwrap();
    let store = TapStore::open(pool).unwrap();
    ChangeTracker::new(store).unwrap()
}

async fn start_test_node(dir: &TempDir, name: &str) -> SyncedDb {
    let mut config = SyncConfig::new(db_path(dir, name));
    config.sync_port = 0;
    config.test_mode = true;
    SyncedDb::start(config).await.unwrap()
}

fn version(hash: &str, timestamp: &str) -> DbVersion {
    DbVersion {
        hash: hash.to_string(),
        timestamp: timestamp.to_string(),
    }
}

// ---- version comparison ----

#[test]
fn test_newer_than_anything_beats_empty() {
    let empty = DbVersion::empty();
    let real = version("abc", "2024-06-01T10:00:00Z");
    assert!(real.is_newer_than(&empty));
    // An empty database is newer than another empty one by the same rule;
    // callers guard against self-comparison elsewhere.
    assert!(!empty.is_newer_than(&real));
}

#[test]
fn test_newer_than_by_timestamp() {
    let old = version("aaa", "2024-06-01T10:00:00Z");
    let new = version("bbb", "2024-06-01T10:00:01Z");
    assert!(new.is_newer_than(&old));
    assert!(!old.is_newer_than(&new));
    // Equal timestamps: neither is newer, regardless of hash.
    let same_time = version("ccc", "2024-06-01T10:00:00Z");
    assert!(!same_time.is_newer_than(&old));
    assert!(!old.is_newer_than(&same_time));
}

#[test]
fn test_version_display_truncates_on_char_boundary() {
    // A peer can declare any string as its hash; formatting it must not
    // panic even when a multibyte character straddles the cutoff.
    let multibyte = version("é🍺🍺", "2024-06-01T10:00:00Z");
    assert_eq!(format!("{multibyte}"), "é🍺🍺@2024-06-01T10:00:00Z");

    let long = version("🍺🍺🍺🍺🍺🍺🍺🍺🍺🍺", "2024-06-01T10:00:00Z");
    assert_eq!(format!("{long}"), "🍺🍺🍺🍺🍺🍺🍺🍺@2024-06-01T10:00:00Z");

    let ascii = version("0123456789abcdef", "2024-06-01T10:00:00Z");
    assert_eq!(format!("{ascii}"), "01234567@2024-06-01T10:00:00Z");
}

#[test]
fn test_newer_than_unparsable_falls_back_to_hash() {
    let garbled = version("aaa", "not a timestamp");
    let real = version("bbb", "2024-06-01T10:00:00Z");
    // Different hashes count as "worth syncing" in both directions.
    assert!(garbled.is_newer_than(&real));
    assert!(real.is_newer_than(&garbled));
    let same_hash = version("aaa", "2024-06-01T10:00:00Z");
    assert!(!garbled.is_newer_than(&same_hash));
}

// ---- wire messages ----

#[test]
fn test_gossip_roundtrip_and_rejection() {
    let msg = Gossip::Update {
        version: version("deadbeef", "2024-06-01T10:00:00Z"),
        sync_port: 5003,
    };
    let decoded = Gossip::decode(&msg.encode()).unwrap();
    assert_eq!(decoded, msg);
    assert_eq!(decoded.sync_port(), 5003);
    assert_eq!(decoded.version().hash, "deadbeef");

    assert!(Gossip::decode(b"not json").is_err());
    assert!(Gossip::decode(br#"{"type":"bogus"}"#).is_err());
    assert!(Gossip::decode(br#"{"type":"heartbeat"}"#).is_err());
}

#[tokio::test]
async fn test_envelope_framing() {
    let (mut client, mut server) = tokio::io::duplex(4096);

    let request = Envelope::SyncRequest {
        version: version("abc", "2024-06-01T10:00:00Z"),
        last_timestamp: "2024-06-01T09:00:00Z".to_string(),
        sync_port: 6000,
    };
    write_envelope(&mut client, &request).await.unwrap();
    write_envelope(&mut client, &Envelope::Ack).await.unwrap();

    let first = read_envelope(&mut server).await.unwrap();
    assert_eq!(first, request);
    expect_ack(&mut server).await.unwrap();
}

#[tokio::test]
async fn test_expect_ack_rejects_other_envelopes() {
    let (mut client, mut server) = tokio::io::duplex(4096);
    write_envelope(
        &mut client,
        &Envelope::SyncResponse {
            version: DbVersion::empty(),
            has_changes: false,
        },
    )
    .await
    .unwrap();
    assert!(expect_ack(&mut server).await.is_err());
}

// ---- peer directory ----

#[test]
fn test_peer_directory_rejects_own_addresses() {
    let own: IpAddr = "10.0.0.1".parse().unwrap();
    let other: IpAddr = "10.0.0.2".parse().unwrap();
    let dir = PeerDirectory::new([own].into_iter().collect());

    dir.add_or_update(own, DbVersion::empty(), 5003);
    assert!(dir.is_empty());

    dir.add_or_update(other, DbVersion::empty(), 5003);
    assert_eq!(dir.len(), 1);
    assert_eq!(dir.get(other).unwrap().sync_port, 5003);
}

#[test]
fn test_peer_directory_eviction() {
    let dir = PeerDirectory::new(Default::default());
    dir.add_or_update("10.0.0.2".parse().unwrap(), DbVersion::empty(), 5003);
    dir.add_or_update("10.0.0.3".parse().unwrap(), DbVersion::empty(), 5003);
    assert_eq!(dir.len(), 2);

    // A generous TTL keeps both; a zero TTL sweeps both.
    assert_eq!(dir.evict_stale(Duration::from_secs(60)), 0);
    assert_eq!(dir.len(), 2);
    assert_eq!(dir.evict_stale(Duration::ZERO), 2);
    assert!(dir.is_empty());
}

#[test]
fn test_best_candidate_picks_latest_newer_peer() {
    let dir = PeerDirectory::new(Default::default());
    let local = version("lll", "2024-06-01T10:00:00Z");

    dir.add_or_update(
        "10.0.0.2".parse().unwrap(),
        version("old", "2024-06-01T09:00:00Z"),
        5003,
    );
    assert!(dir.best_candidate(&local).is_none());

    dir.add_or_update(
        "10.0.0.3".parse().unwrap(),
        version("new1", "2024-06-01T11:00:00Z"),
        5003,
    );
    dir.add_or_update(
        "10.0.0.4".parse().unwrap(),
        version("new2", "2024-06-01T12:00:00Z"),
        5003,
    );
    let best = dir.best_candidate(&local).unwrap();
    assert_eq!(best.addr, "10.0.0.4".parse::<IpAddr>().unwrap());
}

// ---- connection pool ----

#[test]
fn test_pool_blocks_at_capacity() {
    let dir = TempDir::new().unwrap();
    let pool = ConnectionPool::with_size(db_path(&dir, "pool.db"), 2).unwrap();

    let g1 = pool.get();
    let g2 = pool.get();

    let (tx, rx) = std::sync::mpsc::channel();
    let waiter = {
        let pool = pool.clone();
        std::thread::spawn(move || {
            let guard = pool.get();
            tx.send(()).unwrap();
            drop(guard);
        })
    };

    // Both connections are out; the third request must wait.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    drop(g1);
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    waiter.join().unwrap();
    drop(g2);
}

#[test]
fn test_pool_refresh_survives_file_swap() {
    let dir = TempDir::new().unwrap();
    let live = db_path(&dir, "live.db");
    let pool = ConnectionPool::with_size(&live, 2).unwrap();
    {
        let conn = pool.get();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
    }

    // Build a replacement file with different contents and swap it in.
    let other = db_path(&dir, "other.db");
    {
        let conn = rusqlite::Connection::open(&other).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (2);")
            .unwrap();
    }
    crate::transfer::replace_database_file(&live, &other).unwrap();
    pool.refresh().unwrap();

    let conn = pool.get();
    let x: i64 = conn.query_row("SELECT x FROM t", [], |r| r.get(0)).unwrap();
    assert_eq!(x, 2);
    assert!(live.with_extension("db.bak").exists());
}

// ---- change tracking ----

#[test]
fn test_log_change_and_changes_since_window() {
    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(&dir, "track.db");
    let store = tracker.store().clone();

    // Seed entries with controlled timestamps straight into the log.
    let conn = store.pool().get();
    for (ts, row) in [
        ("2024-06-01T10:00:00Z", 1),
        ("2024-06-01T10:00:05Z", 2),
        ("2024-06-01T10:00:10Z", 3),
    ] {
        conn.execute(
            "INSERT INTO change_log (table_name, operation, row_id, timestamp, content_hash)
             VALUES ('beers', 'INSERT', ?1, ?2, 'h')",
            params![row, ts],
        )
        .unwrap();
    }
    drop(conn);

    let all = tracker.changes_since(EPOCH_TIMESTAMP).unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(
        all.iter().map(|c| c.row_id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    // The window is strictly after the cursor.
    let tail = tracker.changes_since("2024-06-01T10:00:05Z").unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].row_id, 3);
    assert!(tracker
        .changes_since("2024-06-01T10:00:10Z")
        .unwrap()
        .is_empty());
}

#[test]
fn test_log_change_bumps_version_timestamp() {
    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(&dir, "bump.db");
    let store = tracker.store().clone();

    let id = store.add_beer("Pilsner", Some(4.8), None).unwrap();
    tracker.log_change("beers", Operation::Insert, id).unwrap();

    let changes = tracker.changes_since(EPOCH_TIMESTAMP).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].table_name, "beers");
    assert_eq!(changes[0].operation, Operation::Insert);

    let version = tracker.db_version();
    assert!(!version.is_empty());
    assert_eq!(version.timestamp, changes[0].timestamp);
}

#[test]
fn test_identical_content_hashes_identically() {
    let dir = TempDir::new().unwrap();
    let a = open_tracker(&dir, "a.db");
    let b = open_tracker(&dir, "b.db");

    for tracker in [&a, &b] {
        let store = tracker.store();
        let id = store.add_beer("Stout", Some(6.0), Some("roasty")).unwrap();
        store.set_tap(1, Some(id)).unwrap();
    }

    assert_eq!(a.db_version().hash, b.db_version().hash);

    // Diverge one of them and the hashes split.
    b.store().add_beer("Saison", None, None).unwrap();
    assert_ne!(a.db_version().hash, b.db_version().hash);
}

#[test]
fn test_db_version_for_missing_file_is_empty() {
    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(&dir, "gone.db");
    fs_err::remove_file(db_path(&dir, "gone.db")).unwrap();
    assert!(tracker.db_version().is_empty());
}

#[test]
fn test_db_version_reinitializes_missing_version_row() {
    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(&dir, "row.db");
    tracker
        .store()
        .pool()
        .get()
        .execute("DELETE FROM version", [])
        .unwrap();

    let version = tracker.db_version();
    assert!(!version.is_empty());
    assert_eq!(version.timestamp, EPOCH_TIMESTAMP);

    // The row is back for the next read.
    let count: i64 = tracker
        .store()
        .pool()
        .get()
        .query_row("SELECT COUNT(*) FROM version", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_apply_changes_skips_bad_entries() {
    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(&dir, "apply.db");
    let id = tracker.store().add_beer("IPA", Some(6.5), None).unwrap();

    let good = ChangeLogEntry {
        table_name: "beers".to_string(),
        operation: Operation::Insert,
        row_id: id,
        timestamp: "2024-06-01T10:00:00Z".to_string(),
        content_hash: "h1".to_string(),
    };
    let bad = ChangeLogEntry {
        table_name: "users; DROP TABLE beers".to_string(),
        operation: Operation::Delete,
        row_id: 1,
        timestamp: "2024-06-01T10:00:01Z".to_string(),
        content_hash: "h2".to_string(),
    };

    let applied = tracker.apply_changes(&[good.clone(), bad]).unwrap();
    assert_eq!(applied, 1);

    // The applied entry was re-logged under its original timestamp, so it
    // forwards to the next peer; the bad one left no trace.
    let replayed = tracker.changes_since("2024-05-31T00:00:00Z").unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].timestamp, good.timestamp);
    assert_eq!(tracker.db_version().timestamp, good.timestamp);
}

#[test]
fn test_apply_changes_twice_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(&dir, "twice.db");
    let store = tracker.store().clone();

    let id = store.add_beer("Tripel", Some(9.0), None).unwrap();
    tracker.log_change("beers", Operation::Insert, id).unwrap();
    let changes = tracker.changes_since(EPOCH_TIMESTAMP).unwrap();

    assert_eq!(tracker.apply_changes(&changes).unwrap(), 1);
    let hash_once = tracker.db_version().hash;
    let beers_once = store.all_beers().unwrap();

    // Replaying the exact same list leaves dataset and hash untouched.
    assert_eq!(tracker.apply_changes(&changes).unwrap(), 1);
    assert_eq!(tracker.db_version().hash, hash_once);
    assert_eq!(store.all_beers().unwrap(), beers_once);
}

#[test]
fn test_prune_change_log() {
    let dir = TempDir::new().unwrap();
    let tracker = open_tracker(&dir, "prune.db");
    let store = tracker.store().clone();

    store
        .pool()
        .get()
        .execute(
            "INSERT INTO change_log (table_name, operation, row_id, timestamp, content_hash)
             VALUES ('beers', 'INSERT', 1, '2000-01-01T00:00:00Z', 'h')",
            [],
        )
        .unwrap();
    let id = store.add_beer("Fresh", None, None).unwrap();
    tracker.log_change("beers", Operation::Insert, id).unwrap();

    assert_eq!(tracker.prune_change_log(30).unwrap(), 1);
    let remaining = tracker.changes_since(EPOCH_TIMESTAMP).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].row_id, id);
}

// ---- store ----

#[test]
fn test_store_rejects_untracked_tables() {
    let dir = TempDir::new().unwrap();
    let store = open_tracker(&dir, "guard.db").store().clone();
    assert!(store.read_row("sqlite_master", 1).is_err());
    assert!(store.table_rows("version").is_err());
    assert!(store
        .write_row("beers (x); --", 1, &[], Operation::Delete)
        .is_err());
}

#[test]
fn test_row_replay_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = open_tracker(&dir, "rows.db").store().clone();
    let id = store.add_beer("Porter", Some(5.5), None).unwrap();

    let values = store.read_row("beers", id).unwrap().unwrap();
    store.delete_beer(id).unwrap();
    assert!(store.get_beer(id).unwrap().is_none());

    store
        .write_row("beers", id, &values, Operation::Insert)
        .unwrap();
    let beer = store.get_beer(id).unwrap().unwrap();
    assert_eq!(beer.name, "Porter");
    assert_eq!(beer.abv, Some(5.5));
}

// ---- node lifecycle and two-node sync ----

#[tokio::test]
async fn test_node_crud_and_stop() {
    let dir = TempDir::new().unwrap();
    let node = start_test_node(&dir, "crud.db").await;

    let id = node.add_beer("Amber", Some(5.2), Some("malty")).await.unwrap();
    assert!(node.update_beer(id, "Amber Ale", Some(5.2), None).await.unwrap());
    assert!(!node.update_beer(999, "Ghost", None, None).await.unwrap());
    node.set_tap(1, Some(id)).await.unwrap();

    let beers = node.all_beers().await.unwrap();
    assert_eq!(beers.len(), 1);
    assert_eq!(beers[0].name, "Amber Ale");
    assert_eq!(node.all_taps().await.unwrap(), vec![(1, Some(id))]);

    assert!(node.delete_beer(id).await.unwrap());
    assert!(node.all_beers().await.unwrap().is_empty());

    // Every mutation above went through the change log.
    let tracker = node.tracker().clone();
    let changes = tokio::task::spawn_blocking(move || tracker.changes_since(EPOCH_TIMESTAMP))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(changes.len(), 4);

    tokio::time::timeout(Duration::from_secs(3), node.stop())
        .await
        .expect("stop should observe shutdown promptly");
}

#[tokio::test]
async fn test_stop_with_connection_in_flight() {
    use tokio::io::AsyncWriteExt;

    let dir = TempDir::new().unwrap();
    let node = start_test_node(&dir, "inflight.db").await;

    // Open a connection and announce an envelope body that never arrives,
    // leaving the spawned handler blocked mid-read.
    let mut stream = tokio::net::TcpStream::connect((LOCALHOST, node.sync_port()))
        .await
        .unwrap();
    stream.write_u32(64).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(3), node.stop())
        .await
        .expect("stop must not wait for the stalled handler");
    drop(stream);
}

#[tokio::test]
async fn test_concurrent_pulls_leave_a_valid_database() {
    let dir = TempDir::new().unwrap();
    let source_a = start_test_node(&dir, "src_a.db").await;
    let source_b = start_test_node(&dir, "src_b.db").await;
    source_a.add_beer("Kolsch", Some(4.8), None).await.unwrap();
    source_b.add_beer("Gose", Some(4.2), None).await.unwrap();

    let dest = start_test_node(&dir, "dest.db").await;
    let ctx = TransferContext {
        tracker: dest.tracker().clone(),
        sync_port: dest.sync_port(),
    };

    // Two simultaneous snapshot pulls must each stream into their own temp
    // file; whichever replacement lands last, the live file is one intact
    // source database, never an interleaving of the two.
    let (a, b) = tokio::join!(
        pull_full_db(LOCALHOST, source_a.sync_port(), &ctx),
        pull_full_db(LOCALHOST, source_b.sync_port(), &ctx),
    );
    assert!(a.unwrap());
    assert!(b.unwrap());

    let beers = dest.all_beers().await.unwrap();
    assert_eq!(beers.len(), 1);
    assert!(beers[0].name == "Kolsch" || beers[0].name == "Gose");

    source_a.stop().await;
    source_b.stop().await;
    dest.stop().await;
}

#[tokio::test]
async fn test_add_peer_pulls_full_database() {
    let dir = TempDir::new().unwrap();
    let source = start_test_node(&dir, "source.db").await;
    let id = source.add_beer("Helles", Some(4.9), None).await.unwrap();
    source.set_tap(1, Some(id)).await.unwrap();

    let fresh = start_test_node(&dir, "fresh.db").await;
    fresh.add_peer(LOCALHOST, source.sync_port()).await.unwrap();

    let beers = fresh.all_beers().await.unwrap();
    assert_eq!(beers.len(), 1);
    assert_eq!(beers[0].name, "Helles");
    assert_eq!(fresh.all_taps().await.unwrap(), vec![(1, Some(id))]);
    assert_eq!(
        fresh.db_version().await.hash,
        source.db_version().await.hash
    );
    assert_eq!(fresh.peers().len(), 1);

    // One rolling backup of the replaced file exists.
    assert!(db_path(&dir, "fresh.db").with_extension("db.bak").exists());

    source.stop().await;
    fresh.stop().await;
}

#[tokio::test]
async fn test_pull_sync_transfers_changes() {
    let dir = TempDir::new().unwrap();
    let behind = start_test_node(&dir, "behind.db").await;

    // Timestamps have second precision; make sure the writer's changes land
    // strictly after the puller's initial version.
    sleep(Duration::from_millis(1100)).await;

    let ahead = start_test_node(&dir, "ahead.db").await;
    ahead.add_beer("Witbier", Some(4.5), None).await.unwrap();

    let ctx = TransferContext {
        tracker: behind.tracker().clone(),
        sync_port: behind.sync_port(),
    };
    let updated = pull_sync(LOCALHOST, ahead.sync_port(), &ctx).await.unwrap();
    assert!(updated);

    let beers = behind.all_beers().await.unwrap();
    assert_eq!(beers.len(), 1);
    assert_eq!(beers[0].name, "Witbier");
    assert_eq!(
        behind.db_version().await.hash,
        ahead.db_version().await.hash
    );

    // Pulling again is a no-op: the cursor has caught up.
    assert!(!pull_sync(LOCALHOST, ahead.sync_port(), &ctx).await.unwrap());

    behind.stop().await;
    ahead.stop().await;
}

#[tokio::test]
async fn test_server_pulls_back_from_newer_requester() {
    let dir = TempDir::new().unwrap();
    let stale = start_test_node(&dir, "stale.db").await;
    sleep(Duration::from_millis(1100)).await;

    let newer = start_test_node(&dir, "newer.db").await;
    newer.add_beer("Dunkel", Some(5.0), None).await.unwrap();

    // The newer node asks the stale one for changes. There are none, but the
    // stale node's listener notices the requester is ahead and pulls back.
    let ctx = TransferContext {
        tracker: newer.tracker().clone(),
        sync_port: newer.sync_port(),
    };
    let updated = pull_sync(LOCALHOST, stale.sync_port(), &ctx).await.unwrap();
    assert!(!updated);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if stale.all_beers().await.unwrap().len() == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stale node never pulled back"
        );
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(stale.all_beers().await.unwrap()[0].name, "Dunkel");

    stale.stop().await;
    newer.stop().await;
}
