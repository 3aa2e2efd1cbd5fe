//! Integration tests for the tracker server
//!
//! These tests run a real tracker on an ephemeral loopback port and drive it
//! with raw protocol frames, playing the storage and client roles by hand:
//! registration, heartbeats, routing queries and the liveness sweep.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;

use fastdfs::connection::Connection;
use fastdfs::errors::FastDFSError;
use fastdfs::protocol::*;
use fastdfs::types::*;
use fastdfs::{TrackerConfig, TrackerServer};

/// Starts a tracker with test-friendly intervals on an ephemeral port
async fn start_tracker(config: TrackerConfig) -> (std::sync::Arc<TrackerServer>, SocketAddr) {
    let server = TrackerServer::new(config).expect("tracker construction");
    let addr = server.start().await.expect("tracker bind");
    (server, addr)
}

fn test_config(dir: &tempfile::TempDir) -> TrackerConfig {
    let mut config = TrackerConfig::new("127.0.0.1", 0)
        .with_base_path(dir.path())
        .with_check_active_interval(1);
    config.startup_grace = 0;
    config.snapshot_interval = 3600;
    config
}

async fn connect(addr: SocketAddr) -> Connection {
    let stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    stream.set_nodelay(true).unwrap();
    Connection::new(stream, addr.to_string())
}

/// Sends STORAGE_JOIN and returns the optional sync source from the reply
async fn join_storage(addr: SocketAddr, group: &str, ip: &str) -> Option<SyncSource> {
    let req = JoinRequest {
        group_name: group.to_string(),
        ip_addr: ip.to_string(),
        port: 23000,
        http_port: 8888,
        store_path_count: 1,
        subdir_count_per_path: 256,
        upload_priority: 10,
        join_time: now_unix(),
        up_time: now_unix(),
        version: "1.0.0".to_string(),
        domain_name: String::new(),
        init_flag: true,
        status: StorageStatus::Init,
    };
    let mut conn = connect(addr).await;
    let reply = conn
        .request(TrackerCommand::StorageJoin as u8, &encode_join_request(&req), 5000)
        .await
        .expect("join");
    decode_sync_source(&reply).expect("join reply")
}

fn storage_prefix(group: &str, ip: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put(pad_string(group, FDFS_GROUP_NAME_MAX_LEN));
    buf.put(pad_string(ip, IP_ADDRESS_SIZE));
    buf
}

/// Sends STORAGE_BEAT with a stats block and returns the peer-change diff
async fn beat_storage(
    addr: SocketAddr,
    group: &str,
    ip: &str,
    free_mb: u64,
) -> Vec<PeerChange> {
    let stat = StatReport {
        total_mb: 10_000,
        free_mb,
        last_source_update: now_unix() + 10,
        ..Default::default()
    };
    let mut body = storage_prefix(group, ip);
    body.put(encode_stat_report(&stat));

    let mut conn = connect(addr).await;
    let reply = conn
        .request(TrackerCommand::StorageBeat as u8, &body, 5000)
        .await
        .expect("beat");
    decode_peer_changes(&reply).expect("beat reply")
}

/// Drives a fresh member through the status machine to ACTIVE
async fn activate_storage(addr: SocketAddr, group: &str, ip: &str, free_mb: u64) {
    join_storage(addr, group, ip).await;
    for _ in 0..4 {
        beat_storage(addr, group, ip, free_mb).await;
    }
    // A real path table so path policies have something to chew on.
    let mut body = storage_prefix(group, ip);
    body.put(encode_disk_usage(&[(10_000, free_mb)]));
    let mut conn = connect(addr).await;
    conn.request(TrackerCommand::StorageReportDiskUsage as u8, &body, 5000)
        .await
        .expect("disk usage");
}

async fn query_store(addr: SocketAddr) -> Result<Bytes, FastDFSError> {
    let mut conn = connect(addr).await;
    conn.request(
        TrackerCommand::ServiceQueryStoreWithoutGroupOne as u8,
        &[],
        5000,
    )
    .await
}

async fn query_fetch(addr: SocketAddr, group: &str, filename: &str) -> Result<Bytes, FastDFSError> {
    let mut body = BytesMut::new();
    body.put(pad_string(group, FDFS_GROUP_NAME_MAX_LEN));
    body.put_slice(filename.as_bytes());
    let mut conn = connect(addr).await;
    conn.request(TrackerCommand::ServiceQueryFetchOne as u8, &body, 5000)
        .await
}

/// Test the single-tracker single-storage store query scenario
///
/// After one storage registers and becomes ACTIVE, a store query must return
/// the 41-byte body `group(16) | ip(16) | port(8) | path_index(1)`.
#[tokio::test]
async fn test_store_query_returns_registered_storage() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_tracker(test_config(&dir)).await;

    activate_storage(addr, "group1", "127.0.0.1", 5000).await;

    let body = query_store(addr).await.expect("store query");
    assert_eq!(body.len(), QUERY_STORE_BODY_LEN);
    assert_eq!(unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]), "group1");
    assert_eq!(unpad_string(&body[16..32]), "127.0.0.1");
    assert_eq!(decode_int64(&body[32..40]), 23000);
    assert_eq!(body[40], 0);

    server.shutdown().await;
}

/// Test that an empty registry answers a store query with no space
#[tokio::test]
async fn test_store_query_on_empty_registry() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_tracker(test_config(&dir)).await;

    let err = query_store(addr).await.unwrap_err();
    // With no groups at all, the reply is ENOENT-group; the important part
    // is that no endpoint is fabricated.
    assert!(matches!(
        err,
        FastDFSError::FileNotFound(_) | FastDFSError::InsufficientSpace
    ));

    server.shutdown().await;
}

/// Test the reserved-space eligibility scenario
///
/// A member whose free space sits below the reserved threshold must not be
/// returned; with no other member the reply is ENOSPC (status 28).
#[tokio::test]
async fn test_reserved_space_excludes_only_member() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.reserved_storage_space_mb = 200;
    let (server, addr) = start_tracker(config).await;

    // The member reports only 100 MB free, below the 200 MB threshold.
    activate_storage(addr, "group1", "127.0.0.1", 100).await;

    let err = query_store(addr).await.unwrap_err();
    assert!(matches!(err, FastDFSError::InsufficientSpace));

    server.shutdown().await;
}

/// Test that a second joiner is told to sync from the first ACTIVE member
#[tokio::test]
async fn test_second_join_gets_sync_source() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_tracker(test_config(&dir)).await;

    activate_storage(addr, "group1", "127.0.0.1", 5000).await;
    let src = join_storage(addr, "group1", "127.0.0.2").await;

    let src = src.expect("second joiner needs a sync source");
    assert_eq!(src.ip_addr, "127.0.0.1");
    assert!(src.until_timestamp > 0);

    // The first member's next beat carries the newcomer in its diff.
    let changes = beat_storage(addr, "group1", "127.0.0.1", 5000).await;
    assert!(changes.iter().any(|c| c.ip_addr == "127.0.0.2"));

    server.shutdown().await;
}

/// Test the heartbeat-drop scenario: missed beats mark a member OFFLINE and
/// exclude it from fetch queries; a resumed beat brings it back
#[tokio::test]
async fn test_heartbeat_drop_marks_offline_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_tracker(test_config(&dir)).await;

    activate_storage(addr, "group1", "127.0.0.1", 5000).await;
    assert!(query_fetch(addr, "group1", "M00/00/00/x.txt").await.is_ok());

    // check_active_interval is 1s, so silence beyond 2s plus a sweep tick
    // marks the member OFFLINE.
    tokio::time::sleep(Duration::from_secs(4)).await;
    let err = query_fetch(addr, "group1", "M00/00/00/x.txt").await.unwrap_err();
    assert!(matches!(err, FastDFSError::InsufficientSpace));

    // A resumed heartbeat makes the member eligible again.
    beat_storage(addr, "group1", "127.0.0.1", 5000).await;
    assert!(query_fetch(addr, "group1", "M00/00/00/x.txt").await.is_ok());

    server.shutdown().await;
}

/// Test that ACTIVE_TEST answers an empty success frame and QUIT closes
#[tokio::test]
async fn test_active_test_and_quit() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_tracker(test_config(&dir)).await;

    let mut conn = connect(addr).await;
    let reply = conn
        .request(FDFS_PROTO_CMD_ACTIVE_TEST, &[], 5000)
        .await
        .expect("active test");
    assert!(reply.is_empty());

    // QUIT gets no reply; the server simply closes the connection.
    conn.send(&encode_header(0, FDFS_PROTO_CMD_QUIT, 0), 5000)
        .await
        .expect("quit send");
    let result = conn.receive_full(FDFS_PROTO_HEADER_LEN, 1000).await;
    assert!(result.is_err(), "no frame follows QUIT");

    server.shutdown().await;
}

/// Test that an unknown command is answered with EINVAL (status 22)
#[tokio::test]
async fn test_unknown_command_einval() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_tracker(test_config(&dir)).await;

    let mut conn = connect(addr).await;
    let err = conn.request(200, &[], 5000).await.unwrap_err();
    assert!(matches!(err, FastDFSError::InvalidArgument(_)));

    server.shutdown().await;
}

/// Test the tracker status and leader queries of a single-tracker cluster
#[tokio::test]
async fn test_single_tracker_is_its_own_leader() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_tracker(test_config(&dir)).await;

    let mut conn = connect(addr).await;
    let reply = conn
        .request(TrackerCommand::TrackerGetStatus as u8, &[], 5000)
        .await
        .expect("get status");
    let status = decode_tracker_status(&reply).expect("status body");
    assert!(status.if_leader, "a lone tracker leads itself");

    let reply = conn
        .request(TrackerCommand::TrackerGetLeader as u8, &[], 5000)
        .await
        .expect("get leader");
    assert_eq!(unpad_string(&reply[..IP_ADDRESS_SIZE]), "127.0.0.1");

    server.shutdown().await;
}

/// Test that group listings reflect registered storages
#[tokio::test]
async fn test_list_groups_and_storages() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_tracker(test_config(&dir)).await;

    activate_storage(addr, "group1", "127.0.0.1", 5000).await;

    let mut conn = connect(addr).await;
    let reply = conn
        .request(TrackerCommand::ServerListAllGroups as u8, &[], 5000)
        .await
        .expect("list groups");
    let groups = decode_group_stats(&reply).expect("group stats");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].group_name, "group1");
    assert_eq!(groups[0].server_count, 1);
    assert_eq!(groups[0].active_count, 1);
    assert_eq!(groups[0].storage_port, 23000);

    let body = pad_string("group1", FDFS_GROUP_NAME_MAX_LEN);
    let reply = conn
        .request(TrackerCommand::ServerListStorage as u8, &body, 5000)
        .await
        .expect("list storages");
    let servers = decode_storage_stat_entries(&reply).expect("storage entries");
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].ip_addr, "127.0.0.1");
    assert_eq!(servers[0].status, StorageStatus::Active);

    server.shutdown().await;
}

/// Test that the registry survives a snapshot/restart cycle
///
/// A restarted tracker knows the group immediately but lists the member as
/// OFFLINE until its heartbeats resume.
#[tokio::test]
async fn test_snapshot_restart_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let (server, addr) = start_tracker(test_config(&dir)).await;
    activate_storage(addr, "group1", "127.0.0.1", 5000).await;
    server.shutdown().await;

    let (server, addr) = start_tracker(test_config(&dir)).await;
    let mut conn = connect(addr).await;
    let body = pad_string("group1", FDFS_GROUP_NAME_MAX_LEN);
    let reply = conn
        .request(TrackerCommand::ServerListStorage as u8, &body, 5000)
        .await
        .expect("list storages after restart");
    let servers = decode_storage_stat_entries(&reply).expect("entries");
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].status, StorageStatus::Offline);

    // The member beats again and becomes eligible without re-joining.
    beat_storage(addr, "group1", "127.0.0.1", 5000).await;
    assert!(query_fetch(addr, "group1", "M00/00/00/x.txt").await.is_ok());

    server.shutdown().await;
}
