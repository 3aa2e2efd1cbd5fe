//! End-to-end cluster tests
//!
//! These tests run a real tracker and one or two storage servers in-process
//! on loopback addresses and drive them through the public client: the
//! upload/download/delete cycle, replication settle between group members,
//! delete propagation, and the catch-up handshake for a late joiner.
//!
//! Group members must share the same storage port, so the two storages bind
//! the same port on 127.0.0.1 and 127.0.0.2.

use bytes::{BufMut, Bytes, BytesMut};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fastdfs::connection::Connection;
use fastdfs::errors::FastDFSError;
use fastdfs::protocol::*;
use fastdfs::storage::heartbeat;
use fastdfs::types::*;
use fastdfs::{Client, ClientConfig, StorageConfig, StorageServer, TrackerConfig, TrackerServer};

const SETTLE: Duration = Duration::from_secs(30);

async fn start_tracker(dir: &Path) -> (Arc<TrackerServer>, String) {
    let mut config = TrackerConfig::new("127.0.0.1", 0)
        .with_base_path(dir)
        .with_check_active_interval(2);
    config.startup_grace = 0;
    config.snapshot_interval = 3600;

    let server = TrackerServer::new(config).expect("tracker construction");
    let addr = server.start().await.expect("tracker bind");
    (server, addr.to_string())
}

/// Reserves a port that both loopback addresses can then bind
async fn pick_storage_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("probe bind");
    listener.local_addr().expect("probe addr").port()
}

async fn start_storage(
    dir: &Path,
    ip: &str,
    port: u16,
    tracker: &str,
) -> (Arc<StorageServer>, tokio::task::JoinHandle<()>) {
    let mut config = StorageConfig::new("group1", ip, port)
        .with_advertised_ip(ip)
        .with_trackers(vec![tracker.to_string()])
        .with_base_path(dir.join("base"))
        .with_store_paths(vec![dir.join("p0")])
        .with_heart_beat_interval(1);
    config.stat_report_interval = 2;
    config.sync_mark_flush_records = 1;

    let server = StorageServer::new(config).expect("storage construction");
    server.start().await.expect("storage bind");
    let beat = heartbeat::spawn(server.clone());
    (server, beat)
}

/// Polls until the closure yields Some, or the deadline passes
async fn wait_for<T, F, Fut>(what: &str, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = Instant::now() + SETTLE;
    loop {
        if let Some(value) = f().await {
            return value;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Waits until `ip` is listed ACTIVE in group1
async fn wait_active(client: &Client, ip: &str) {
    wait_for(&format!("{} to become ACTIVE", ip), || async {
        match client.list_storages("group1").await {
            Ok(servers) => servers
                .iter()
                .find(|s| s.ip_addr == ip && s.status == StorageStatus::Active)
                .map(|_| ()),
            Err(_) => None,
        }
    })
    .await;
}

/// Downloads a file straight from one storage, bypassing the tracker
async fn direct_download(addr: &str, filename: &str) -> Result<Bytes, FastDFSError> {
    let stream = tokio::net::TcpStream::connect(addr).await.map_err(|e| {
        FastDFSError::Network {
            operation: "connect".to_string(),
            addr: addr.to_string(),
            source: e,
        }
    })?;
    let mut conn = Connection::new(stream, addr.to_string());

    let mut body = BytesMut::new();
    body.put_u64(0);
    body.put_u64(0);
    body.put(pad_string("group1", FDFS_GROUP_NAME_MAX_LEN));
    body.put_slice(filename.as_bytes());
    conn.request(StorageCommand::DownloadFile as u8, &body, 5000)
        .await
}

/// Test the single-tracker, single-storage upload/download/delete cycle
#[tokio::test]
async fn test_upload_download_delete_cycle() {
    let tracker_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();
    let (tracker, tracker_addr) = start_tracker(tracker_dir.path()).await;
    let port = pick_storage_port().await;
    let (storage, beat) = start_storage(storage_dir.path(), "127.0.0.1", port, &tracker_addr).await;

    let client = Client::new(ClientConfig::new(vec![tracker_addr.clone()])).unwrap();
    wait_active(&client, "127.0.0.1").await;

    // Upload returns "group1/M00/..." and the bytes round-trip.
    let file_id = client
        .upload_buffer(b"Hello, World!", "txt", None)
        .await
        .expect("upload");
    assert!(file_id.starts_with("group1/M00/"));
    assert!(file_id.ends_with(".txt"));

    let data = client.download_file(&file_id).await.expect("download");
    assert_eq!(&data[..], b"Hello, World!");

    // Partial download honours offset and length.
    let data = client
        .download_file_range(&file_id, 7, 5)
        .await
        .expect("range download");
    assert_eq!(&data[..], b"World");

    // File info reflects the upload.
    let info = client.get_file_info(&file_id).await.expect("file info");
    assert_eq!(info.file_size, 13);
    assert_eq!(info.source_ip_addr, "127.0.0.1");
    assert_eq!(info.crc32, crc32fast::hash(b"Hello, World!"));

    // Delete, then the download answers not-found.
    client.delete_file(&file_id).await.expect("delete");
    let err = client.download_file(&file_id).await.unwrap_err();
    assert!(matches!(err, FastDFSError::FileNotFound(_)));

    client.close().await;
    beat.abort();
    storage.shutdown().await;
    tracker.shutdown().await;
}

/// Test the metadata merge and overwrite scenario through the client
#[tokio::test]
async fn test_metadata_merge_and_overwrite() {
    let tracker_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();
    let (tracker, tracker_addr) = start_tracker(tracker_dir.path()).await;
    let port = pick_storage_port().await;
    let (storage, beat) = start_storage(storage_dir.path(), "127.0.0.1", port, &tracker_addr).await;

    let client = Client::new(ClientConfig::new(vec![tracker_addr.clone()])).unwrap();
    wait_active(&client, "127.0.0.1").await;

    let mut initial = Metadata::new();
    initial.insert("author".to_string(), "John".to_string());
    initial.insert("year".to_string(), "2025".to_string());
    let file_id = client
        .upload_buffer(b"content", "txt", Some(&initial))
        .await
        .expect("upload with metadata");

    // Merge: author changes, year survives.
    let mut update = Metadata::new();
    update.insert("author".to_string(), "Jane".to_string());
    client
        .set_metadata(&file_id, &update, MetadataFlag::Merge)
        .await
        .expect("merge");
    let meta = client.get_metadata(&file_id).await.expect("get metadata");
    assert_eq!(meta.get("author"), Some(&"Jane".to_string()));
    assert_eq!(meta.get("year"), Some(&"2025".to_string()));

    // Overwrite: only the new pairs remain.
    client
        .set_metadata(&file_id, &update, MetadataFlag::Overwrite)
        .await
        .expect("overwrite");
    let meta = client.get_metadata(&file_id).await.expect("get metadata");
    assert_eq!(meta.len(), 1);

    client.close().await;
    beat.abort();
    storage.shutdown().await;
    tracker.shutdown().await;
}

/// Test replication between two live members: an upload settles on the peer
/// and a delete propagates
#[tokio::test]
async fn test_replication_settles_across_group() {
    let tracker_dir = tempfile::tempdir().unwrap();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (tracker, tracker_addr) = start_tracker(tracker_dir.path()).await;
    let port = pick_storage_port().await;

    let (storage_a, beat_a) = start_storage(dir_a.path(), "127.0.0.1", port, &tracker_addr).await;
    let client = Client::new(ClientConfig::new(vec![tracker_addr.clone()])).unwrap();
    wait_active(&client, "127.0.0.1").await;

    let (storage_b, beat_b) = start_storage(dir_b.path(), "127.0.0.2", port, &tracker_addr).await;
    wait_active(&client, "127.0.0.2").await;

    let payload = vec![0xABu8; 1024];
    let file_id = client
        .upload_buffer(&payload, "bin", None)
        .await
        .expect("upload");
    let (_, remote) = split_file_id(&file_id).unwrap();

    // Within the settle window both members return identical bytes.
    let addr_a = format!("127.0.0.1:{}", port);
    let addr_b = format!("127.0.0.2:{}", port);
    for addr in [&addr_a, &addr_b] {
        let data = wait_for(&format!("file to appear on {}", addr), || async {
            direct_download(addr, &remote).await.ok()
        })
        .await;
        assert_eq!(&data[..], &payload[..]);
    }

    // Delete propagates: both members answer status 2 eventually.
    client.delete_file(&file_id).await.expect("delete");
    for addr in [&addr_a, &addr_b] {
        wait_for(&format!("file to vanish from {}", addr), || async {
            match direct_download(addr, &remote).await {
                Err(FastDFSError::FileNotFound(_)) => Some(()),
                _ => None,
            }
        })
        .await;
    }

    client.close().await;
    beat_a.abort();
    beat_b.abort();
    storage_a.shutdown().await;
    storage_b.shutdown().await;
    tracker.shutdown().await;
}

/// Test the catch-up handshake: a member joining after uploads happened
/// receives the history from its elected sync source and turns ACTIVE
#[tokio::test]
async fn test_late_joiner_catches_up() {
    let tracker_dir = tempfile::tempdir().unwrap();
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (tracker, tracker_addr) = start_tracker(tracker_dir.path()).await;
    let port = pick_storage_port().await;

    let (storage_a, beat_a) = start_storage(dir_a.path(), "127.0.0.1", port, &tracker_addr).await;
    let client = Client::new(ClientConfig::new(vec![tracker_addr.clone()])).unwrap();
    wait_active(&client, "127.0.0.1").await;

    // Three files uploaded while the group has a single member.
    let mut file_ids = Vec::new();
    for i in 0..3 {
        let payload = format!("historic payload {}", i);
        let file_id = client
            .upload_buffer(payload.as_bytes(), "txt", None)
            .await
            .expect("upload");
        file_ids.push((file_id, payload));
    }

    // The late joiner must end up ACTIVE with all three files.
    let (storage_b, beat_b) = start_storage(dir_b.path(), "127.0.0.2", port, &tracker_addr).await;
    wait_active(&client, "127.0.0.2").await;

    let addr_b = format!("127.0.0.2:{}", port);
    for (file_id, payload) in &file_ids {
        let (_, remote) = split_file_id(file_id).unwrap();
        let data = wait_for(&format!("{} to reach the late joiner", remote), || async {
            direct_download(&addr_b, &remote).await.ok()
        })
        .await;
        assert_eq!(&data[..], payload.as_bytes());
    }

    // The tracker's sync matrix reflects the catch-up.
    let servers = client.list_storages("group1").await.expect("list storages");
    let joiner = servers
        .iter()
        .find(|s| s.ip_addr == "127.0.0.2")
        .expect("joiner listed");
    assert_eq!(joiner.status, StorageStatus::Active);

    client.close().await;
    beat_a.abort();
    beat_b.abort();
    storage_a.shutdown().await;
    storage_b.shutdown().await;
    tracker.shutdown().await;
}

/// Test that a fetch query excludes the only member once it goes silent
#[tokio::test]
async fn test_fetch_excludes_silent_member() {
    let tracker_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();
    let (tracker, tracker_addr) = start_tracker(tracker_dir.path()).await;
    let port = pick_storage_port().await;
    let (storage, beat) = start_storage(storage_dir.path(), "127.0.0.1", port, &tracker_addr).await;

    let client = Client::new(ClientConfig::new(vec![tracker_addr.clone()])).unwrap();
    wait_active(&client, "127.0.0.1").await;

    let file_id = client
        .upload_buffer(b"orphan", "txt", None)
        .await
        .expect("upload");

    // Kill the heartbeat; the tracker marks the member OFFLINE after
    // 2 x check_active_interval and fetch routing dries up.
    beat.abort();
    wait_for("the member to be excluded from fetch", || async {
        match client.download_file(&file_id).await {
            Err(FastDFSError::InsufficientSpace) | Err(FastDFSError::NoStorageServer) => Some(()),
            _ => None,
        }
    })
    .await;

    client.close().await;
    storage.shutdown().await;
    tracker.shutdown().await;
}
