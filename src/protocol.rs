//! FastDFS Protocol Encoding and Decoding
//!
//! This module handles all protocol-level encoding and decoding operations:
//! the 10-byte frame header, fixed-width body fields, the metadata codec, and
//! the typed request/response bodies exchanged between clients, trackers and
//! storage servers. Framing helpers for async streams live at the bottom.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::errors::{FastDFSError, Result};
use crate::types::*;

/// Encodes a FastDFS protocol header into a 10-byte buffer
///
/// The header format is:
///   - Bytes 0-7: Body length (8 bytes, big-endian uint64)
///   - Byte 8: Command code
///   - Byte 9: Status code (0 for request, error code for response)
pub fn encode_header(length: u64, cmd: u8, status: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(FDFS_PROTO_HEADER_LEN);
    buf.put_u64(length);
    buf.put_u8(cmd);
    buf.put_u8(status);
    buf.freeze()
}

/// Decodes a FastDFS protocol header from a buffer
///
/// The header must be at least 10 bytes long.
pub fn decode_header(data: &[u8]) -> Result<TrackerHeader> {
    if data.len() < FDFS_PROTO_HEADER_LEN {
        return Err(FastDFSError::InvalidResponse(format!(
            "Header too short: {} bytes",
            data.len()
        )));
    }

    let mut buf = &data[..FDFS_PROTO_HEADER_LEN];
    let length = buf.get_u64();
    let cmd = buf.get_u8();
    let status = buf.get_u8();

    Ok(TrackerHeader { length, cmd, status })
}

/// Splits a FastDFS file ID into its components
///
/// A file ID has the format: "groupName/path/to/file"
/// For example: "group1/M00/00/00/wKgBcFxyz.jpg"
pub fn split_file_id(file_id: &str) -> Result<(String, String)> {
    if file_id.is_empty() {
        return Err(FastDFSError::InvalidFileId(file_id.to_string()));
    }

    let parts: Vec<&str> = file_id.splitn(2, '/').collect();
    if parts.len() != 2 {
        return Err(FastDFSError::InvalidFileId(file_id.to_string()));
    }

    let group_name = parts[0];
    let remote_filename = parts[1];

    if group_name.is_empty() || group_name.len() > FDFS_GROUP_NAME_MAX_LEN {
        return Err(FastDFSError::InvalidFileId(file_id.to_string()));
    }

    if remote_filename.is_empty() {
        return Err(FastDFSError::InvalidFileId(file_id.to_string()));
    }

    Ok((group_name.to_string(), remote_filename.to_string()))
}

/// Constructs a complete file ID from its components
///
/// This is the inverse operation of split_file_id.
pub fn join_file_id(group_name: &str, remote_filename: &str) -> String {
    format!("{}/{}", group_name, remote_filename)
}

/// Encodes metadata key-value pairs into FastDFS wire format
///
/// The format uses special separators:
///   - Field separator (0x02) between key and value
///   - Record separator (0x01) between different key-value pairs
///
/// Keys are truncated to 64 bytes and values to 256 bytes if they exceed limits.
pub fn encode_metadata(metadata: &Metadata) -> Bytes {
    if metadata.is_empty() {
        return Bytes::new();
    }

    let mut buf = BytesMut::new();

    for (key, value) in metadata {
        let key_bytes = key.as_bytes();
        let value_bytes = value.as_bytes();

        let key_len = key_bytes.len().min(FDFS_MAX_META_NAME_LEN);
        let value_len = value_bytes.len().min(FDFS_MAX_META_VALUE_LEN);

        buf.put_slice(&key_bytes[..key_len]);
        buf.put_u8(FDFS_FIELD_SEPARATOR);
        buf.put_slice(&value_bytes[..value_len]);
        buf.put_u8(FDFS_RECORD_SEPARATOR);
    }

    buf.freeze()
}

/// Decodes FastDFS wire format metadata into a HashMap
///
/// Invalid records (not exactly 2 fields) are silently skipped.
pub fn decode_metadata(data: &[u8]) -> Result<Metadata> {
    if data.is_empty() {
        return Ok(HashMap::new());
    }

    let mut metadata = HashMap::new();
    let records: Vec<&[u8]> = data.split(|&b| b == FDFS_RECORD_SEPARATOR).collect();

    for record in records {
        if record.is_empty() {
            continue;
        }

        let fields: Vec<&[u8]> = record.split(|&b| b == FDFS_FIELD_SEPARATOR).collect();
        if fields.len() != 2 {
            continue;
        }

        let key = String::from_utf8_lossy(fields[0]).to_string();
        let value = String::from_utf8_lossy(fields[1]).to_string();
        metadata.insert(key, value);
    }

    Ok(metadata)
}

/// Extracts and validates the file extension from a filename
///
/// The extension is extracted without the leading dot and truncated to 6
/// characters if it exceeds the FastDFS maximum.
pub fn get_file_ext_name(filename: &str) -> String {
    let path = Path::new(filename);
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string();

    if ext.len() > FDFS_FILE_EXT_NAME_MAX_LEN {
        ext[..FDFS_FILE_EXT_NAME_MAX_LEN].to_string()
    } else {
        ext
    }
}

/// Reads the entire contents of a file from the filesystem
pub fn read_file_content(filename: &str) -> Result<Bytes> {
    let data = std::fs::read(filename)?;
    Ok(Bytes::from(data))
}

/// Writes data to a file, creating parent directories if needed
///
/// If the file already exists, it will be truncated.
pub fn write_file_content(filename: &str, data: &[u8]) -> Result<()> {
    let path = Path::new(filename);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(filename, data)?;
    Ok(())
}

/// Pads a string to a fixed length with null bytes (0x00)
///
/// If the string is longer than length, it will be truncated.
pub fn pad_string(s: &str, length: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(length);
    let bytes = s.as_bytes();
    let copy_len = bytes.len().min(length);
    buf.put_slice(&bytes[..copy_len]);
    buf.resize(length, 0);
    buf.freeze()
}

/// Removes trailing null bytes from a byte slice
///
/// This is the inverse of pad_string, used to extract strings from
/// fixed-width protocol fields.
pub fn unpad_string(data: &[u8]) -> String {
    let end = data.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
    String::from_utf8_lossy(&data[..end]).to_string()
}

/// Encodes a 64-bit integer to an 8-byte big-endian representation
pub fn encode_int64(n: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64(n);
    buf.freeze()
}

/// Decodes an 8-byte big-endian representation to a 64-bit integer
pub fn decode_int64(data: &[u8]) -> u64 {
    if data.len() < 8 {
        return 0;
    }
    let mut buf = &data[..8];
    buf.get_u64()
}

/// Encodes a 32-bit integer to a 4-byte big-endian representation
pub fn encode_int32(n: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(n);
    buf.freeze()
}

/// Decodes a 4-byte big-endian representation to a 32-bit integer
pub fn decode_int32(data: &[u8]) -> u32 {
    if data.len() < 4 {
        return 0;
    }
    let mut buf = &data[..4];
    buf.get_u32()
}

// ---------------------------------------------------------------------------
// Typed body layouts
// ---------------------------------------------------------------------------

/// STORAGE_JOIN request body length
pub const JOIN_BODY_LEN: usize = FDFS_GROUP_NAME_MAX_LEN
    + IP_ADDRESS_SIZE
    + 7 * 8
    + FDFS_VERSION_SIZE
    + FDFS_DOMAIN_NAME_MAX_SIZE
    + 2;

/// Sync-source reply body length (join reply, sync src/dest queries)
pub const SYNC_SOURCE_BODY_LEN: usize = IP_ADDRESS_SIZE + 8;

/// Heartbeat statistics body length
pub const STAT_REPORT_BODY_LEN: usize = 5 * 8 + 2 * FDFS_STAT_CATEGORY_COUNT * 8;

/// One peer-change entry in a heartbeat reply
pub const PEER_CHANGE_ENTRY_LEN: usize = 1 + IP_ADDRESS_SIZE;

/// Store-query reply body length (single endpoint)
pub const QUERY_STORE_BODY_LEN: usize = FDFS_GROUP_NAME_MAX_LEN + IP_ADDRESS_SIZE + 8 + 1;

/// Fetch-query reply body length (single endpoint, no path index)
pub const QUERY_FETCH_BODY_LEN: usize = FDFS_GROUP_NAME_MAX_LEN + IP_ADDRESS_SIZE + 8;

/// One group entry in a list-groups reply
pub const GROUP_STAT_ENTRY_LEN: usize = FDFS_GROUP_NAME_MAX_LEN + 9 * 8;

/// One server entry in a list-storages reply
pub const STORAGE_STAT_ENTRY_LEN: usize = FDFS_STORAGE_ID_MAX_SIZE
    + IP_ADDRESS_SIZE
    + 1
    + 9 * 8
    + 2 * FDFS_STAT_CATEGORY_COUNT * 8;

/// Tracker running-status body length (leader election ping)
pub const TRACKER_STATUS_BODY_LEN: usize = 1 + 8 + 8;

/// One entry in a sync-report body
pub const SYNC_REPORT_ENTRY_LEN: usize = IP_ADDRESS_SIZE + 8;

fn put_counters(buf: &mut BytesMut, counters: &StorageCounters) {
    for i in 0..FDFS_STAT_CATEGORY_COUNT {
        buf.put_u64(counters.totals[i]);
        buf.put_u64(counters.successes[i]);
    }
}

fn get_counters(buf: &mut &[u8]) -> StorageCounters {
    let mut counters = StorageCounters::default();
    for i in 0..FDFS_STAT_CATEGORY_COUNT {
        counters.totals[i] = buf.get_u64();
        counters.successes[i] = buf.get_u64();
    }
    counters
}

fn check_len(data: &[u8], expected: usize, what: &str) -> Result<()> {
    if data.len() != expected {
        return Err(FastDFSError::InvalidResponse(format!(
            "{} body length {} != {}",
            what,
            data.len(),
            expected
        )));
    }
    Ok(())
}

/// Encodes a STORAGE_JOIN request body
pub fn encode_join_request(req: &JoinRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(JOIN_BODY_LEN);
    buf.put(pad_string(&req.group_name, FDFS_GROUP_NAME_MAX_LEN));
    buf.put(pad_string(&req.ip_addr, IP_ADDRESS_SIZE));
    buf.put_u64(req.port as u64);
    buf.put_u64(req.http_port as u64);
    buf.put_u64(req.store_path_count as u64);
    buf.put_u64(req.subdir_count_per_path as u64);
    buf.put_u64(req.upload_priority as u64);
    buf.put_u64(req.join_time);
    buf.put_u64(req.up_time);
    buf.put(pad_string(&req.version, FDFS_VERSION_SIZE));
    buf.put(pad_string(&req.domain_name, FDFS_DOMAIN_NAME_MAX_SIZE));
    buf.put_u8(req.init_flag as u8);
    buf.put_u8(req.status as u8);
    buf.freeze()
}

/// Decodes a STORAGE_JOIN request body
pub fn decode_join_request(data: &[u8]) -> Result<JoinRequest> {
    check_len(data, JOIN_BODY_LEN, "join")?;

    let group_name = unpad_string(&data[..FDFS_GROUP_NAME_MAX_LEN]);
    let mut offset = FDFS_GROUP_NAME_MAX_LEN;
    let ip_addr = unpad_string(&data[offset..offset + IP_ADDRESS_SIZE]);
    offset += IP_ADDRESS_SIZE;

    let mut buf = &data[offset..];
    let port = buf.get_u64() as u16;
    let http_port = buf.get_u64() as u16;
    let store_path_count = buf.get_u64() as u32;
    let subdir_count_per_path = buf.get_u64() as u32;
    let upload_priority = buf.get_u64() as u32;
    let join_time = buf.get_u64();
    let up_time = buf.get_u64();

    offset += 7 * 8;
    let version = unpad_string(&data[offset..offset + FDFS_VERSION_SIZE]);
    offset += FDFS_VERSION_SIZE;
    let domain_name = unpad_string(&data[offset..offset + FDFS_DOMAIN_NAME_MAX_SIZE]);
    offset += FDFS_DOMAIN_NAME_MAX_SIZE;
    let init_flag = data[offset] != 0;
    let status = StorageStatus::from_u8(data[offset + 1]);

    Ok(JoinRequest {
        group_name,
        ip_addr,
        port,
        http_port,
        store_path_count,
        subdir_count_per_path,
        upload_priority,
        join_time,
        up_time,
        version,
        domain_name,
        init_flag,
        status,
    })
}

/// Encodes a sync-source reply body
pub fn encode_sync_source(src: &SyncSource) -> Bytes {
    let mut buf = BytesMut::with_capacity(SYNC_SOURCE_BODY_LEN);
    buf.put(pad_string(&src.ip_addr, IP_ADDRESS_SIZE));
    buf.put_u64(src.until_timestamp);
    buf.freeze()
}

/// Decodes a sync-source reply body; an empty body means "no sync needed"
pub fn decode_sync_source(data: &[u8]) -> Result<Option<SyncSource>> {
    if data.is_empty() {
        return Ok(None);
    }
    check_len(data, SYNC_SOURCE_BODY_LEN, "sync source")?;
    let ip_addr = unpad_string(&data[..IP_ADDRESS_SIZE]);
    let until_timestamp = decode_int64(&data[IP_ADDRESS_SIZE..]);
    Ok(Some(SyncSource { ip_addr, until_timestamp }))
}

/// Encodes a heartbeat statistics body
pub fn encode_stat_report(stat: &StatReport) -> Bytes {
    let mut buf = BytesMut::with_capacity(STAT_REPORT_BODY_LEN);
    buf.put_u64(stat.total_mb);
    buf.put_u64(stat.free_mb);
    buf.put_u64(stat.last_source_update);
    buf.put_u64(stat.last_sync_update);
    buf.put_u64(stat.last_synced_timestamp);
    put_counters(&mut buf, &stat.counters);
    buf.freeze()
}

/// Decodes a heartbeat statistics body
pub fn decode_stat_report(data: &[u8]) -> Result<StatReport> {
    check_len(data, STAT_REPORT_BODY_LEN, "stat report")?;
    let mut buf = data;
    Ok(StatReport {
        total_mb: buf.get_u64(),
        free_mb: buf.get_u64(),
        last_source_update: buf.get_u64(),
        last_sync_update: buf.get_u64(),
        last_synced_timestamp: buf.get_u64(),
        counters: get_counters(&mut buf),
    })
}

/// Encodes a heartbeat reply: the peer-status changes since the last beat
pub fn encode_peer_changes(changes: &[PeerChange]) -> Bytes {
    let mut buf = BytesMut::with_capacity(changes.len() * PEER_CHANGE_ENTRY_LEN);
    for change in changes {
        buf.put_u8(change.status as u8);
        buf.put(pad_string(&change.ip_addr, IP_ADDRESS_SIZE));
    }
    buf.freeze()
}

/// Decodes a heartbeat reply body
pub fn decode_peer_changes(data: &[u8]) -> Result<Vec<PeerChange>> {
    if data.len() % PEER_CHANGE_ENTRY_LEN != 0 {
        return Err(FastDFSError::InvalidResponse(format!(
            "peer change body length {} not a multiple of {}",
            data.len(),
            PEER_CHANGE_ENTRY_LEN
        )));
    }
    let mut changes = Vec::with_capacity(data.len() / PEER_CHANGE_ENTRY_LEN);
    for chunk in data.chunks_exact(PEER_CHANGE_ENTRY_LEN) {
        changes.push(PeerChange {
            status: StorageStatus::from_u8(chunk[0]),
            ip_addr: unpad_string(&chunk[1..]),
        });
    }
    Ok(changes)
}

/// Encodes a store-query reply body (single endpoint)
pub fn encode_query_store(group: &str, ip: &str, port: u16, path_index: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(QUERY_STORE_BODY_LEN);
    buf.put(pad_string(group, FDFS_GROUP_NAME_MAX_LEN));
    buf.put(pad_string(ip, IP_ADDRESS_SIZE));
    buf.put_u64(port as u64);
    buf.put_u8(path_index);
    buf.freeze()
}

/// Encodes a store-query reply body listing every eligible endpoint
///
/// Layout: group, port, path index, then one 16-byte ip per member (the
/// variable part sits last).
pub fn encode_query_store_all(group: &str, ips: &[String], port: u16, path_index: u8) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(FDFS_GROUP_NAME_MAX_LEN + 9 + ips.len() * IP_ADDRESS_SIZE);
    buf.put(pad_string(group, FDFS_GROUP_NAME_MAX_LEN));
    buf.put_u64(port as u64);
    buf.put_u8(path_index);
    for ip in ips {
        buf.put(pad_string(ip, IP_ADDRESS_SIZE));
    }
    buf.freeze()
}

/// Encodes a fetch-query reply body
///
/// The first endpoint occupies the fixed 40-byte prefix; for fetch-all
/// replies the remaining ACTIVE members follow as bare 16-byte ips.
pub fn encode_query_fetch(group: &str, ip: &str, port: u16, extra_ips: &[String]) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(QUERY_FETCH_BODY_LEN + extra_ips.len() * IP_ADDRESS_SIZE);
    buf.put(pad_string(group, FDFS_GROUP_NAME_MAX_LEN));
    buf.put(pad_string(ip, IP_ADDRESS_SIZE));
    buf.put_u64(port as u64);
    for ip in extra_ips {
        buf.put(pad_string(ip, IP_ADDRESS_SIZE));
    }
    buf.freeze()
}

/// Encodes one group entry for the list-groups commands
pub fn encode_group_stat(stat: &GroupStat) -> Bytes {
    let mut buf = BytesMut::with_capacity(GROUP_STAT_ENTRY_LEN);
    buf.put(pad_string(&stat.group_name, FDFS_GROUP_NAME_MAX_LEN));
    buf.put_u64(stat.total_mb);
    buf.put_u64(stat.free_mb);
    buf.put_u64(stat.server_count);
    buf.put_u64(stat.storage_port);
    buf.put_u64(stat.storage_http_port);
    buf.put_u64(stat.active_count);
    buf.put_u64(stat.current_write_server);
    buf.put_u64(stat.store_path_count);
    buf.put_u64(stat.subdir_count_per_path);
    buf.freeze()
}

/// Decodes a list-groups reply into group entries
pub fn decode_group_stats(data: &[u8]) -> Result<Vec<GroupStat>> {
    if data.len() % GROUP_STAT_ENTRY_LEN != 0 {
        return Err(FastDFSError::InvalidResponse(format!(
            "group stat body length {} not a multiple of {}",
            data.len(),
            GROUP_STAT_ENTRY_LEN
        )));
    }
    let mut stats = Vec::with_capacity(data.len() / GROUP_STAT_ENTRY_LEN);
    for chunk in data.chunks_exact(GROUP_STAT_ENTRY_LEN) {
        let group_name = unpad_string(&chunk[..FDFS_GROUP_NAME_MAX_LEN]);
        let mut buf = &chunk[FDFS_GROUP_NAME_MAX_LEN..];
        stats.push(GroupStat {
            group_name,
            total_mb: buf.get_u64(),
            free_mb: buf.get_u64(),
            server_count: buf.get_u64(),
            storage_port: buf.get_u64(),
            storage_http_port: buf.get_u64(),
            active_count: buf.get_u64(),
            current_write_server: buf.get_u64(),
            store_path_count: buf.get_u64(),
            subdir_count_per_path: buf.get_u64(),
        });
    }
    Ok(stats)
}

/// Encodes one server entry for the list-storages command
pub fn encode_storage_stat_entry(entry: &StorageStatEntry) -> Bytes {
    let mut buf = BytesMut::with_capacity(STORAGE_STAT_ENTRY_LEN);
    buf.put(pad_string(&entry.id, FDFS_STORAGE_ID_MAX_SIZE));
    buf.put(pad_string(&entry.ip_addr, IP_ADDRESS_SIZE));
    buf.put_u8(entry.status as u8);
    buf.put_u64(entry.join_time);
    buf.put_u64(entry.up_time);
    buf.put_u64(entry.total_mb);
    buf.put_u64(entry.free_mb);
    buf.put_u64(entry.upload_priority);
    buf.put_u64(entry.last_heart_beat_time);
    buf.put_u64(entry.last_source_update);
    buf.put_u64(entry.last_sync_update);
    buf.put_u64(entry.last_synced_timestamp);
    put_counters(&mut buf, &entry.counters);
    buf.freeze()
}

/// Decodes a list-storages reply into server entries
pub fn decode_storage_stat_entries(data: &[u8]) -> Result<Vec<StorageStatEntry>> {
    if data.len() % STORAGE_STAT_ENTRY_LEN != 0 {
        return Err(FastDFSError::InvalidResponse(format!(
            "storage stat body length {} not a multiple of {}",
            data.len(),
            STORAGE_STAT_ENTRY_LEN
        )));
    }
    let mut entries = Vec::with_capacity(data.len() / STORAGE_STAT_ENTRY_LEN);
    for chunk in data.chunks_exact(STORAGE_STAT_ENTRY_LEN) {
        let id = unpad_string(&chunk[..FDFS_STORAGE_ID_MAX_SIZE]);
        let mut offset = FDFS_STORAGE_ID_MAX_SIZE;
        let ip_addr = unpad_string(&chunk[offset..offset + IP_ADDRESS_SIZE]);
        offset += IP_ADDRESS_SIZE;
        let status = StorageStatus::from_u8(chunk[offset]);
        offset += 1;
        let mut buf = &chunk[offset..];
        entries.push(StorageStatEntry {
            id,
            ip_addr,
            status,
            join_time: buf.get_u64(),
            up_time: buf.get_u64(),
            total_mb: buf.get_u64(),
            free_mb: buf.get_u64(),
            upload_priority: buf.get_u64(),
            last_heart_beat_time: buf.get_u64(),
            last_source_update: buf.get_u64(),
            last_sync_update: buf.get_u64(),
            last_synced_timestamp: buf.get_u64(),
            counters: get_counters(&mut buf),
        });
    }
    Ok(entries)
}

/// Encodes a tracker running-status body (leader election ping reply)
pub fn encode_tracker_status(status: &TrackerRunningStatus) -> Bytes {
    let mut buf = BytesMut::with_capacity(TRACKER_STATUS_BODY_LEN);
    buf.put_u8(status.if_leader as u8);
    buf.put_u64(status.up_time);
    buf.put_u64(status.running_time);
    buf.freeze()
}

/// Decodes a tracker running-status body
pub fn decode_tracker_status(data: &[u8]) -> Result<TrackerRunningStatus> {
    check_len(data, TRACKER_STATUS_BODY_LEN, "tracker status")?;
    let mut buf = &data[1..];
    Ok(TrackerRunningStatus {
        if_leader: data[0] != 0,
        up_time: buf.get_u64(),
        running_time: buf.get_u64(),
    })
}

/// Encodes the per-peer synced-timestamp entries of a sync report
pub fn encode_sync_report(entries: &[(String, u64)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(entries.len() * SYNC_REPORT_ENTRY_LEN);
    for (ip, ts) in entries {
        buf.put(pad_string(ip, IP_ADDRESS_SIZE));
        buf.put_u64(*ts);
    }
    buf.freeze()
}

/// Decodes the per-peer synced-timestamp entries of a sync report
pub fn decode_sync_report(data: &[u8]) -> Result<Vec<(String, u64)>> {
    if data.len() % SYNC_REPORT_ENTRY_LEN != 0 {
        return Err(FastDFSError::InvalidResponse(format!(
            "sync report body length {} not a multiple of {}",
            data.len(),
            SYNC_REPORT_ENTRY_LEN
        )));
    }
    let mut entries = Vec::with_capacity(data.len() / SYNC_REPORT_ENTRY_LEN);
    for chunk in data.chunks_exact(SYNC_REPORT_ENTRY_LEN) {
        let ip = unpad_string(&chunk[..IP_ADDRESS_SIZE]);
        let ts = decode_int64(&chunk[IP_ADDRESS_SIZE..]);
        entries.push((ip, ts));
    }
    Ok(entries)
}

/// Encodes a per-path disk usage report body
pub fn encode_disk_usage(paths: &[(u64, u64)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + paths.len() * 16);
    buf.put_u64(paths.len() as u64);
    for (total_mb, free_mb) in paths {
        buf.put_u64(*total_mb);
        buf.put_u64(*free_mb);
    }
    buf.freeze()
}

/// Decodes a per-path disk usage report body into (total_mb, free_mb) pairs
pub fn decode_disk_usage(data: &[u8]) -> Result<Vec<(u64, u64)>> {
    if data.len() < 8 {
        return Err(FastDFSError::InvalidResponse(
            "disk usage body too short".to_string(),
        ));
    }
    let count = decode_int64(&data[..8]) as usize;
    if data.len() != 8 + count * 16 {
        return Err(FastDFSError::InvalidResponse(format!(
            "disk usage body length {} != {}",
            data.len(),
            8 + count * 16
        )));
    }
    let mut paths = Vec::with_capacity(count);
    let mut buf = &data[8..];
    for _ in 0..count {
        paths.push((buf.get_u64(), buf.get_u64()));
    }
    Ok(paths)
}

// ---------------------------------------------------------------------------
// Filename metadata encoding (internal storage-to-storage contract)
// ---------------------------------------------------------------------------

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as FILENAME_BASE64, Engine as _};

/// Length of the base64 stem of a generated filename
pub const FDFS_FILENAME_BASE64_LEN: usize = 32;

/// Raw bytes packed into a filename stem: ip(4) ts(4) size(8) rand(4) crc(4)
const FILENAME_META_RAW_LEN: usize = 24;

/// Flag bit marking an appender file inside the packed size field
const APPENDER_SIZE_FLAG: u64 = 1 << 63;

fn ip_to_u32(ip: &str) -> u32 {
    match ip.parse::<std::net::Ipv4Addr>() {
        Ok(addr) => u32::from(addr),
        // Non-IPv4 identities still need a stable 32-bit stamp.
        Err(_) => crc32fast::hash(ip.as_bytes()),
    }
}

fn u32_to_ip(n: u32) -> String {
    std::net::Ipv4Addr::from(n).to_string()
}

/// Packs creation facts into the 32-character base64 stem of a filename
pub fn encode_file_meta(
    source_ip: &str,
    create_timestamp: u64,
    file_size: u64,
    rand_tag: u32,
    crc32: u32,
    appender: bool,
) -> String {
    let mut raw = BytesMut::with_capacity(FILENAME_META_RAW_LEN);
    raw.put_u32(ip_to_u32(source_ip));
    raw.put_u32(create_timestamp as u32);
    let mut size = file_size & !APPENDER_SIZE_FLAG;
    if appender {
        size |= APPENDER_SIZE_FLAG;
    }
    raw.put_u64(size);
    raw.put_u32(rand_tag);
    raw.put_u32(crc32);
    FILENAME_BASE64.encode(&raw)
}

/// Recovers the packed creation facts from a remote filename
///
/// Accepts either a bare stem or a full remote filename such as
/// "M00/1a/2b/<stem>.ext"; slave-name suffixes after the stem are ignored.
pub fn decode_file_meta(remote_filename: &str) -> Result<FileMeta> {
    let base = remote_filename
        .rsplit('/')
        .next()
        .unwrap_or(remote_filename);
    if base.len() < FDFS_FILENAME_BASE64_LEN {
        return Err(FastDFSError::InvalidFileId(remote_filename.to_string()));
    }
    let stem = &base[..FDFS_FILENAME_BASE64_LEN];

    let raw = FILENAME_BASE64
        .decode(stem)
        .map_err(|_| FastDFSError::InvalidFileId(remote_filename.to_string()))?;
    if raw.len() != FILENAME_META_RAW_LEN {
        return Err(FastDFSError::InvalidFileId(remote_filename.to_string()));
    }

    let mut buf = &raw[..];
    let ip = buf.get_u32();
    let ts = buf.get_u32() as u64;
    let size = buf.get_u64();
    let _rand_tag = buf.get_u32();
    let crc32 = buf.get_u32();

    Ok(FileMeta {
        source_ip: u32_to_ip(ip),
        create_timestamp: ts,
        file_size: size & !APPENDER_SIZE_FLAG,
        crc32,
        appender: size & APPENDER_SIZE_FLAG != 0,
    })
}

// ---------------------------------------------------------------------------
// Async framing over raw streams (server side)
// ---------------------------------------------------------------------------

/// Reads a 10-byte frame header from a stream
///
/// Returns NetworkTimeout after `timeout_ms`; a clean EOF before any header
/// byte surfaces as an Io error with UnexpectedEof.
pub async fn read_header<R>(stream: &mut R, timeout_ms: u64) -> Result<TrackerHeader>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FDFS_PROTO_HEADER_LEN];
    match timeout(Duration::from_millis(timeout_ms), stream.read_exact(&mut buf)).await {
        Ok(Ok(_)) => decode_header(&buf),
        Ok(Err(e)) => Err(FastDFSError::Io(e)),
        Err(_) => Err(FastDFSError::NetworkTimeout("read header".to_string())),
    }
}

/// Reads exactly `len` body bytes from a stream
pub async fn read_body<R>(stream: &mut R, len: usize, timeout_ms: u64) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(Bytes::new());
    }
    let mut buf = vec![0u8; len];
    match timeout(Duration::from_millis(timeout_ms), stream.read_exact(&mut buf)).await {
        Ok(Ok(_)) => Ok(Bytes::from(buf)),
        Ok(Err(e)) => Err(FastDFSError::Io(e)),
        Err(_) => Err(FastDFSError::NetworkTimeout("read body".to_string())),
    }
}

/// Writes a complete response frame (header plus body) to a stream
pub async fn write_frame<W>(stream: &mut W, cmd: u8, status: u8, body: &[u8], timeout_ms: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(body.len() as u64, cmd, status);
    let write = async {
        stream.write_all(&header).await?;
        if !body.is_empty() {
            stream.write_all(body).await?;
        }
        stream.flush().await
    };
    match timeout(Duration::from_millis(timeout_ms), write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(FastDFSError::Io(e)),
        Err(_) => Err(FastDFSError::NetworkTimeout("write frame".to_string())),
    }
}
