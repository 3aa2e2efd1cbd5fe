//! Registry Snapshots
//!
//! The tracker registry is periodically flushed to three text files under the
//! base path and rebuilt from them on startup. Files are written to a
//! temporary name and renamed into place so readers never observe a torn
//! snapshot. Members loaded from disk start OFFLINE and are brought back by
//! their own heartbeats.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::{FastDFSError, Result};
use crate::tracker::registry::{Group, Registry, StorageDetail};
use crate::types::{StorageCounters, StorageStatus};

pub const GROUPS_FILE: &str = "storage_groups.dat";
pub const SERVERS_FILE: &str = "storage_servers.dat";
pub const SYNC_TIMESTAMP_FILE: &str = "storage_sync_timestamp.dat";

/// Writes `content` to `path` atomically via a temporary sibling
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Flushes the registry to the three snapshot files
pub fn save(registry: &Registry, base_path: &Path) -> Result<()> {
    fs::create_dir_all(base_path)?;

    let mut groups_out = String::new();
    let mut servers_out = String::new();
    let mut sync_out = String::new();

    for name in registry.group_names() {
        let group = match registry.group(&name) {
            Some(g) => g,
            None => continue,
        };
        let group = group.read();

        groups_out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            group.name,
            group.storage_port,
            group.storage_http_port,
            group.store_path_count,
            group.subdir_count_per_path,
            group.current_write_server,
        ));

        for server in group.servers.values() {
            servers_out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
                group.name,
                server.id,
                server.ip_addr,
                server.status as u8,
                server.join_time,
                server.up_time,
                server.upload_priority,
                server.total_mb,
                server.free_mb,
                server.sync_src_id.as_deref().unwrap_or(""),
                server.sync_until_timestamp,
                server.last_source_update,
                server.last_sync_update,
                server.last_synced_timestamp,
                server.version,
                server.domain_name,
            ));
        }

        let mut pairs: Vec<(&(String, String), &u64)> =
            group.last_sync_timestamps.iter().collect();
        pairs.sort();
        for ((src, dst), ts) in pairs {
            sync_out.push_str(&format!("{},{},{},{}\n", group.name, src, dst, ts));
        }
    }

    write_atomic(&base_path.join(GROUPS_FILE), &groups_out)?;
    write_atomic(&base_path.join(SERVERS_FILE), &servers_out)?;
    write_atomic(&base_path.join(SYNC_TIMESTAMP_FILE), &sync_out)?;
    Ok(())
}

fn parse_err(file: &str, line_no: usize) -> FastDFSError {
    FastDFSError::InvalidArgument(format!("{} line {} is malformed", file, line_no))
}

/// Rebuilds the registry from snapshot files, if they exist
///
/// Missing files are not an error: a fresh tracker simply starts empty.
pub fn load(registry: &Registry, base_path: &Path) -> Result<()> {
    let groups_path: PathBuf = base_path.join(GROUPS_FILE);
    if !groups_path.exists() {
        info!(path = %base_path.display(), "no tracker snapshot, starting empty");
        return Ok(());
    }

    for (line_no, line) in fs::read_to_string(&groups_path)?.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 6 {
            return Err(parse_err(GROUPS_FILE, line_no + 1));
        }
        let group = Group::from_snapshot(
            fields[0].to_string(),
            fields[1].parse().map_err(|_| parse_err(GROUPS_FILE, line_no + 1))?,
            fields[2].parse().map_err(|_| parse_err(GROUPS_FILE, line_no + 1))?,
            fields[3].parse().map_err(|_| parse_err(GROUPS_FILE, line_no + 1))?,
            fields[4].parse().map_err(|_| parse_err(GROUPS_FILE, line_no + 1))?,
            fields[5].parse().map_err(|_| parse_err(GROUPS_FILE, line_no + 1))?,
        );
        registry.install_group(group);
    }

    let servers_path = base_path.join(SERVERS_FILE);
    if servers_path.exists() {
        for (line_no, line) in fs::read_to_string(&servers_path)?.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() != 16 {
                return Err(parse_err(SERVERS_FILE, line_no + 1));
            }
            let group = match registry.group(fields[0]) {
                Some(g) => g,
                None => {
                    warn!(group = fields[0], "snapshot server without group, skipping");
                    continue;
                }
            };

            let parse = |i: usize| -> Result<u64> {
                fields[i]
                    .parse()
                    .map_err(|_| parse_err(SERVERS_FILE, line_no + 1))
            };

            let loaded_status = StorageStatus::from_u8(parse(3)? as u8);
            // Live statuses decay to OFFLINE until the member beats again.
            let status = if loaded_status.is_serving() {
                StorageStatus::Offline
            } else {
                loaded_status
            };

            let detail = StorageDetail {
                id: fields[1].to_string(),
                ip_addr: fields[2].to_string(),
                domain_name: fields[15].to_string(),
                version: fields[14].to_string(),
                status,
                join_time: parse(4)?,
                up_time: parse(5)?,
                upload_priority: parse(6)? as u32,
                total_mb: parse(7)?,
                free_mb: parse(8)?,
                path_total_mb: Vec::new(),
                path_free_mb: Vec::new(),
                sync_src_id: if fields[9].is_empty() {
                    None
                } else {
                    Some(fields[9].to_string())
                },
                sync_until_timestamp: parse(10)?,
                last_source_update: parse(11)?,
                last_sync_update: parse(12)?,
                last_synced_timestamp: parse(13)?,
                last_heart_beat_time: 0,
                counters: StorageCounters::default(),
                ack_seq: 0,
                current_write_path: 0,
            };

            let mut group = group.write();
            let id = detail.id.clone();
            group.servers.insert(id.clone(), detail);
            group.record_change(&id, status);
        }
    }

    let sync_path = base_path.join(SYNC_TIMESTAMP_FILE);
    if sync_path.exists() {
        for (line_no, line) in fs::read_to_string(&sync_path)?.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() != 4 {
                return Err(parse_err(SYNC_TIMESTAMP_FILE, line_no + 1));
            }
            if let Some(group) = registry.group(fields[0]) {
                let ts: u64 = fields[3]
                    .parse()
                    .map_err(|_| parse_err(SYNC_TIMESTAMP_FILE, line_no + 1))?;
                group
                    .write()
                    .last_sync_timestamps
                    .insert((fields[1].to_string(), fields[2].to_string()), ts);
            }
        }
    }

    info!(
        groups = registry.group_count(),
        "tracker registry restored from snapshot"
    );
    Ok(())
}
