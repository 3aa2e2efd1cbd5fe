//! Tracker Registry
//!
//! In-memory group and storage-server tables. The registry is rebuilt from
//! snapshot files on startup and reconciled by storage joins and heartbeats;
//! it is the single source of truth for store/fetch routing decisions.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::errors::{FastDFSError, Result};
use crate::types::*;

/// How many status changes a group remembers for incremental heartbeat replies
const CHANGE_LOG_CAPACITY: usize = 256;

/// One storage server as the tracker sees it
#[derive(Debug, Clone)]
pub struct StorageDetail {
    pub id: String,
    pub ip_addr: String,
    pub domain_name: String,
    pub version: String,
    pub status: StorageStatus,
    pub join_time: u64,
    pub up_time: u64,
    pub upload_priority: u32,
    pub total_mb: u64,
    pub free_mb: u64,
    pub path_total_mb: Vec<u64>,
    pub path_free_mb: Vec<u64>,
    pub sync_src_id: Option<String>,
    pub sync_until_timestamp: u64,
    pub last_source_update: u64,
    pub last_sync_update: u64,
    pub last_synced_timestamp: u64,
    pub last_heart_beat_time: u64,
    pub counters: StorageCounters,
    /// Change-log sequence already delivered to this server
    pub ack_seq: u64,
    /// Per-server store-path write cursor
    pub current_write_path: u32,
}

impl StorageDetail {
    fn new(req: &JoinRequest, now: u64) -> Self {
        Self {
            id: req.ip_addr.clone(),
            ip_addr: req.ip_addr.clone(),
            domain_name: req.domain_name.clone(),
            version: req.version.clone(),
            status: StorageStatus::Init,
            join_time: if req.join_time > 0 { req.join_time } else { now },
            up_time: req.up_time,
            upload_priority: req.upload_priority,
            total_mb: 0,
            free_mb: 0,
            path_total_mb: vec![0; req.store_path_count as usize],
            path_free_mb: vec![0; req.store_path_count as usize],
            sync_src_id: None,
            sync_until_timestamp: 0,
            last_source_update: 0,
            last_sync_update: 0,
            last_synced_timestamp: 0,
            last_heart_beat_time: now,
            counters: StorageCounters::default(),
            ack_seq: 0,
            current_write_path: 0,
        }
    }

    fn stat_entry(&self) -> StorageStatEntry {
        StorageStatEntry {
            id: self.id.clone(),
            ip_addr: self.ip_addr.clone(),
            status: self.status,
            join_time: self.join_time,
            up_time: self.up_time,
            total_mb: self.total_mb,
            free_mb: self.free_mb,
            upload_priority: self.upload_priority as u64,
            last_heart_beat_time: self.last_heart_beat_time,
            last_source_update: self.last_source_update,
            last_sync_update: self.last_sync_update,
            last_synced_timestamp: self.last_synced_timestamp,
            counters: self.counters,
        }
    }
}

/// One replication group: members sharing an identical on-disk layout
#[derive(Debug)]
pub struct Group {
    pub name: String,
    pub storage_port: u16,
    pub storage_http_port: u16,
    pub store_path_count: u32,
    pub subdir_count_per_path: u32,
    pub servers: BTreeMap<String, StorageDetail>,
    /// Member write cursor for round-robin store selection
    pub current_write_server: usize,
    /// Member read cursor for round-robin fetch selection
    pub current_read_server: usize,
    /// Monotonic; bumped on every member set or state change
    pub change_count: u64,
    change_log: VecDeque<(u64, PeerChange)>,
    /// `(src, dst) ->` highest timestamp src reports having shipped to dst
    pub last_sync_timestamps: HashMap<(String, String), u64>,
}

impl Group {
    fn new(req: &JoinRequest) -> Self {
        Self {
            name: req.group_name.clone(),
            storage_port: req.port,
            storage_http_port: req.http_port,
            store_path_count: req.store_path_count,
            subdir_count_per_path: req.subdir_count_per_path,
            servers: BTreeMap::new(),
            current_write_server: 0,
            current_read_server: 0,
            change_count: 0,
            change_log: VecDeque::new(),
            last_sync_timestamps: HashMap::new(),
        }
    }

    /// Rebuilds a group shell from snapshot fields
    pub(crate) fn from_snapshot(
        name: String,
        storage_port: u16,
        storage_http_port: u16,
        store_path_count: u32,
        subdir_count_per_path: u32,
        current_write_server: usize,
    ) -> Self {
        Self {
            name,
            storage_port,
            storage_http_port,
            store_path_count,
            subdir_count_per_path,
            servers: BTreeMap::new(),
            current_write_server,
            current_read_server: 0,
            change_count: 0,
            change_log: VecDeque::new(),
            last_sync_timestamps: HashMap::new(),
        }
    }

    /// First join fixed the layout; later joins must match it exactly
    fn validate_layout(&self, req: &JoinRequest) -> Result<()> {
        if req.port != self.storage_port
            || req.store_path_count != self.store_path_count
            || req.subdir_count_per_path != self.subdir_count_per_path
        {
            return Err(FastDFSError::InvalidArgument(format!(
                "layout mismatch joining group {}: port {} path_count {} subdirs {}",
                self.name, req.port, req.store_path_count, req.subdir_count_per_path
            )));
        }
        Ok(())
    }

    /// Records a status change and bumps the change counter
    pub fn record_change(&mut self, id: &str, status: StorageStatus) {
        self.change_count += 1;
        let seq = self.change_count;
        self.change_log.push_back((
            seq,
            PeerChange {
                status,
                ip_addr: id.to_string(),
            },
        ));
        while self.change_log.len() > CHANGE_LOG_CAPACITY {
            self.change_log.pop_front();
        }
    }

    fn set_status(&mut self, id: &str, status: StorageStatus) {
        if let Some(server) = self.servers.get_mut(id) {
            if server.status != status {
                server.status = status;
                self.record_change(id, status);
            }
        }
    }

    /// Changes a server has not yet been told about, excluding its own
    ///
    /// When the server is further behind than the log reaches, the full
    /// member list is returned instead.
    fn changes_since(&mut self, id: &str) -> Vec<PeerChange> {
        let (ack_seq, oldest) = {
            let ack = self.servers.get(id).map(|s| s.ack_seq).unwrap_or(0);
            let oldest = self.change_log.front().map(|(seq, _)| *seq).unwrap_or(0);
            (ack, oldest)
        };

        let changes: Vec<PeerChange> = if ack_seq + 1 < oldest {
            self.servers
                .values()
                .filter(|s| s.id != id)
                .map(|s| PeerChange {
                    status: s.status,
                    ip_addr: s.ip_addr.clone(),
                })
                .collect()
        } else {
            self.change_log
                .iter()
                .filter(|(seq, change)| *seq > ack_seq && change.ip_addr != id)
                .map(|(_, change)| change.clone())
                .collect()
        };

        let latest = self.change_count;
        if let Some(server) = self.servers.get_mut(id) {
            server.ack_seq = latest;
        }
        changes
    }

    /// Picks the sync source for a joining member: earliest join_time among
    /// ACTIVE members, ties broken by ip then id
    pub fn elect_sync_source(&self, exclude_id: &str) -> Option<&StorageDetail> {
        self.servers
            .values()
            .filter(|s| s.id != exclude_id && s.status.is_active())
            .min_by(|a, b| {
                (a.join_time, &a.ip_addr, &a.id).cmp(&(b.join_time, &b.ip_addr, &b.id))
            })
    }

    /// Capacity is bounded by the weakest member since every member holds
    /// every file
    pub fn total_mb(&self) -> u64 {
        self.servers
            .values()
            .filter(|s| s.status.is_serving())
            .map(|s| s.total_mb)
            .min()
            .unwrap_or(0)
    }

    pub fn free_mb(&self) -> u64 {
        self.servers
            .values()
            .filter(|s| s.status.is_serving())
            .map(|s| s.free_mb)
            .min()
            .unwrap_or(0)
    }

    pub fn active_count(&self) -> usize {
        self.servers.values().filter(|s| s.status.is_active()).count()
    }

    pub fn stat(&self) -> GroupStat {
        GroupStat {
            group_name: self.name.clone(),
            total_mb: self.total_mb(),
            free_mb: self.free_mb(),
            server_count: self.servers.len() as u64,
            storage_port: self.storage_port as u64,
            storage_http_port: self.storage_http_port as u64,
            active_count: self.active_count() as u64,
            current_write_server: self.current_write_server as u64,
            store_path_count: self.store_path_count as u64,
            subdir_count_per_path: self.subdir_count_per_path as u64,
        }
    }

    /// Recomputes a destination's synced watermark as the minimum over all
    /// sources that ship to it
    fn refresh_synced_timestamp(&mut self, dst: &str) {
        let min_ts = self
            .last_sync_timestamps
            .iter()
            .filter(|((src, d), _)| d == dst && src != dst)
            .map(|(_, ts)| *ts)
            .min();
        if let Some(ts) = min_ts {
            if let Some(server) = self.servers.get_mut(dst) {
                server.last_synced_timestamp = ts;
            }
        }
    }
}

/// The tracker's registry of groups and their members
///
/// One read-write lock per group; the outer map lock is only written when a
/// group appears. Query paths hold read locks.
pub struct Registry {
    groups: RwLock<HashMap<String, Arc<RwLock<Group>>>>,
    started_at: u64,
    startup_grace: u64,
    check_active_interval: u64,
}

impl Registry {
    pub fn new(check_active_interval: u64, startup_grace: u64) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            started_at: now_unix(),
            startup_grace,
            check_active_interval,
        }
    }

    /// Whether the post-restart grace window is still open
    pub fn in_grace_window(&self) -> bool {
        now_unix() < self.started_at + self.startup_grace
    }

    /// Installs a group rebuilt from a snapshot; existing entries win
    pub(crate) fn install_group(&self, group: Group) {
        let mut groups = self.groups.write();
        groups
            .entry(group.name.clone())
            .or_insert_with(|| Arc::new(RwLock::new(group)));
    }

    pub fn group(&self, name: &str) -> Option<Arc<RwLock<Group>>> {
        self.groups.read().get(name).cloned()
    }

    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Handles STORAGE_JOIN: create-or-validate the group, upsert the member,
    /// and elect a sync source for it
    ///
    /// Returns None when the joiner is the group's first member (no history
    /// to pull); it then starts serving immediately.
    pub fn join(&self, req: &JoinRequest) -> Result<Option<SyncSource>> {
        if req.group_name.is_empty() || req.group_name.len() > FDFS_GROUP_NAME_MAX_LEN {
            return Err(FastDFSError::InvalidArgument(format!(
                "bad group name: {:?}",
                req.group_name
            )));
        }
        if req.ip_addr.is_empty() || req.store_path_count == 0 {
            return Err(FastDFSError::InvalidArgument(
                "join missing ip or store paths".to_string(),
            ));
        }

        let group = {
            let mut groups = self.groups.write();
            groups
                .entry(req.group_name.clone())
                .or_insert_with(|| Arc::new(RwLock::new(Group::new(req))))
                .clone()
        };

        let now = now_unix();
        let mut group = group.write();
        group.validate_layout(req)?;

        let is_new = !group.servers.contains_key(&req.ip_addr);
        if is_new {
            let detail = StorageDetail::new(req, now);
            group.servers.insert(req.ip_addr.clone(), detail);
            group.record_change(&req.ip_addr, StorageStatus::Init);
        } else if let Some(server) = group.servers.get_mut(&req.ip_addr) {
            server.up_time = req.up_time;
            server.version = req.version.clone();
            server.domain_name = req.domain_name.clone();
            server.upload_priority = req.upload_priority;
            server.last_heart_beat_time = now;
            // A restarted member needs the full peer picture again.
            server.ack_seq = 0;
            if server.status == StorageStatus::Offline
                || server.status == StorageStatus::Deleted
            {
                group.set_status(&req.ip_addr, StorageStatus::Init);
            }
        }

        // A member still mid-catch-up keeps its recorded source.
        if let Some(server) = group.servers.get(&req.ip_addr) {
            if matches!(
                server.status,
                StorageStatus::WaitSync | StorageStatus::Syncing
            ) {
                if let Some(src_id) = server.sync_src_id.clone() {
                    let until = server.sync_until_timestamp;
                    if let Some(src) = group.servers.get(&src_id) {
                        return Ok(Some(SyncSource {
                            ip_addr: src.ip_addr.clone(),
                            until_timestamp: until,
                        }));
                    }
                }
            }
        }

        // Only a freshly-initialised member gets a sync round; a restarted
        // steady-state member keeps serving.
        let needs_source = group
            .servers
            .get(&req.ip_addr)
            .map(|s| s.status == StorageStatus::Init)
            .unwrap_or(false);
        if !needs_source {
            return Ok(None);
        }

        match group.elect_sync_source(&req.ip_addr) {
            Some(src) => {
                let source = SyncSource {
                    ip_addr: src.ip_addr.clone(),
                    until_timestamp: now,
                };
                let src_id = src.id.clone();
                if let Some(server) = group.servers.get_mut(&req.ip_addr) {
                    server.sync_src_id = Some(src_id);
                    server.sync_until_timestamp = now;
                }
                group.set_status(&req.ip_addr, StorageStatus::WaitSync);
                Ok(Some(source))
            }
            None => {
                // First (or only live) member: it seeds the group.
                if let Some(server) = group.servers.get_mut(&req.ip_addr) {
                    server.sync_src_id = None;
                    server.sync_until_timestamp = 0;
                }
                group.set_status(&req.ip_addr, StorageStatus::Online);
                Ok(None)
            }
        }
    }

    /// Handles STORAGE_BEAT: absorb the optional stats block, advance the
    /// member's status machine, and return the peer changes it has missed
    pub fn beat(
        &self,
        group_name: &str,
        id: &str,
        stat: Option<&StatReport>,
    ) -> Result<Vec<PeerChange>> {
        let group = self
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;
        let mut group = group.write();
        let now = now_unix();
        let single_member = group.servers.len() == 1;

        let server = group
            .servers
            .get_mut(id)
            .ok_or_else(|| FastDFSError::InvalidArgument(format!("unknown storage {}", id)))?;

        server.last_heart_beat_time = now;
        if let Some(stat) = stat {
            server.total_mb = stat.total_mb;
            server.free_mb = stat.free_mb;
            server.last_source_update = stat.last_source_update;
            server.last_sync_update = stat.last_sync_update;
            server.counters = stat.counters;
        }

        let next = match server.status {
            StorageStatus::Init => Some(StorageStatus::Online),
            StorageStatus::WaitSync => Some(StorageStatus::Syncing),
            StorageStatus::Syncing => {
                // Catch-up completes when any signal shows the member has
                // crossed the cut-off: its own writes, applied replica
                // records, or the watermark its sources report.
                let until = server.sync_until_timestamp;
                if server.last_source_update >= until
                    || server.last_sync_update >= until
                    || server.last_synced_timestamp >= until
                {
                    Some(StorageStatus::Online)
                } else {
                    None
                }
            }
            StorageStatus::Online => Some(StorageStatus::Active),
            StorageStatus::Offline => {
                // Cursors still current means the member can serve reads at
                // once; otherwise it re-enters through ONLINE.
                if now.saturating_sub(server.last_synced_timestamp)
                    <= 2 * self.check_active_interval
                    || single_member
                {
                    Some(StorageStatus::Active)
                } else {
                    Some(StorageStatus::Online)
                }
            }
            _ => None,
        };
        if let Some(status) = next {
            group.set_status(id, status);
        }

        Ok(group.changes_since(id))
    }

    /// Handles the per-path disk usage report
    pub fn report_disk_usage(
        &self,
        group_name: &str,
        id: &str,
        paths: &[(u64, u64)],
    ) -> Result<()> {
        let group = self
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;
        let mut group = group.write();
        let server = group
            .servers
            .get_mut(id)
            .ok_or_else(|| FastDFSError::InvalidArgument(format!("unknown storage {}", id)))?;

        server.path_total_mb = paths.iter().map(|(t, _)| *t).collect();
        server.path_free_mb = paths.iter().map(|(_, f)| *f).collect();
        server.total_mb = server.path_total_mb.iter().sum();
        server.free_mb = server.path_free_mb.iter().sum();
        Ok(())
    }

    /// Handles STORAGE_SYNC_REPORT: src reports how far it has shipped to
    /// each peer; refreshes every destination's synced watermark
    pub fn sync_report(
        &self,
        group_name: &str,
        src_id: &str,
        entries: &[(String, u64)],
    ) -> Result<()> {
        let group = self
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;
        let mut group = group.write();

        for (dst, ts) in entries {
            let key = (src_id.to_string(), dst.clone());
            let entry = group.last_sync_timestamps.entry(key).or_insert(0);
            if *ts > *entry {
                *entry = *ts;
            }
        }
        for (dst, _) in entries {
            group.refresh_synced_timestamp(dst);
        }
        Ok(())
    }

    /// Returns the sync timestamps other members report for `dest`
    pub fn sync_timestamps_for(&self, group_name: &str, dest: &str) -> Result<Vec<(String, u64)>> {
        let group = self
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;
        let group = group.read();
        let mut entries: Vec<(String, u64)> = group
            .last_sync_timestamps
            .iter()
            .filter(|((_, dst), _)| dst == dest)
            .map(|((src, _), ts)| (src.clone(), *ts))
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// Answers the sync source recorded for `dest_id`, if it is still syncing
    pub fn sync_source_of(&self, group_name: &str, dest_id: &str) -> Result<Option<SyncSource>> {
        let group = self
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;
        let group = group.read();
        let server = group
            .servers
            .get(dest_id)
            .ok_or_else(|| FastDFSError::InvalidArgument(format!("unknown storage {}", dest_id)))?;

        if !matches!(
            server.status,
            StorageStatus::WaitSync | StorageStatus::Syncing
        ) {
            return Ok(None);
        }
        let until = server.sync_until_timestamp;
        Ok(server.sync_src_id.as_ref().and_then(|src_id| {
            group.servers.get(src_id).map(|src| SyncSource {
                ip_addr: src.ip_addr.clone(),
                until_timestamp: until,
            })
        }))
    }

    /// Handles an administrative status report
    pub fn report_status(&self, group_name: &str, id: &str, status: StorageStatus) -> Result<()> {
        let group = self
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;
        let mut group = group.write();
        if !group.servers.contains_key(id) {
            return Err(FastDFSError::InvalidArgument(format!(
                "unknown storage {}",
                id
            )));
        }
        group.set_status(id, status);
        Ok(())
    }

    /// Handles REPORT_IP_CHANGED: rebind an existing storage id to a new ip
    pub fn report_ip_changed(&self, group_name: &str, old_ip: &str, new_ip: &str) -> Result<()> {
        let group = self
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;
        let mut group = group.write();

        let mut server = group
            .servers
            .remove(old_ip)
            .ok_or_else(|| FastDFSError::InvalidArgument(format!("unknown storage {}", old_ip)))?;
        server.id = new_ip.to_string();
        server.ip_addr = new_ip.to_string();
        server.status = StorageStatus::IpChanged;
        group.servers.insert(new_ip.to_string(), server);
        group.record_change(new_ip, StorageStatus::IpChanged);
        Ok(())
    }

    /// Handles SERVER_DELETE_STORAGE: only servers no longer beating can go
    pub fn delete_storage(&self, group_name: &str, id: &str) -> Result<()> {
        let group = self
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;
        let mut group = group.write();
        let now = now_unix();

        let server = group
            .servers
            .get(id)
            .ok_or_else(|| FastDFSError::InvalidArgument(format!("unknown storage {}", id)))?;
        let recently_alive =
            now.saturating_sub(server.last_heart_beat_time) < 2 * self.check_active_interval;
        if server.status.is_serving() && recently_alive {
            return Err(FastDFSError::ServerBusy(format!(
                "storage {} is still serving",
                id
            )));
        }
        group.set_status(id, StorageStatus::Deleted);
        Ok(())
    }

    /// Marks members OFFLINE whose heartbeat is overdue
    ///
    /// Members are never removed here so mark files on their peers stay valid.
    pub fn sweep_offline(&self) -> usize {
        let now = now_unix();
        let threshold = 2 * self.check_active_interval;
        let groups: Vec<Arc<RwLock<Group>>> = self.groups.read().values().cloned().collect();

        let mut marked = 0;
        for group in groups {
            let mut group = group.write();
            let stale: Vec<String> = group
                .servers
                .values()
                .filter(|s| {
                    s.status.is_serving()
                        && now.saturating_sub(s.last_heart_beat_time) > threshold
                })
                .map(|s| s.id.clone())
                .collect();
            for id in stale {
                group.set_status(&id, StorageStatus::Offline);
                marked += 1;
            }
        }
        marked
    }

    /// Group statistics for the list commands, sorted by name
    pub fn group_stats(&self) -> Vec<GroupStat> {
        let groups = self.groups.read();
        let mut stats: Vec<GroupStat> = groups.values().map(|g| g.read().stat()).collect();
        stats.sort_by(|a, b| a.group_name.cmp(&b.group_name));
        stats
    }

    /// Server entries of one group, sorted by id
    pub fn storage_stats(&self, group_name: &str) -> Result<Vec<StorageStatEntry>> {
        let group = self
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;
        let group = group.read();
        Ok(group.servers.values().map(|s| s.stat_entry()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_req(group: &str, ip: &str, join_time: u64) -> JoinRequest {
        JoinRequest {
            group_name: group.to_string(),
            ip_addr: ip.to_string(),
            port: 23000,
            http_port: 8888,
            store_path_count: 1,
            subdir_count_per_path: 256,
            upload_priority: 10,
            join_time,
            up_time: join_time,
            version: "6.12".to_string(),
            domain_name: String::new(),
            init_flag: true,
            status: StorageStatus::Init,
        }
    }

    fn beat_to_active(registry: &Registry, group: &str, ip: &str) {
        // INIT/WAIT_SYNC -> ... -> ACTIVE takes a few beats; the stats block
        // reports the member as caught up past any sync cut-off.
        let stat = StatReport {
            last_source_update: now_unix() + 10,
            ..Default::default()
        };
        for _ in 0..4 {
            registry.beat(group, ip, Some(&stat)).unwrap();
        }
    }

    #[test]
    fn test_first_join_creates_group_without_sync_source() {
        let registry = Registry::new(30, 0);
        let src = registry.join(&join_req("group1", "10.0.0.1", 100)).unwrap();
        assert!(src.is_none());
        assert_eq!(registry.group_names(), vec!["group1".to_string()]);

        let group = registry.group("group1").unwrap();
        assert_eq!(
            group.read().servers["10.0.0.1"].status,
            StorageStatus::Online
        );
    }

    #[test]
    fn test_second_join_gets_sync_source() {
        let registry = Registry::new(30, 0);
        registry.join(&join_req("group1", "10.0.0.1", 100)).unwrap();
        beat_to_active(&registry, "group1", "10.0.0.1");

        let src = registry.join(&join_req("group1", "10.0.0.2", 500)).unwrap();
        let src = src.expect("joiner must get a sync source");
        assert_eq!(src.ip_addr, "10.0.0.1");
        assert!(src.until_timestamp > 0);

        let group = registry.group("group1").unwrap();
        assert_eq!(
            group.read().servers["10.0.0.2"].status,
            StorageStatus::WaitSync
        );
    }

    #[test]
    fn test_join_layout_mismatch_rejected() {
        let registry = Registry::new(30, 0);
        registry.join(&join_req("group1", "10.0.0.1", 100)).unwrap();

        let mut bad = join_req("group1", "10.0.0.2", 200);
        bad.store_path_count = 4;
        let err = registry.join(&bad).unwrap_err();
        assert!(matches!(err, FastDFSError::InvalidArgument(_)));
    }

    #[test]
    fn test_sync_source_election_prefers_earliest_join() {
        let registry = Registry::new(30, 0);
        for (ip, join_time) in [("10.0.0.3", 300), ("10.0.0.1", 100), ("10.0.0.2", 200)] {
            registry.join(&join_req("group1", ip, join_time)).unwrap();
            beat_to_active(&registry, "group1", ip);
        }

        let src = registry
            .join(&join_req("group1", "10.0.0.4", 900))
            .unwrap()
            .unwrap();
        assert_eq!(src.ip_addr, "10.0.0.1");
    }

    #[test]
    fn test_status_walk_to_active() {
        let registry = Registry::new(30, 0);
        registry.join(&join_req("group1", "10.0.0.1", 100)).unwrap();
        let group = registry.group("group1").unwrap();

        registry.beat("group1", "10.0.0.1", None).unwrap();
        assert_eq!(
            group.read().servers["10.0.0.1"].status,
            StorageStatus::Active
        );
    }

    #[test]
    fn test_syncing_promotes_once_caught_up() {
        let registry = Registry::new(30, 0);
        registry.join(&join_req("group1", "10.0.0.1", 100)).unwrap();
        beat_to_active(&registry, "group1", "10.0.0.1");
        registry.join(&join_req("group1", "10.0.0.2", 500)).unwrap();
        let group = registry.group("group1").unwrap();
        let until = group.read().servers["10.0.0.2"].sync_until_timestamp;

        // WAIT_SYNC -> SYNCING
        registry.beat("group1", "10.0.0.2", None).unwrap();
        assert_eq!(
            group.read().servers["10.0.0.2"].status,
            StorageStatus::Syncing
        );

        // Still behind the cut-off: stays SYNCING
        let mut stat = StatReport {
            last_source_update: until.saturating_sub(1),
            ..Default::default()
        };
        registry.beat("group1", "10.0.0.2", Some(&stat)).unwrap();
        assert_eq!(
            group.read().servers["10.0.0.2"].status,
            StorageStatus::Syncing
        );

        // Crossed the cut-off: ONLINE, then ACTIVE
        stat.last_source_update = until;
        registry.beat("group1", "10.0.0.2", Some(&stat)).unwrap();
        assert_eq!(
            group.read().servers["10.0.0.2"].status,
            StorageStatus::Online
        );
        registry.beat("group1", "10.0.0.2", Some(&stat)).unwrap();
        assert_eq!(
            group.read().servers["10.0.0.2"].status,
            StorageStatus::Active
        );
    }

    #[test]
    fn test_beat_reports_peer_changes_once() {
        let registry = Registry::new(30, 0);
        registry.join(&join_req("group1", "10.0.0.1", 100)).unwrap();
        beat_to_active(&registry, "group1", "10.0.0.1");

        registry.join(&join_req("group1", "10.0.0.2", 500)).unwrap();

        let changes = registry.beat("group1", "10.0.0.1", None).unwrap();
        assert!(changes.iter().any(|c| c.ip_addr == "10.0.0.2"));

        let changes = registry.beat("group1", "10.0.0.1", None).unwrap();
        assert!(changes.iter().all(|c| c.ip_addr != "10.0.0.2"));
    }

    #[test]
    fn test_sweep_marks_overdue_offline() {
        let registry = Registry::new(30, 0);
        registry.join(&join_req("group1", "10.0.0.1", 100)).unwrap();
        registry.beat("group1", "10.0.0.1", None).unwrap();

        let group = registry.group("group1").unwrap();
        group
            .write()
            .servers
            .get_mut("10.0.0.1")
            .unwrap()
            .last_heart_beat_time = now_unix() - 61;

        assert_eq!(registry.sweep_offline(), 1);
        assert_eq!(
            group.read().servers["10.0.0.1"].status,
            StorageStatus::Offline
        );

        // A resumed heartbeat brings it back.
        registry.beat("group1", "10.0.0.1", None).unwrap();
        assert_ne!(
            group.read().servers["10.0.0.1"].status,
            StorageStatus::Offline
        );
    }

    #[test]
    fn test_sync_report_updates_matrix_and_watermark() {
        let registry = Registry::new(30, 0);
        registry.join(&join_req("group1", "10.0.0.1", 100)).unwrap();
        beat_to_active(&registry, "group1", "10.0.0.1");
        registry.join(&join_req("group1", "10.0.0.2", 500)).unwrap();

        registry
            .sync_report("group1", "10.0.0.1", &[("10.0.0.2".to_string(), 700)])
            .unwrap();

        let group = registry.group("group1").unwrap();
        let group = group.read();
        assert_eq!(
            group.last_sync_timestamps[&("10.0.0.1".to_string(), "10.0.0.2".to_string())],
            700
        );
        assert_eq!(group.servers["10.0.0.2"].last_synced_timestamp, 700);
    }

    #[test]
    fn test_delete_storage_refuses_live_member() {
        let registry = Registry::new(30, 0);
        registry.join(&join_req("group1", "10.0.0.1", 100)).unwrap();
        registry.beat("group1", "10.0.0.1", None).unwrap();

        let err = registry.delete_storage("group1", "10.0.0.1").unwrap_err();
        assert!(matches!(err, FastDFSError::ServerBusy(_)));

        let group = registry.group("group1").unwrap();
        group
            .write()
            .servers
            .get_mut("10.0.0.1")
            .unwrap()
            .last_heart_beat_time = 0;
        registry.delete_storage("group1", "10.0.0.1").unwrap();
        assert_eq!(
            group.read().servers["10.0.0.1"].status,
            StorageStatus::Deleted
        );
    }
}
