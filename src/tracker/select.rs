//! Store and Fetch Selection
//!
//! Routing decisions for client queries: which group, which member, which
//! store path. Every policy is deterministic given the registry state so
//! consecutive queries behave predictably under test.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{StoreLookup, StorePathPolicy, StoreServerPolicy, TrackerConfig};
use crate::errors::{FastDFSError, Result};
use crate::protocol::decode_file_meta;
use crate::tracker::registry::{Group, Registry, StorageDetail};
use crate::types::StorageStatus;

/// A write destination chosen for a store query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSelection {
    pub group_name: String,
    pub ip_addr: String,
    pub port: u16,
    pub store_path_index: u8,
}

/// A read destination chosen for a fetch or update query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSelection {
    pub group_name: String,
    pub ip_addr: String,
    pub port: u16,
    pub extra_ips: Vec<String>,
}

/// Applies the configured selection policies against the registry
pub struct StoreSelector {
    store_lookup: StoreLookup,
    store_group: String,
    store_server: StoreServerPolicy,
    store_path: StorePathPolicy,
    reserved_mb: u64,
    group_cursor: AtomicUsize,
}

impl StoreSelector {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            store_lookup: config.store_lookup,
            store_group: config.store_group.clone(),
            store_server: config.store_server,
            store_path: config.store_path,
            reserved_mb: config.reserved_storage_space_mb,
            group_cursor: AtomicUsize::new(0),
        }
    }

    fn eligible(&self, server: &StorageDetail) -> bool {
        server.status.is_active() && server.free_mb >= self.reserved_mb
    }

    /// Picks a write destination
    ///
    /// With a client-supplied group the choice is confined to it; otherwise
    /// the lookup policy chooses the group, skipping groups with no eligible
    /// member. No eligible member anywhere means the cluster is out of space.
    pub fn select_store(
        &self,
        registry: &Registry,
        group_name: Option<&str>,
    ) -> Result<StoreSelection> {
        for name in self.candidate_groups(registry, group_name)? {
            let group = match registry.group(&name) {
                Some(g) => g,
                None => continue,
            };
            let mut group = group.write();
            if let Some(selection) = self.select_in_group(&mut group) {
                return Ok(selection);
            }
            if group_name.is_some() {
                break;
            }
        }
        Err(FastDFSError::InsufficientSpace)
    }

    /// Picks a write destination and lists every other eligible member
    pub fn select_store_all(
        &self,
        registry: &Registry,
        group_name: Option<&str>,
    ) -> Result<(StoreSelection, Vec<String>)> {
        let selection = self.select_store(registry, group_name)?;
        let group = registry
            .group(&selection.group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(selection.group_name.clone()))?;
        let group = group.read();
        let ips = group
            .servers
            .values()
            .filter(|s| self.eligible(s))
            .map(|s| s.ip_addr.clone())
            .collect();
        Ok((selection, ips))
    }

    fn candidate_groups(
        &self,
        registry: &Registry,
        group_name: Option<&str>,
    ) -> Result<Vec<String>> {
        if let Some(name) = group_name {
            if registry.group(name).is_none() {
                return Err(FastDFSError::GroupNotFound(name.to_string()));
            }
            return Ok(vec![name.to_string()]);
        }

        let names = registry.group_names();
        if names.is_empty() {
            return Err(FastDFSError::GroupNotFound("*".to_string()));
        }

        match self.store_lookup {
            StoreLookup::SpecGroup if !self.store_group.is_empty() => {
                if registry.group(&self.store_group).is_none() {
                    return Err(FastDFSError::GroupNotFound(self.store_group.clone()));
                }
                Ok(vec![self.store_group.clone()])
            }
            StoreLookup::LoadBalance => {
                let mut by_free: Vec<(u64, String)> = names
                    .into_iter()
                    .filter_map(|name| {
                        registry
                            .group(&name)
                            .map(|g| (g.read().free_mb(), name))
                    })
                    .collect();
                by_free.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                Ok(by_free.into_iter().map(|(_, name)| name).collect())
            }
            // RoundRobin, and SpecGroup without a configured group
            _ => {
                let start = self.group_cursor.fetch_add(1, Ordering::Relaxed) % names.len();
                let mut rotated = Vec::with_capacity(names.len());
                rotated.extend_from_slice(&names[start..]);
                rotated.extend_from_slice(&names[..start]);
                Ok(rotated)
            }
        }
    }

    fn select_in_group(&self, group: &mut Group) -> Option<StoreSelection> {
        let ids: Vec<String> = group.servers.keys().cloned().collect();
        if ids.is_empty() {
            return None;
        }

        let chosen_id = match self.store_server {
            StoreServerPolicy::RoundRobin => {
                let start = group.current_write_server % ids.len();
                let mut found = None;
                for step in 0..ids.len() {
                    let idx = (start + step) % ids.len();
                    if self.eligible(&group.servers[&ids[idx]]) {
                        group.current_write_server = idx + 1;
                        found = Some(ids[idx].clone());
                        break;
                    }
                }
                found?
            }
            StoreServerPolicy::FirstAlive => ids
                .iter()
                .find(|id| self.eligible(&group.servers[*id]))?
                .clone(),
            StoreServerPolicy::Priority => ids
                .iter()
                .filter(|id| self.eligible(&group.servers[*id]))
                .min_by_key(|id| (group.servers[*id].upload_priority, (*id).clone()))?
                .clone(),
        };

        let group_name = group.name.clone();
        let port = group.storage_port;
        let server = group.servers.get_mut(&chosen_id)?;
        let path_count = server.path_free_mb.len().max(1);

        let path_index = match self.store_path {
            StorePathPolicy::RoundRobin => {
                let idx = server.current_write_path as usize % path_count;
                server.current_write_path = ((idx + 1) % path_count) as u32;
                idx
            }
            StorePathPolicy::MostFree => server
                .path_free_mb
                .iter()
                .enumerate()
                .max_by_key(|&(idx, &free)| (free, std::cmp::Reverse(idx)))
                .map(|(idx, _)| idx)
                .unwrap_or(0),
        };

        Some(StoreSelection {
            group_name,
            ip_addr: server.ip_addr.clone(),
            port,
            store_path_index: path_index as u8,
        })
    }

    /// Picks one ACTIVE member of the file's group for a download
    pub fn select_fetch(
        &self,
        registry: &Registry,
        group_name: &str,
        all: bool,
    ) -> Result<FetchSelection> {
        let group = registry
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;
        let mut group = group.write();

        let ids: Vec<String> = group
            .servers
            .values()
            .filter(|s| s.status.is_active())
            .map(|s| s.id.clone())
            .collect();
        if ids.is_empty() {
            return Err(FastDFSError::NoStorageServer);
        }

        let idx = group.current_read_server % ids.len();
        group.current_read_server = idx + 1;
        let first = ids[idx].clone();

        let extra_ips = if all {
            ids.iter().filter(|id| **id != first).cloned().collect()
        } else {
            Vec::new()
        };

        Ok(FetchSelection {
            group_name: group_name.to_string(),
            ip_addr: group.servers[&first].ip_addr.clone(),
            port: group.storage_port,
            extra_ips,
        })
    }

    /// Picks the member allowed to mutate an existing file
    ///
    /// The creator embedded in the filename wins while it is ACTIVE; when it
    /// is not, any ACTIVE member can apply the update.
    pub fn select_update(
        &self,
        registry: &Registry,
        group_name: &str,
        remote_filename: &str,
    ) -> Result<FetchSelection> {
        let group = registry
            .group(group_name)
            .ok_or_else(|| FastDFSError::GroupNotFound(group_name.to_string()))?;

        if let Ok(meta) = decode_file_meta(remote_filename) {
            let group_read = group.read();
            if let Some(server) = group_read.servers.get(&meta.source_ip) {
                if server.status == StorageStatus::Active {
                    return Ok(FetchSelection {
                        group_name: group_name.to_string(),
                        ip_addr: server.ip_addr.clone(),
                        port: group_read.storage_port,
                        extra_ips: Vec::new(),
                    });
                }
            }
        }

        self.select_fetch(registry, group_name, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JoinRequest, StatReport, StorageStatus};

    fn selector(config: TrackerConfig) -> StoreSelector {
        StoreSelector::new(&config)
    }

    fn populated_registry(ips: &[&str]) -> Registry {
        let registry = Registry::new(30, 0);
        for (i, ip) in ips.iter().enumerate() {
            let req = JoinRequest {
                group_name: "group1".to_string(),
                ip_addr: ip.to_string(),
                port: 23000,
                http_port: 8888,
                store_path_count: 1,
                subdir_count_per_path: 256,
                upload_priority: 10,
                join_time: 100 + i as u64,
                up_time: 100 + i as u64,
                version: "6.12".to_string(),
                domain_name: String::new(),
                init_flag: true,
                status: StorageStatus::Init,
            };
            registry.join(&req).unwrap();
            let stat = StatReport {
                total_mb: 10_000,
                free_mb: 5_000,
                last_source_update: crate::types::now_unix() + 10,
                ..Default::default()
            };
            for _ in 0..4 {
                registry.beat("group1", ip, Some(&stat)).unwrap();
            }
            // Give the member a real path table for path selection.
            registry
                .report_disk_usage("group1", ip, &[(10_000, 5_000)])
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_round_robin_visits_each_member_once_per_cycle() {
        let registry = populated_registry(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let sel = selector(TrackerConfig::default());

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(sel.select_store(&registry, None).unwrap().ip_addr);
        }
        seen.sort();
        assert_eq!(seen, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        // Second cycle repeats the rotation.
        let again = sel.select_store(&registry, None).unwrap().ip_addr;
        assert!(["10.0.0.1", "10.0.0.2", "10.0.0.3"].contains(&again.as_str()));
    }

    #[test]
    fn test_reserved_space_excludes_member() {
        let registry = populated_registry(&["10.0.0.1"]);
        let group = registry.group("group1").unwrap();
        group
            .write()
            .servers
            .get_mut("10.0.0.1")
            .unwrap()
            .free_mb = 100;

        let sel = selector(TrackerConfig::default().with_reserved_space_mb(200));
        let err = sel.select_store(&registry, Some("group1")).unwrap_err();
        assert!(matches!(err, FastDFSError::InsufficientSpace));
    }

    #[test]
    fn test_priority_policy_prefers_lowest_priority_value() {
        let registry = populated_registry(&["10.0.0.1", "10.0.0.2"]);
        let group = registry.group("group1").unwrap();
        group
            .write()
            .servers
            .get_mut("10.0.0.2")
            .unwrap()
            .upload_priority = 1;

        let sel = selector(
            TrackerConfig::default().with_store_server(StoreServerPolicy::Priority),
        );
        for _ in 0..3 {
            let choice = sel.select_store(&registry, None).unwrap();
            assert_eq!(choice.ip_addr, "10.0.0.2");
        }
    }

    #[test]
    fn test_most_free_path_policy() {
        let registry = populated_registry(&["10.0.0.1"]);
        registry
            .report_disk_usage("group1", "10.0.0.1", &[(1000, 100), (1000, 900)])
            .unwrap();

        let sel = selector(
            TrackerConfig::default().with_store_path(StorePathPolicy::MostFree),
        );
        let choice = sel.select_store(&registry, Some("group1")).unwrap();
        assert_eq!(choice.store_path_index, 1);
    }

    #[test]
    fn test_fetch_excludes_offline_member() {
        let registry = populated_registry(&["10.0.0.1", "10.0.0.2"]);
        let group = registry.group("group1").unwrap();
        group
            .write()
            .servers
            .get_mut("10.0.0.2")
            .unwrap()
            .status = StorageStatus::Offline;

        let sel = selector(TrackerConfig::default());
        for _ in 0..4 {
            let choice = sel.select_fetch(&registry, "group1", false).unwrap();
            assert_eq!(choice.ip_addr, "10.0.0.1");
        }
    }

    #[test]
    fn test_fetch_all_lists_every_active_member() {
        let registry = populated_registry(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let sel = selector(TrackerConfig::default());
        let choice = sel.select_fetch(&registry, "group1", true).unwrap();
        assert_eq!(choice.extra_ips.len(), 2);
        assert!(!choice.extra_ips.contains(&choice.ip_addr));
    }

    #[test]
    fn test_update_prefers_source_server() {
        let registry = populated_registry(&["10.0.0.1", "10.0.0.2"]);
        let stem = crate::protocol::encode_file_meta("10.0.0.2", 1000, 64, 1, 2, false);
        let remote = format!("M00/00/00/{}.txt", stem);

        let sel = selector(TrackerConfig::default());
        let choice = sel.select_update(&registry, "group1", &remote).unwrap();
        assert_eq!(choice.ip_addr, "10.0.0.2");

        // Source offline: any ACTIVE member serves the update.
        let group = registry.group("group1").unwrap();
        group
            .write()
            .servers
            .get_mut("10.0.0.2")
            .unwrap()
            .status = StorageStatus::Offline;
        let choice = sel.select_update(&registry, "group1", &remote).unwrap();
        assert_eq!(choice.ip_addr, "10.0.0.1");
    }

    #[test]
    fn test_unknown_group_is_not_found() {
        let registry = populated_registry(&["10.0.0.1"]);
        let sel = selector(TrackerConfig::default());
        let err = sel.select_store(&registry, Some("nope")).unwrap_err();
        assert!(matches!(err, FastDFSError::GroupNotFound(_)));
    }
}
