//! Tracker Leader Election
//!
//! Trackers exchange `(up_time, running_time)` pairs and agree on the peer
//! with the greatest up time; ties break toward the smallest index in the
//! configured peer list. The election is opportunistic: it is re-evaluated on
//! a timer and on demand, and converges because every round re-reads peers.

use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::ConnectionPool;
use crate::errors::Result;
use crate::protocol::decode_tracker_status;
use crate::types::{now_unix, TrackerCommand, TrackerRunningStatus};

/// The cluster view of one tracker process
pub struct TrackerCluster {
    /// Every tracker endpoint, self included; order defines tie-break index
    members: Vec<String>,
    self_index: usize,
    started_at: u64,
    leader_index: AtomicUsize,
    pool: Arc<ConnectionPool>,
    network_timeout: u64,
}

impl TrackerCluster {
    /// Builds the cluster view
    ///
    /// `members` is the configured tracker list; when `self_addr` is missing
    /// from it (including the single-tracker case) this process runs alone
    /// and is always leader.
    pub fn new(
        members: Vec<String>,
        self_addr: String,
        connect_timeout: u64,
        network_timeout: u64,
    ) -> Self {
        let mut members = members;
        if members.is_empty() || !members.contains(&self_addr) {
            members = vec![self_addr.clone()];
        }
        let self_index = members.iter().position(|m| *m == self_addr).unwrap_or(0);

        let pool = Arc::new(ConnectionPool::new(
            members.clone(),
            2,
            Duration::from_millis(connect_timeout),
            Duration::from_millis(network_timeout),
        ));

        Self {
            members,
            self_index,
            started_at: now_unix(),
            leader_index: AtomicUsize::new(self_index),
            pool,
            network_timeout,
        }
    }

    /// Seconds this tracker has been running
    pub fn up_time(&self) -> u64 {
        now_unix().saturating_sub(self.started_at)
    }

    /// The status block served to peer trackers during elections
    pub fn running_status(&self) -> TrackerRunningStatus {
        TrackerRunningStatus {
            if_leader: self.is_leader(),
            up_time: self.up_time(),
            running_time: self.up_time(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader_index.load(Ordering::Acquire) == self.self_index
    }

    pub fn self_addr(&self) -> &str {
        &self.members[self.self_index]
    }

    /// The currently agreed leader endpoint
    pub fn leader_addr(&self) -> String {
        let idx = self.leader_index.load(Ordering::Acquire).min(self.members.len() - 1);
        self.members[idx].clone()
    }

    /// Runs one election round: ping every peer concurrently, then pick the
    /// greatest up time, breaking ties toward the smallest configured index
    ///
    /// Unreachable peers are excluded from the round; self always votes.
    pub async fn elect(&self) -> Result<String> {
        let pings = self
            .members
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != self.self_index)
            .map(|(index, addr)| async move { (index, self.peer_status(addr).await) });

        let mut votes = vec![(self.self_index, self.up_time())];
        for (index, status) in join_all(pings).await {
            match status {
                Ok(status) => votes.push((index, status.up_time)),
                Err(e) => {
                    debug!(peer = %self.members[index], error = %e,
                           "tracker peer unreachable this round");
                }
            }
        }

        let best_index = pick_leader(&votes).unwrap_or(self.self_index);
        let previous = self.leader_index.swap(best_index, Ordering::AcqRel);
        if previous != best_index {
            warn!(
                leader = %self.members[best_index],
                "tracker leader changed"
            );
        }
        Ok(self.members[best_index].clone())
    }

    async fn peer_status(&self, addr: &str) -> Result<TrackerRunningStatus> {
        let mut conn = self.pool.get(Some(addr)).await?;
        let body = conn
            .request(TrackerCommand::TrackerGetStatus as u8, &[], self.network_timeout)
            .await?;
        self.pool.put(conn).await;
        decode_tracker_status(&body)
    }

    /// Shuts down the peer connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Pure election rule over collected `(index, up_time)` votes
///
/// Kept separate from the network round so the agreement property is directly
/// testable: greatest up time wins, ties go to the smallest index.
pub fn pick_leader(votes: &[(usize, u64)]) -> Option<usize> {
    votes
        .iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(index, _)| *index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greatest_up_time_wins() {
        // T1=100, T2=200, T3=150: everyone agrees on T2.
        let votes = vec![(0, 100), (1, 200), (2, 150)];
        assert_eq!(pick_leader(&votes), Some(1));

        for rotation in [vec![(2, 150), (0, 100), (1, 200)], vec![(1, 200), (2, 150), (0, 100)]] {
            assert_eq!(pick_leader(&rotation), Some(1));
        }
    }

    #[test]
    fn test_tie_breaks_to_smallest_index() {
        let votes = vec![(0, 200), (1, 200), (2, 50)];
        assert_eq!(pick_leader(&votes), Some(0));

        let votes = vec![(2, 200), (1, 200)];
        assert_eq!(pick_leader(&votes), Some(1));
    }

    #[test]
    fn test_single_tracker_is_leader() {
        let cluster = TrackerCluster::new(
            Vec::new(),
            "127.0.0.1:22122".to_string(),
            1000,
            1000,
        );
        assert!(cluster.is_leader());
        assert_eq!(cluster.leader_addr(), "127.0.0.1:22122");
    }

    #[test]
    fn test_unlisted_self_runs_alone() {
        let cluster = TrackerCluster::new(
            vec!["10.0.0.1:22122".to_string()],
            "10.0.0.9:22122".to_string(),
            1000,
            1000,
        );
        assert!(cluster.is_leader());
    }
}
