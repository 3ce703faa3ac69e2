//! Leader-side replication progress of each follower.

use std::collections::HashMap;

use crate::raft::handle::FollowerStatus;
use crate::raft::membership::ClusterConfig;
use crate::raft::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub next_index: u64,
    pub match_index: u64,
    /// An AppendEntries or InstallSnapshot to this peer is outstanding.
    pub inflight: bool,
    /// The last replication RPC to this peer got an answer.
    pub reachable: bool,
}

impl Progress {
    fn new(last_index: u64) -> Self {
        Progress {
            next_index: last_index + 1,
            match_index: 0,
            inflight: false,
            reachable: false,
        }
    }

    /// Records a successful replication up to `matched`.
    pub fn on_success(&mut self, matched: u64) {
        self.inflight = false;
        self.reachable = true;
        self.match_index = self.match_index.max(matched);
        self.next_index = self.next_index.max(self.match_index + 1);
    }

    /// Moves `next_index` back after a rejection, jumping to just past the
    /// follower's last entry when that is further back.
    pub fn on_reject(&mut self, follower_last: u64) {
        self.inflight = false;
        self.reachable = true;
        self.next_index = (self.next_index - 1)
            .min(follower_last + 1)
            .max(self.match_index + 1)
            .max(1);
    }

    /// Records a replication RPC that got no answer.
    pub fn on_unreachable(&mut self) {
        self.inflight = false;
        self.reachable = false;
    }
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    peers: HashMap<NodeId, Progress>,
}

impl ProgressTracker {
    /// Starts tracking every member of `config` except `self_id`.
    pub fn reset(&mut self, config: &ClusterConfig, self_id: NodeId, last_index: u64) {
        self.peers = config
            .ids()
            .into_iter()
            .filter(|id| *id != self_id)
            .map(|id| (id, Progress::new(last_index)))
            .collect();
    }

    /// Follows a configuration change: new members start from `last_index + 1`,
    /// removed members are forgotten.
    pub fn sync(&mut self, config: &ClusterConfig, self_id: NodeId, last_index: u64) {
        self.peers.retain(|id, _| config.contains(*id));
        for id in config.ids() {
            if id != self_id {
                self.peers.entry(id).or_insert_with(|| Progress::new(last_index));
            }
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn get(&self, id: NodeId) -> Option<&Progress> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Progress> {
        self.peers.get_mut(&id)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Per-follower replication state, ordered by id.
    pub fn followers(&self) -> Vec<FollowerStatus> {
        self.peer_ids()
            .into_iter()
            .filter_map(|id| {
                self.peers.get(&id).map(|p| FollowerStatus {
                    id,
                    match_index: p.match_index,
                    next_index: p.next_index,
                    reachable: p.reachable,
                })
            })
            .collect()
    }

    /// Highest index stored on a majority of `config`. The leader counts with
    /// its own last index only while it is a member.
    pub fn quorum_index(&self, config: &ClusterConfig, self_id: NodeId, self_last: u64) -> u64 {
        let mut matched: Vec<u64> = config
            .ids()
            .into_iter()
            .map(|id| {
                if id == self_id {
                    self_last
                } else {
                    self.peers.get(&id).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        if matched.is_empty() {
            return 0;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched[config.quorum() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::membership::Member;

    fn config(ids: &[NodeId]) -> ClusterConfig {
        ClusterConfig::bootstrap(ids.iter().map(|id| Member::new(*id, format!("n{}", id))))
    }

    #[test]
    fn quorum_index_of_five() {
        let cfg = config(&[1, 2, 3, 4, 5]);
        let mut tracker = ProgressTracker::default();
        tracker.reset(&cfg, 1, 10);
        tracker.get_mut(2).unwrap().on_success(8);
        tracker.get_mut(3).unwrap().on_success(6);
        assert_eq!(tracker.quorum_index(&cfg, 1, 10), 6);
        tracker.get_mut(4).unwrap().on_success(9);
        assert_eq!(tracker.quorum_index(&cfg, 1, 10), 8);
    }

    #[test]
    fn removed_leader_does_not_count_itself() {
        let cfg = config(&[2, 3, 4]);
        let mut tracker = ProgressTracker::default();
        tracker.reset(&cfg, 1, 10);
        tracker.get_mut(2).unwrap().on_success(10);
        assert_eq!(tracker.quorum_index(&cfg, 1, 10), 0);
        tracker.get_mut(3).unwrap().on_success(7);
        assert_eq!(tracker.quorum_index(&cfg, 1, 10), 7);
    }

    #[test]
    fn reject_jumps_back_to_follower_log() {
        let mut progress = Progress::new(100);
        progress.on_reject(40);
        assert_eq!(progress.next_index, 41);
        progress.on_reject(60);
        assert_eq!(progress.next_index, 40);
        progress.match_index = 39;
        progress.on_reject(0);
        assert_eq!(progress.next_index, 40);
    }

    #[test]
    fn followers_report_last_rpc_outcome() {
        let mut tracker = ProgressTracker::default();
        tracker.reset(&config(&[1, 2, 3]), 1, 4);
        tracker.get_mut(3).unwrap().on_success(4);
        tracker.get_mut(2).unwrap().on_reject(1);
        tracker.get_mut(2).unwrap().on_unreachable();

        let followers = tracker.followers();
        assert_eq!(
            followers,
            vec![
                FollowerStatus {
                    id: 2,
                    match_index: 0,
                    next_index: 2,
                    reachable: false,
                },
                FollowerStatus {
                    id: 3,
                    match_index: 4,
                    next_index: 5,
                    reachable: true,
                },
            ]
        );
    }

    #[test]
    fn sync_tracks_membership() {
        let mut tracker = ProgressTracker::default();
        tracker.reset(&config(&[1, 2, 3]), 1, 5);
        tracker.sync(&config(&[1, 2, 4]), 1, 7);
        assert_eq!(tracker.peer_ids(), vec![2, 4]);
        assert_eq!(tracker.get(2).unwrap().next_index, 6);
        assert_eq!(tracker.get(4).unwrap().next_index, 8);
    }
}
