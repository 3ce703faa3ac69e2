//! Cluster membership and the single-change configuration protocol.
//!
//! A configuration takes effect on a node as soon as its ConfigChange entry is
//! appended to that node's log. Only one member may be added or removed per
//! change, and a new change is refused until the previous one has committed.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::raft::entry::LogEntry;
use crate::raft::error::RaftError;
use crate::raft::NodeId;

/// A voting member and the address its peers reach it on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub addr: String,
}

impl Member {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Member {
            id,
            addr: addr.into(),
        }
    }
}

/// Exactly one membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipDelta {
    Add(Member),
    Remove(NodeId),
}

/// The voting set, keyed by node id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    members: BTreeMap<NodeId, Member>,
    /// Log index of the ConfigChange entry that produced this set, 0 at bootstrap.
    config_index: u64,
}

impl ClusterConfig {
    pub fn new(members: impl IntoIterator<Item = Member>, config_index: u64) -> Self {
        ClusterConfig {
            members: members.into_iter().map(|m| (m.id, m)).collect(),
            config_index,
        }
    }

    pub fn bootstrap(members: impl IntoIterator<Item = Member>) -> Self {
        Self::new(members, 0)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.members.keys().copied().collect()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn config_index(&self) -> u64 {
        self.config_index
    }

    /// Number of members that form a majority.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Whether the given voters include a majority of this configuration.
    /// Ids outside the configuration are ignored.
    pub fn is_quorum<'a>(&self, voters: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let count = voters
            .into_iter()
            .filter(|id| self.members.contains_key(id))
            .count();
        !self.members.is_empty() && count >= self.quorum()
    }

    /// Checks that `delta` is a legal single change against this configuration.
    pub fn check(&self, delta: &MembershipDelta) -> Result<(), RaftError> {
        match delta {
            MembershipDelta::Add(member) => {
                if self.members.contains_key(&member.id) {
                    return Err(RaftError::InvalidMembershipDelta(format!(
                        "node {} is already a member",
                        member.id
                    )));
                }
                if member.addr.trim().is_empty() {
                    return Err(RaftError::InvalidMembershipDelta(format!(
                        "node {} has no address",
                        member.id
                    )));
                }
            }
            MembershipDelta::Remove(id) => {
                if !self.members.contains_key(id) {
                    return Err(RaftError::InvalidMembershipDelta(format!(
                        "node {} is not a member",
                        id
                    )));
                }
                if self.members.len() == 1 {
                    return Err(RaftError::InvalidMembershipDelta(
                        "removing the last member would leave an empty cluster".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Produces the configuration that results from appending `delta` at `index`.
    ///
    /// Followers replay whatever the leader appended, so this never fails:
    /// re-adding a member refreshes its address and removing an unknown id is
    /// a no-op.
    pub fn with_delta(&self, delta: &MembershipDelta, index: u64) -> ClusterConfig {
        let mut members = self.members.clone();
        match delta {
            MembershipDelta::Add(member) => {
                members.insert(member.id, member.clone());
            }
            MembershipDelta::Remove(id) => {
                members.remove(id);
            }
        }
        ClusterConfig {
            members,
            config_index: index,
        }
    }
}

/// Tracks the configuration covered by the applied prefix of the log and the
/// configurations appended after it.
#[derive(Debug, Clone)]
pub struct Membership {
    applied: ClusterConfig,
    pending: Vec<ClusterConfig>,
}

impl Membership {
    pub fn new(config: ClusterConfig) -> Self {
        Membership {
            applied: config,
            pending: Vec::new(),
        }
    }

    /// Rebuilds from a configuration known to be applied plus the log entries
    /// that follow it.
    pub fn rebuild<'a>(applied: ClusterConfig, entries: impl IntoIterator<Item = &'a LogEntry>) -> Self {
        let mut membership = Membership::new(applied);
        for entry in entries {
            membership.on_append(entry);
        }
        membership
    }

    /// The configuration used for elections and commit decisions.
    pub fn latest(&self) -> &ClusterConfig {
        self.pending.last().unwrap_or(&self.applied)
    }

    /// The configuration as of the last applied entry, stored with snapshots.
    pub fn applied(&self) -> &ClusterConfig {
        &self.applied
    }

    /// Validates a requested change before it is proposed.
    pub fn validate(&self, delta: &MembershipDelta, commit_index: u64) -> Result<(), RaftError> {
        if self.latest().config_index > commit_index {
            return Err(RaftError::ConfigChangeInProgress);
        }
        self.latest().check(delta)
    }

    /// Switches to a new configuration the moment its entry is appended.
    /// Returns true when the entry changed the configuration.
    pub fn on_append(&mut self, entry: &LogEntry) -> bool {
        match entry.membership_delta() {
            Some(delta) if entry.index > self.latest().config_index => {
                let next = self.latest().with_delta(delta, entry.index);
                self.pending.push(next);
                true
            }
            _ => false,
        }
    }

    /// Records that entries up to `applied_index` have been applied.
    pub fn on_applied(&mut self, applied_index: u64) {
        let done = self
            .pending
            .iter()
            .take_while(|c| c.config_index <= applied_index)
            .count();
        if let Some(config) = self.pending.drain(..done).last() {
            self.applied = config;
        }
    }

    /// Forgets configurations whose entries were truncated from `index` on.
    /// Returns true when the latest configuration changed.
    pub fn on_truncate(&mut self, index: u64) -> bool {
        let before = self.pending.len();
        self.pending.retain(|c| c.config_index < index);
        before != self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> ClusterConfig {
        ClusterConfig::bootstrap((1..=3).map(|id| Member::new(id, format!("127.0.0.1:{}", 4000 + id))))
    }

    #[test]
    fn quorum_sizes() {
        let cfg = |n: u64| ClusterConfig::bootstrap((1..=n).map(|id| Member::new(id, "a")));
        assert_eq!(cfg(1).quorum(), 1);
        assert_eq!(cfg(3).quorum(), 2);
        assert_eq!(cfg(4).quorum(), 3);
        assert_eq!(cfg(5).quorum(), 3);
        assert_eq!(cfg(7).quorum(), 4);
    }

    #[test]
    fn quorum_ignores_non_members() {
        let cfg = three();
        assert!(!cfg.is_quorum(&[1, 9]));
        assert!(cfg.is_quorum(&[1, 3]));
        assert!(!ClusterConfig::default().is_quorum(&[]));
    }

    #[test]
    fn add_existing_member_is_rejected() {
        let err = three()
            .check(&MembershipDelta::Add(Member::new(2, "x:1")))
            .unwrap_err();
        assert!(matches!(err, RaftError::InvalidMembershipDelta(_)));
    }

    #[test]
    fn remove_unknown_or_last_member_is_rejected() {
        assert!(matches!(
            three().check(&MembershipDelta::Remove(9)),
            Err(RaftError::InvalidMembershipDelta(_))
        ));
        let single = ClusterConfig::bootstrap(vec![Member::new(1, "a:1")]);
        assert!(matches!(
            single.check(&MembershipDelta::Remove(1)),
            Err(RaftError::InvalidMembershipDelta(_))
        ));
    }

    #[test]
    fn change_takes_effect_on_append() {
        let mut membership = Membership::new(three());
        let entry = LogEntry::config_change(5, 2, MembershipDelta::Remove(3));
        assert!(membership.on_append(&entry));
        assert_eq!(membership.latest().ids(), vec![1, 2]);
        assert_eq!(membership.latest().config_index(), 5);
        assert_eq!(membership.applied().ids(), vec![1, 2, 3]);

        membership.on_applied(5);
        assert_eq!(membership.applied().ids(), vec![1, 2]);
    }

    #[test]
    fn second_change_waits_for_commit() {
        let mut membership = Membership::new(three());
        membership.on_append(&LogEntry::config_change(5, 2, MembershipDelta::Remove(3)));

        let add = MembershipDelta::Add(Member::new(4, "127.0.0.1:4004"));
        assert!(matches!(
            membership.validate(&add, 4),
            Err(RaftError::ConfigChangeInProgress)
        ));
        assert!(membership.validate(&add, 5).is_ok());
    }

    #[test]
    fn rebuild_replays_config_entries() {
        let entries = vec![
            LogEntry::mutation(1, 1, b"a".to_vec()),
            LogEntry::config_change(2, 1, MembershipDelta::Add(Member::new(4, "d:1"))),
            LogEntry::noop(3, 2),
        ];
        let mut membership = Membership::rebuild(three(), entries.iter());
        assert_eq!(membership.latest().ids(), vec![1, 2, 3, 4]);

        assert!(!membership.on_truncate(3));
        assert!(membership.on_truncate(2));
        assert_eq!(membership.latest().ids(), vec![1, 2, 3]);
    }

    #[test]
    fn applied_config_follows_each_applied_change() {
        let mut membership = Membership::new(three());
        membership.on_append(&LogEntry::config_change(5, 2, MembershipDelta::Remove(3)));
        membership.on_append(&LogEntry::config_change(8, 2, MembershipDelta::Add(Member::new(7, "g:1"))));
        assert_eq!(membership.latest().ids(), vec![1, 2, 7]);

        membership.on_applied(6);
        assert_eq!(membership.applied().ids(), vec![1, 2]);
        assert_eq!(membership.applied().config_index(), 5);

        membership.on_applied(8);
        assert_eq!(membership.applied().ids(), vec![1, 2, 7]);
    }
}
