//! Protobuf forms of the consensus messages and their conversions to the
//! types the core works with.

use bytes::Bytes;
use thiserror::Error;

use crate::raft::entry::{EntryPayload, LogEntry, Snapshot, SnapshotMeta};
use crate::raft::membership::{ClusterConfig, Member, MembershipDelta};
use crate::raft::message::{
    AppendEntries, AppendResponse, InstallSnapshot, RequestVote, VoteResponse,
};

pub mod pb {
    tonic::include_proto!("raft");
}

use pb::entry::Payload;
use pb::membership_change::Change;

/// A field proto3 treats as optional but the core cannot do without.
#[derive(Debug, Error)]
#[error("message is missing its {0}")]
pub struct MissingField(pub &'static str);

impl From<Member> for pb::Member {
    fn from(member: Member) -> Self {
        pb::Member {
            id: member.id,
            addr: member.addr,
        }
    }
}

impl From<pb::Member> for Member {
    fn from(member: pb::Member) -> Self {
        Member::new(member.id, member.addr)
    }
}

impl From<MembershipDelta> for pb::MembershipChange {
    fn from(delta: MembershipDelta) -> Self {
        let change = match delta {
            MembershipDelta::Add(member) => Change::Add(member.into()),
            MembershipDelta::Remove(id) => Change::Remove(id),
        };
        pb::MembershipChange {
            change: Some(change),
        }
    }
}

impl TryFrom<pb::MembershipChange> for MembershipDelta {
    type Error = MissingField;

    fn try_from(change: pb::MembershipChange) -> Result<Self, MissingField> {
        match change.change.ok_or(MissingField("membership change"))? {
            Change::Add(member) => Ok(MembershipDelta::Add(member.into())),
            Change::Remove(id) => Ok(MembershipDelta::Remove(id)),
        }
    }
}

impl From<LogEntry> for pb::Entry {
    fn from(entry: LogEntry) -> Self {
        let payload = match entry.payload {
            EntryPayload::Noop => Payload::Noop(pb::Noop {}),
            EntryPayload::Mutation(data) => Payload::Mutation(data.to_vec()),
            EntryPayload::ConfigChange(delta) => Payload::ConfigChange(delta.into()),
        };
        pb::Entry {
            index: entry.index,
            term: entry.term,
            payload: Some(payload),
        }
    }
}

impl TryFrom<pb::Entry> for LogEntry {
    type Error = MissingField;

    fn try_from(entry: pb::Entry) -> Result<Self, MissingField> {
        let payload = match entry.payload.ok_or(MissingField("entry payload"))? {
            Payload::Noop(_) => EntryPayload::Noop,
            Payload::Mutation(data) => EntryPayload::Mutation(Bytes::from(data)),
            Payload::ConfigChange(change) => EntryPayload::ConfigChange(change.try_into()?),
        };
        Ok(LogEntry::new(entry.index, entry.term, payload))
    }
}

impl From<ClusterConfig> for pb::ClusterConfig {
    fn from(config: ClusterConfig) -> Self {
        pb::ClusterConfig {
            members: config.members().cloned().map(Into::into).collect(),
            config_index: config.config_index(),
        }
    }
}

impl From<pb::ClusterConfig> for ClusterConfig {
    fn from(config: pb::ClusterConfig) -> Self {
        ClusterConfig::new(
            config.members.into_iter().map(Member::from),
            config.config_index,
        )
    }
}

impl From<RequestVote> for pb::VoteRequest {
    fn from(request: RequestVote) -> Self {
        pb::VoteRequest {
            term: request.term,
            candidate_id: request.candidate_id,
            last_log_index: request.last_log_index,
            last_log_term: request.last_log_term,
            disruptive: request.disruptive,
        }
    }
}

impl From<pb::VoteRequest> for RequestVote {
    fn from(request: pb::VoteRequest) -> Self {
        RequestVote {
            term: request.term,
            candidate_id: request.candidate_id,
            last_log_index: request.last_log_index,
            last_log_term: request.last_log_term,
            disruptive: request.disruptive,
        }
    }
}

impl From<VoteResponse> for pb::VoteReply {
    fn from(response: VoteResponse) -> Self {
        pb::VoteReply {
            term: response.term,
            vote_granted: response.vote_granted,
        }
    }
}

impl From<pb::VoteReply> for VoteResponse {
    fn from(reply: pb::VoteReply) -> Self {
        VoteResponse {
            term: reply.term,
            vote_granted: reply.vote_granted,
        }
    }
}

impl From<AppendEntries> for pb::AppendRequest {
    fn from(request: AppendEntries) -> Self {
        pb::AppendRequest {
            term: request.term,
            leader_id: request.leader_id,
            prev_log_index: request.prev_log_index,
            prev_log_term: request.prev_log_term,
            entries: request.entries.into_iter().map(Into::into).collect(),
            leader_commit: request.leader_commit,
        }
    }
}

impl TryFrom<pb::AppendRequest> for AppendEntries {
    type Error = MissingField;

    fn try_from(request: pb::AppendRequest) -> Result<Self, MissingField> {
        Ok(AppendEntries {
            term: request.term,
            leader_id: request.leader_id,
            prev_log_index: request.prev_log_index,
            prev_log_term: request.prev_log_term,
            entries: request
                .entries
                .into_iter()
                .map(LogEntry::try_from)
                .collect::<Result<_, _>>()?,
            leader_commit: request.leader_commit,
        })
    }
}

impl From<AppendResponse> for pb::AppendReply {
    fn from(response: AppendResponse) -> Self {
        pb::AppendReply {
            term: response.term,
            success: response.success,
            last_log_index: response.last_log_index,
        }
    }
}

impl From<pb::AppendReply> for AppendResponse {
    fn from(reply: pb::AppendReply) -> Self {
        AppendResponse {
            term: reply.term,
            success: reply.success,
            last_log_index: reply.last_log_index,
        }
    }
}

impl From<InstallSnapshot> for pb::SnapshotRequest {
    fn from(request: InstallSnapshot) -> Self {
        let Snapshot { meta, data } = request.snapshot;
        pb::SnapshotRequest {
            term: request.term,
            leader_id: request.leader_id,
            last_index: meta.last_index,
            last_term: meta.last_term,
            config: Some(meta.config.into()),
            data: data.to_vec(),
        }
    }
}

impl TryFrom<pb::SnapshotRequest> for InstallSnapshot {
    type Error = MissingField;

    fn try_from(request: pb::SnapshotRequest) -> Result<Self, MissingField> {
        let config = request.config.ok_or(MissingField("snapshot configuration"))?;
        Ok(InstallSnapshot {
            term: request.term,
            leader_id: request.leader_id,
            snapshot: Snapshot {
                meta: SnapshotMeta {
                    last_index: request.last_index,
                    last_term: request.last_term,
                    config: config.into(),
                },
                data: Bytes::from(request.data),
            },
        })
    }
}
