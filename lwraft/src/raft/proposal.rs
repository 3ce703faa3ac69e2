use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use crate::raft::entry::EntryPayload;
use crate::raft::error::Result;
use crate::raft::membership::MembershipDelta;

/// A request to append one entry, answered with its log index once the
/// entry is durable in the leader's log.
pub struct Proposal {
    pub payload: EntryPayload,
    pub reply: Sender<Result<u64>>,
}

impl Proposal {
    pub fn mutation(data: Bytes) -> (Self, Receiver<Result<u64>>) {
        Self::new(EntryPayload::Mutation(data))
    }

    pub fn config_change(delta: MembershipDelta) -> (Self, Receiver<Result<u64>>) {
        Self::new(EntryPayload::ConfigChange(delta))
    }

    fn new(payload: EntryPayload) -> (Self, Receiver<Result<u64>>) {
        let (reply, rx) = oneshot::channel();
        (Proposal { payload, reply }, rx)
    }
}
