//! Raft node implementation
//!
//! A [`ConsensusNode`] owns the whole state of one cluster member: its log,
//! term and vote, apply sink, membership and replication progress. A single
//! task runs the control loop; proposals, inbound RPCs and the results of
//! outbound RPCs all arrive through one event queue, and every peer RPC runs
//! in its own task.

use std::collections::HashSet;
use std::sync::Arc;

use slog::{crit, debug, info, o, warn, Logger};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::metrics;
use crate::raft::config::RaftConfig;
use crate::raft::entry::{EntryPayload, LogEntry, Snapshot, SnapshotMeta};
use crate::raft::error::{RaftError, StorageError, TransportError};
use crate::raft::event::Event;
use crate::raft::handle::{NodeStatus, RaftHandle, Role};
use crate::raft::hard_state::{HardState, HardStateStore};
use crate::raft::membership::{ClusterConfig, Member, Membership};
use crate::raft::message::{
    AppendEntries, AppendResponse, InstallSnapshot, RaftRequest, RaftResponse, RequestVote,
    VoteResponse,
};
use crate::raft::progress::ProgressTracker;
use crate::raft::proposal::Proposal;
use crate::raft::raft_log::RaftLog;
use crate::raft::storage::LogStore;
use crate::raft::transport::Transport;
use crate::raft::{ApplySink, NodeId};

pub struct ConsensusNode<L: LogStore, H: HardStateStore, A: ApplySink> {
    id: NodeId,
    label: String,
    config: RaftConfig,
    logger: Logger,

    log: RaftLog<L>,
    hard_state_store: H,
    hard_state: HardState,
    sink: A,
    transport: Arc<dyn Transport>,
    membership: Membership,

    role: Role,
    leader_id: Option<NodeId>,
    commit_index: u64,
    last_applied: u64,
    snapshot_index: u64,
    votes: HashSet<NodeId>,
    progress: ProgressTracker,
    /// Index of the no-op appended on winning the current term.
    term_start_index: u64,
    halted: Option<String>,

    election_deadline: Instant,
    heartbeat_deadline: Instant,
    last_leader_contact: Option<Instant>,

    events_tx: mpsc::Sender<Event>,
    events: mpsc::Receiver<Event>,
    status: watch::Sender<NodeStatus>,
}

impl<L: LogStore, H: HardStateStore, A: ApplySink> ConsensusNode<L, H, A> {
    /// Recovers a node from its stores.
    ///
    /// `bootstrap` is the member set used when neither a snapshot nor the log
    /// says otherwise. A stored snapshot newer than the sink is restored into
    /// it first.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        bootstrap: ClusterConfig,
        mut log_store: L,
        hard_state_store: H,
        mut sink: A,
        transport: Arc<dyn Transport>,
        logger: &Logger,
    ) -> Result<(Self, RaftHandle), RaftError> {
        config.validate()?;
        let logger = logger.new(o!("node" => id));
        let hard_state = hard_state_store.load()?;

        let mut last_applied = sink.last_applied_index();
        let mut snapshot_index = 0;
        let mut applied_config = bootstrap;
        if let Some(snapshot) = log_store.load_snapshot()? {
            let meta = &snapshot.meta;
            // A snapshot install that died before the log was reset.
            if log_store.boundary().0 <= meta.last_index
                && log_store.term_at(meta.last_index) != Some(meta.last_term)
            {
                warn!(logger, "log does not lead up to the snapshot, discarding it";
                    "index" => meta.last_index, "term" => meta.last_term);
                log_store.reset(meta.last_index, meta.last_term)?;
            }
            if snapshot.meta.last_index > last_applied {
                sink.restore(&snapshot.meta, &snapshot.data)?;
                last_applied = snapshot.meta.last_index;
                info!(logger, "restored snapshot into the apply sink"; "index" => last_applied);
            }
            snapshot_index = snapshot.meta.last_index;
            applied_config = snapshot.meta.config;
        }

        let (boundary, _) = log_store.boundary();
        if boundary > snapshot_index {
            return Err(StorageError::Corrupt(format!(
                "log is compacted to {} but the snapshot ends at {}",
                boundary, snapshot_index
            ))
            .into());
        }
        if last_applied > log_store.last_index() {
            return Err(StorageError::Corrupt(format!(
                "apply sink is at {} but the log ends at {}",
                last_applied,
                log_store.last_index()
            ))
            .into());
        }

        let log = RaftLog::new(log_store, last_applied);
        let mut membership = Membership::rebuild(
            applied_config,
            log.entries(snapshot_index + 1, usize::MAX).iter(),
        );
        membership.on_applied(last_applied);

        let (events_tx, events) = mpsc::channel(config.event_queue_size);
        let (status, status_rx) = watch::channel(NodeStatus::initial(id));
        let now = Instant::now();
        let election_deadline = now + config.startup_grace() + config.random_election_timeout();

        let node = ConsensusNode {
            id,
            label: id.to_string(),
            config,
            logger,
            log,
            hard_state_store,
            hard_state,
            sink,
            transport,
            membership,
            role: Role::Follower,
            leader_id: None,
            commit_index: last_applied,
            last_applied,
            snapshot_index,
            votes: HashSet::new(),
            progress: ProgressTracker::default(),
            term_start_index: 0,
            halted: None,
            election_deadline,
            heartbeat_deadline: now,
            last_leader_contact: None,
            events_tx,
            events,
            status,
        };
        node.publish_status();

        let handle = RaftHandle::new(id, node.events_tx.clone(), status_rx);
        Ok((node, handle))
    }

    /// Runs the control loop on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(self.logger, "node started";
            "term" => self.hard_state.term,
            "last_index" => self.log.last_index(),
            "applied" => self.last_applied,
            "members" => ?self.membership.latest().ids());

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(Event::Shutdown) | None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = time::sleep_until(deadline) => self.tick(),
            }
            self.apply_committed();
            self.check_removal();
            self.maybe_snapshot();
            self.publish_status();
        }

        info!(self.logger, "node stopped"; "term" => self.hard_state.term);
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Propose(proposal) => self.on_propose(proposal),
            Event::Rpc { request, reply } => self.on_rpc(request, reply),
            Event::VoteResult { peer, term, result } => self.on_vote_result(peer, term, result),
            Event::AppendResult {
                peer,
                term,
                prev_log_index,
                entries_len,
                result,
            } => self.on_replicate_result(peer, term, prev_log_index + entries_len, "append", result),
            Event::SnapshotResult {
                peer,
                term,
                last_index,
                result,
            } => self.on_replicate_result(peer, term, last_index, "snapshot", result),
            Event::TriggerElection => self.on_trigger_election(),
            Event::Shutdown => {}
        }
    }

    fn next_deadline(&self) -> Instant {
        if self.role == Role::Leader {
            self.heartbeat_deadline
        } else {
            self.election_deadline
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        if self.halted.is_some() {
            self.election_deadline = now + self.config.election_timeout();
            return;
        }
        match self.role {
            Role::Leader => {
                if now >= self.heartbeat_deadline {
                    self.broadcast_append();
                }
            }
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline {
                    self.campaign(false);
                }
            }
        }
    }

    fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    // -- role transitions --

    fn campaign(&mut self, disruptive: bool) {
        self.reset_election_timer();
        if !self.membership.latest().contains(self.id) {
            debug!(self.logger, "not a member of the latest configuration, not campaigning");
            return;
        }

        let term = self.hard_state.term + 1;
        if !self.persist_hard_state(HardState {
            term,
            voted_for: Some(self.id),
        }) {
            return;
        }
        self.role = Role::Candidate;
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.id);
        metrics::ELECTION_COUNTER
            .with_label_values(&[self.label.as_str()])
            .inc();
        info!(self.logger, "starting election"; "term" => term, "disruptive" => disruptive);

        if self.membership.latest().is_quorum(&self.votes) {
            self.become_leader();
            return;
        }

        let request = RequestVote {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            disruptive,
        };
        let timeout = self.config.rpc_timeout();
        for peer in self.peers() {
            let transport = self.transport.clone();
            let events = self.events_tx.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let result = transport.request_vote(&peer, request, timeout).await;
                let _ = events
                    .send(Event::VoteResult {
                        peer: peer.id,
                        term,
                        result,
                    })
                    .await;
            });
        }
    }

    fn become_leader(&mut self) {
        let term = self.hard_state.term;
        info!(self.logger, "became leader"; "term" => term, "last_index" => self.log.last_index());
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.votes.clear();
        self.progress
            .reset(self.membership.latest(), self.id, self.log.last_index());

        // Entries of earlier terms only commit together with one of ours.
        let index = self.log.last_index() + 1;
        if !self.append_local(&[LogEntry::noop(index, term)]) {
            return;
        }
        self.term_start_index = index;
        self.broadcast_append();
        self.advance_commit();
    }

    /// Adopts `term` if it is newer and becomes a follower of `leader`.
    /// Returns false when the node halted persisting the new term.
    fn become_follower(&mut self, term: u64, leader: Option<NodeId>) -> bool {
        if term > self.hard_state.term
            && !self.persist_hard_state(HardState {
                term,
                voted_for: None,
            })
        {
            return false;
        }
        if self.role != Role::Follower {
            info!(self.logger, "stepping down"; "term" => term, "was" => ?self.role);
            self.role = Role::Follower;
            self.votes.clear();
            self.progress.clear();
            self.reset_election_timer();
        }
        self.leader_id = leader;
        true
    }

    fn check_removal(&mut self) {
        let latest = self.membership.latest();
        if self.role != Role::Leader
            || latest.contains(self.id)
            || latest.config_index() > self.commit_index
        {
            return;
        }
        info!(self.logger, "removal from the cluster committed, stepping down";
            "config_index" => latest.config_index());
        // Let the remaining members learn the commit index before going quiet.
        self.broadcast_append();
        self.role = Role::Follower;
        self.leader_id = None;
        self.progress.clear();
        self.reset_election_timer();
    }

    fn halt(&mut self, reason: String) {
        crit!(self.logger, "halting"; "reason" => %reason);
        self.halted = Some(reason);
        self.role = Role::Follower;
        self.leader_id = None;
        self.votes.clear();
        self.progress.clear();
    }

    fn on_trigger_election(&mut self) {
        if self.halted.is_some() || self.role == Role::Leader {
            return;
        }
        info!(self.logger, "forced election");
        self.campaign(true);
    }

    // -- persistence --

    /// Makes `state` durable before adopting it. Returns false when the node halted.
    fn persist_hard_state(&mut self, state: HardState) -> bool {
        if state == self.hard_state {
            return true;
        }
        match self.hard_state_store.save(&state) {
            Ok(()) => {
                self.hard_state = state;
                true
            }
            Err(e) => {
                self.halt(format!("failed to persist term and vote: {}", e));
                false
            }
        }
    }

    /// Appends durably and switches configuration for any ConfigChange entry.
    /// Returns false when the node halted.
    fn append_local(&mut self, entries: &[LogEntry]) -> bool {
        let timer = metrics::APPEND_HISTOGRAM
            .with_label_values(&[self.label.as_str()])
            .start_timer();
        let result = self.log.append(entries);
        timer.observe_duration();
        if let Err(e) = result {
            self.halt(format!("failed to append to the log: {}", e));
            return false;
        }

        for entry in entries {
            if self.membership.on_append(entry) {
                info!(self.logger, "configuration changed";
                    "index" => entry.index,
                    "members" => ?self.membership.latest().ids());
                if self.role == Role::Leader {
                    self.progress
                        .sync(self.membership.latest(), self.id, self.log.last_index());
                }
            }
        }
        true
    }

    // -- proposals --

    fn on_propose(&mut self, proposal: Proposal) {
        let result = self.propose(proposal.payload);
        let _ = proposal.reply.send(result);
    }

    fn propose(&mut self, payload: EntryPayload) -> Result<u64, RaftError> {
        if let Some(reason) = &self.halted {
            return Err(RaftError::Halted(reason.clone()));
        }
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        if let EntryPayload::ConfigChange(delta) = &payload {
            // A change from an earlier term may still sit uncommitted on some
            // other node until our no-op commits.
            if self.commit_index < self.term_start_index {
                return Err(RaftError::ConfigChangeInProgress);
            }
            self.membership.validate(delta, self.commit_index)?;
        }

        let entry = LogEntry::new(self.log.last_index() + 1, self.hard_state.term, payload);
        let index = entry.index;
        if !self.append_local(std::slice::from_ref(&entry)) {
            return Err(RaftError::Halted(self.halted.clone().unwrap_or_default()));
        }
        metrics::PROPOSAL_COUNTER
            .with_label_values(&[self.label.as_str()])
            .inc();
        debug!(self.logger, "proposal appended"; "index" => index);

        self.broadcast_append();
        self.advance_commit();
        Ok(index)
    }

    // -- replication, leader side --

    fn peers(&self) -> Vec<Member> {
        self.membership
            .latest()
            .members()
            .filter(|m| m.id != self.id)
            .cloned()
            .collect()
    }

    fn broadcast_append(&mut self) {
        self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval();
        for peer in self.progress.peer_ids() {
            self.send_append(peer);
        }
    }

    /// Sends the next batch to `peer` unless a request to it is outstanding.
    fn send_append(&mut self, peer: NodeId) {
        let member = match self.membership.latest().member(peer) {
            Some(member) => member.clone(),
            None => return,
        };
        let next_index = match self.progress.get(peer) {
            Some(progress) if !progress.inflight => progress.next_index,
            _ => return,
        };

        let prev_log_index = next_index - 1;
        let prev_log_term = match self.log.term_at(prev_log_index) {
            Some(term) => term,
            None => {
                self.send_snapshot(member);
                return;
            }
        };

        let entries = self.log.entries(next_index, self.config.max_entries_per_append);
        let entries_len = entries.len() as u64;
        let term = self.hard_state.term;
        let request = AppendEntries {
            term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        if let Some(progress) = self.progress.get_mut(peer) {
            progress.inflight = true;
        }

        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let timeout = self.config.rpc_timeout();
        tokio::spawn(async move {
            let result = transport.append_entries(&member, request, timeout).await;
            let _ = events
                .send(Event::AppendResult {
                    peer: member.id,
                    term,
                    prev_log_index,
                    entries_len,
                    result,
                })
                .await;
        });
    }

    fn send_snapshot(&mut self, member: Member) {
        let snapshot = match self.log.load_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                warn!(self.logger, "peer needs compacted entries but no snapshot exists"; "peer" => member.id);
                return;
            }
            Err(e) => {
                warn!(self.logger, "failed to load snapshot"; "peer" => member.id, "error" => %e);
                return;
            }
        };
        if let Some(progress) = self.progress.get_mut(member.id) {
            progress.inflight = true;
        }

        let term = self.hard_state.term;
        let last_index = snapshot.meta.last_index;
        info!(self.logger, "sending snapshot"; "peer" => member.id, "index" => last_index);
        let request = InstallSnapshot {
            term,
            leader_id: self.id,
            snapshot,
        };

        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let timeout = self.config.rpc_timeout();
        tokio::spawn(async move {
            let result = transport.install_snapshot(&member, request, timeout).await;
            let _ = events
                .send(Event::SnapshotResult {
                    peer: member.id,
                    term,
                    last_index,
                    result,
                })
                .await;
        });
    }

    /// Handles the answer to an AppendEntries or InstallSnapshot that would
    /// have made `peer` match up to `matched`.
    fn on_replicate_result(
        &mut self,
        peer: NodeId,
        term: u64,
        matched: u64,
        kind: &'static str,
        result: Result<AppendResponse, TransportError>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                metrics::RPC_FAILURE_COUNTER
                    .with_label_values(&[self.label.as_str(), kind])
                    .inc();
                debug!(self.logger, "replication rpc failed"; "peer" => peer, "kind" => kind, "error" => %e);
                if self.role == Role::Leader && term == self.hard_state.term {
                    if let Some(progress) = self.progress.get_mut(peer) {
                        progress.on_unreachable();
                    }
                }
                return;
            }
        };
        if self.halted.is_some() {
            return;
        }
        if response.term > self.hard_state.term {
            self.become_follower(response.term, None);
            return;
        }
        if self.role != Role::Leader || term != self.hard_state.term {
            return;
        }

        let next_index = match self.progress.get_mut(peer) {
            Some(progress) => {
                if response.success {
                    progress.on_success(matched);
                } else {
                    progress.on_reject(response.last_log_index);
                }
                progress.next_index
            }
            None => return,
        };

        if response.success {
            self.advance_commit();
            if next_index <= self.log.last_index() {
                self.send_append(peer);
            }
        } else {
            debug!(self.logger, "append rejected, backing off";
                "peer" => peer,
                "follower_last" => response.last_log_index,
                "next_index" => next_index);
            self.send_append(peer);
        }
    }

    fn advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let quorum_index =
            self.progress
                .quorum_index(self.membership.latest(), self.id, self.log.last_index());
        if quorum_index > self.commit_index
            && self.log.term_at(quorum_index) == Some(self.hard_state.term)
        {
            debug!(self.logger, "commit index advanced"; "commit_index" => quorum_index);
            self.commit_index = quorum_index;
        }
    }

    // -- inbound rpcs --

    fn on_rpc(&mut self, request: RaftRequest, reply: oneshot::Sender<RaftResponse>) {
        let response = match request {
            RaftRequest::RequestVote(request) => {
                self.on_request_vote(request).map(RaftResponse::Vote)
            }
            RaftRequest::AppendEntries(request) => {
                self.on_append_entries(request).map(RaftResponse::Append)
            }
            RaftRequest::InstallSnapshot(request) => {
                self.on_install_snapshot(request).map(RaftResponse::Append)
            }
        };
        // A halted node drops the reply; the caller sees it as unreachable.
        if let Some(response) = response {
            let _ = reply.send(response);
        }
    }

    /// Whether a leader was heard from within the minimum election timeout.
    /// A candidate has given up on its leader and never counts as fresh.
    fn leader_is_fresh(&self, now: Instant) -> bool {
        match self.role {
            Role::Leader => true,
            Role::Candidate => false,
            Role::Follower => self
                .last_leader_contact
                .map_or(false, |at| now.duration_since(at) < self.config.election_timeout()),
        }
    }

    fn on_request_vote(&mut self, request: RequestVote) -> Option<VoteResponse> {
        if self.halted.is_some() {
            return None;
        }
        if !request.disruptive
            && request.term > self.hard_state.term
            && self.leader_is_fresh(Instant::now())
        {
            debug!(self.logger, "ignoring vote request, leader is alive";
                "candidate" => request.candidate_id, "term" => request.term);
            return Some(VoteResponse {
                term: self.hard_state.term,
                vote_granted: false,
            });
        }
        if request.term > self.hard_state.term && !self.become_follower(request.term, None) {
            return None;
        }

        let term = self.hard_state.term;
        if request.term < term {
            return Some(VoteResponse {
                term,
                vote_granted: false,
            });
        }

        let can_vote = self
            .hard_state
            .voted_for
            .map_or(true, |id| id == request.candidate_id);
        let vote_granted =
            can_vote && self.log.is_up_to_date(request.last_log_index, request.last_log_term);
        if vote_granted {
            if !self.persist_hard_state(HardState {
                term,
                voted_for: Some(request.candidate_id),
            }) {
                return None;
            }
            self.reset_election_timer();
            info!(self.logger, "granted vote"; "candidate" => request.candidate_id, "term" => term);
        }
        Some(VoteResponse { term, vote_granted })
    }

    fn on_append_entries(&mut self, request: AppendEntries) -> Option<AppendResponse> {
        if self.halted.is_some() {
            return None;
        }
        if request.term < self.hard_state.term {
            return Some(self.reject_append());
        }
        if !self.become_follower(request.term, Some(request.leader_id)) {
            return None;
        }
        self.last_leader_contact = Some(Instant::now());
        self.reset_election_timer();

        let matched = request.prev_log_index + request.entries.len() as u64;
        let mut entries = request.entries;
        let (boundary, _) = self.log.boundary();
        if request.prev_log_index < boundary {
            // Entries up to the boundary are committed, so they match.
            let skip = (boundary - request.prev_log_index) as usize;
            entries.drain(..skip.min(entries.len()));
        } else if self.log.term_at(request.prev_log_index) != Some(request.prev_log_term) {
            debug!(self.logger, "rejecting append, log mismatch";
                "prev_log_index" => request.prev_log_index,
                "prev_log_term" => request.prev_log_term,
                "last_index" => self.log.last_index());
            return Some(self.reject_append());
        }

        if let Some(pos) = self.log.find_conflict(&entries) {
            let first = entries[pos].index;
            if first <= self.log.last_index() {
                warn!(self.logger, "truncating conflicting entries";
                    "from" => first, "last_index" => self.log.last_index());
                if let Err(e) = self.log.truncate_suffix(first) {
                    self.halt(format!("failed to truncate the log: {}", e));
                    return None;
                }
                if self.membership.on_truncate(first) {
                    info!(self.logger, "configuration reverted";
                        "members" => ?self.membership.latest().ids());
                }
            }
            if !self.append_local(&entries[pos..]) {
                return None;
            }
        }

        if request.leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(request.leader_commit.min(matched));
        }
        Some(AppendResponse {
            term: self.hard_state.term,
            success: true,
            last_log_index: matched,
        })
    }

    fn reject_append(&self) -> AppendResponse {
        AppendResponse {
            term: self.hard_state.term,
            success: false,
            last_log_index: self.log.last_index(),
        }
    }

    fn on_install_snapshot(&mut self, request: InstallSnapshot) -> Option<AppendResponse> {
        if self.halted.is_some() {
            return None;
        }
        if request.term < self.hard_state.term {
            return Some(self.reject_append());
        }
        if !self.become_follower(request.term, Some(request.leader_id)) {
            return None;
        }
        self.last_leader_contact = Some(Instant::now());
        self.reset_election_timer();

        let last_index = request.snapshot.meta.last_index;
        if last_index > self.last_applied {
            info!(self.logger, "installing snapshot";
                "index" => last_index, "term" => request.snapshot.meta.last_term);
            if let Err(e) = self.install_snapshot(&request.snapshot) {
                self.halt(format!("failed to install snapshot: {}", e));
                return None;
            }
        }
        Some(AppendResponse {
            term: self.hard_state.term,
            success: true,
            last_log_index: last_index,
        })
    }

    fn install_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), RaftError> {
        let meta = &snapshot.meta;
        self.log.save_snapshot(snapshot)?;
        // A log that already holds the snapshot's last entry keeps its suffix.
        if self.log.term_at(meta.last_index) != Some(meta.last_term) {
            self.log.reset(meta.last_index, meta.last_term)?;
        }
        self.sink.restore(meta, &snapshot.data)?;

        self.last_applied = meta.last_index;
        self.commit_index = self.commit_index.max(meta.last_index);
        self.log.set_applied(meta.last_index);
        self.snapshot_index = meta.last_index;
        self.membership = Membership::rebuild(
            meta.config.clone(),
            self.log.entries(meta.last_index + 1, usize::MAX).iter(),
        );
        Ok(())
    }

    fn on_vote_result(
        &mut self,
        peer: NodeId,
        term: u64,
        result: Result<VoteResponse, TransportError>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                metrics::RPC_FAILURE_COUNTER
                    .with_label_values(&[self.label.as_str(), "vote"])
                    .inc();
                debug!(self.logger, "vote request failed"; "peer" => peer, "error" => %e);
                return;
            }
        };
        if self.halted.is_some() {
            return;
        }
        if response.term > self.hard_state.term {
            self.become_follower(response.term, None);
            return;
        }
        if self.role != Role::Candidate || term != self.hard_state.term || !response.vote_granted {
            return;
        }
        self.votes.insert(peer);
        if self.membership.latest().is_quorum(&self.votes) {
            self.become_leader();
        }
    }

    // -- apply and snapshot --

    fn apply_committed(&mut self) {
        if self.halted.is_some() {
            return;
        }
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = match self.log.entry(index) {
                Some(entry) => entry,
                None => {
                    self.halt(format!("committed entry {} is missing from the log", index));
                    return;
                }
            };
            if let Err(e) = self.sink.apply(entry) {
                self.halt(e.to_string());
                return;
            }
            self.last_applied = index;
            self.log.set_applied(index);
            self.membership.on_applied(index);
        }
    }

    fn maybe_snapshot(&mut self) {
        if self.halted.is_some()
            || self.last_applied < self.snapshot_index + self.config.snapshot_threshold
        {
            return;
        }
        let applied = self.last_applied;
        let last_term = match self.log.term_at(applied) {
            Some(term) => term,
            None => return,
        };
        let data = match self.sink.snapshot() {
            Ok(data) => data,
            Err(e) => {
                warn!(self.logger, "apply sink failed to snapshot"; "error" => %e);
                self.snapshot_index = applied;
                return;
            }
        };
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_index: applied,
                last_term,
                config: self.membership.applied().clone(),
            },
            data,
        };
        if let Err(e) = self.log.save_snapshot(&snapshot) {
            warn!(self.logger, "failed to save snapshot"; "error" => %e);
            self.snapshot_index = applied;
            return;
        }
        self.snapshot_index = applied;

        let upto = applied.saturating_sub(self.config.keep_logs);
        if upto > self.log.boundary().0 {
            if let Err(e) = self.log.compact_prefix(upto) {
                self.halt(format!("failed to compact the log: {}", e));
                return;
            }
        }
        info!(self.logger, "snapshot saved"; "index" => applied, "compacted_to" => upto);
    }

    fn publish_status(&self) {
        let status = NodeStatus {
            id: self.id,
            role: self.role,
            term: self.hard_state.term,
            leader: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            members: self.membership.latest().ids(),
            leader_ready: self.role == Role::Leader && self.commit_index >= self.term_start_index,
            halted: self.halted.clone(),
            followers: self.progress.followers(),
        };

        let label = [self.label.as_str()];
        metrics::TERM_GAUGE
            .with_label_values(&label)
            .set(status.term as i64);
        metrics::COMMIT_INDEX_GAUGE
            .with_label_values(&label)
            .set(status.commit_index as i64);
        metrics::LAST_APPLIED_GAUGE
            .with_label_values(&label)
            .set(status.last_applied as i64);
        metrics::ROLE_GAUGE
            .with_label_values(&label)
            .set(status.role.code());

        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}
