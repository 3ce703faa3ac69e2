#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lwraft::raft::{
    ClusterConfig, ConsensusNode, LogStore, MemHardStateStore, MemLogStore, Member, MemorySink,
    NodeId, RaftConfig, RaftError, RaftHandle, Role,
};
use lwraft::raft::LocalNetwork;
use slog::{o, Logger};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Stores of one node. They outlive its control loop so the node can be
/// restarted on top of them.
pub struct TestNode {
    pub handle: RaftHandle,
    pub log: MemLogStore,
    pub hard_state: MemHardStateStore,
    pub sink: MemorySink,
    bootstrap: ClusterConfig,
    task: Option<JoinHandle<()>>,
}

pub struct TestCluster {
    pub network: LocalNetwork,
    pub config: RaftConfig,
    pub nodes: BTreeMap<NodeId, TestNode>,
    logger: Logger,
}

pub fn member(id: NodeId) -> Member {
    Member::new(id, format!("local:{}", id))
}

pub fn bootstrap(ids: impl IntoIterator<Item = NodeId>) -> ClusterConfig {
    ClusterConfig::bootstrap(ids.into_iter().map(member))
}

impl TestCluster {
    pub fn new(size: u64) -> Self {
        Self::with_config(size, RaftConfig::default())
    }

    pub fn with_config(size: u64, config: RaftConfig) -> Self {
        let mut cluster = TestCluster {
            network: LocalNetwork::new(),
            config,
            nodes: BTreeMap::new(),
            logger: Logger::root(slog::Discard, o!()),
        };
        let members = bootstrap(1..=size);
        for id in 1..=size {
            cluster.start_node(id, members.clone());
        }
        cluster
    }

    /// Starts a node with empty stores.
    pub fn start_node(&mut self, id: NodeId, bootstrap: ClusterConfig) {
        let log = MemLogStore::new();
        let hard_state = MemHardStateStore::new();
        let sink = MemorySink::new();
        self.spawn(id, bootstrap, log, hard_state, sink);
    }

    fn spawn(
        &mut self,
        id: NodeId,
        bootstrap: ClusterConfig,
        log: MemLogStore,
        hard_state: MemHardStateStore,
        sink: MemorySink,
    ) {
        let (node, handle) = ConsensusNode::new(
            id,
            self.config.clone(),
            bootstrap.clone(),
            log.clone(),
            hard_state.clone(),
            sink.clone(),
            Arc::new(self.network.transport(id)),
            &self.logger,
        )
        .expect("node starts");
        self.network.register(id, handle.clone());
        let task = Some(node.spawn());
        self.nodes.insert(
            id,
            TestNode {
                handle,
                log,
                hard_state,
                sink,
                bootstrap,
                task,
            },
        );
    }

    pub fn handle(&self, id: NodeId) -> &RaftHandle {
        &self.nodes[&id].handle
    }

    pub fn sink(&self, id: NodeId) -> &MemorySink {
        &self.nodes[&id].sink
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Stops a node's control loop. Its stores survive.
    pub async fn crash(&mut self, id: NodeId) {
        self.network.unregister(id);
        let node = self.nodes.get_mut(&id).expect("known node");
        node.handle.shutdown().await;
        if let Some(task) = node.task.take() {
            task.await.expect("node task");
        }
    }

    /// Starts a crashed node again on its surviving stores.
    pub fn restart(&mut self, id: NodeId) {
        let node = self.nodes.remove(&id).expect("known node");
        assert!(node.task.is_none(), "node {} is still running", id);
        self.spawn(id, node.bootstrap, node.log, node.hard_state, node.sink);
    }

    pub async fn shutdown(&mut self) {
        for id in self.ids() {
            if self.nodes[&id].task.is_some() {
                self.crash(id).await;
            }
        }
    }

    /// Waits for a ready leader among `ids`, returning the one with the
    /// highest term.
    pub async fn wait_for_leader_among(&self, ids: &[NodeId], timeout: Duration) -> NodeId {
        let deadline = Instant::now() + timeout;
        loop {
            let leader = ids
                .iter()
                .map(|id| self.handle(*id).status())
                .filter(|s| s.role == Role::Leader && s.leader_ready)
                .max_by_key(|s| s.term)
                .map(|s| s.id);
            if let Some(leader) = leader {
                return leader;
            }
            assert!(Instant::now() < deadline, "no leader among {:?} within {:?}", ids, timeout);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_leader(&self) -> NodeId {
        let ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.task.is_some())
            .map(|(id, _)| *id)
            .collect();
        self.wait_for_leader_among(&ids, Duration::from_secs(10)).await
    }

    /// Proposes on whichever node leads, following redirects.
    pub async fn propose(&self, data: impl Into<Bytes>) -> u64 {
        let data = data.into();
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let leader = self.wait_for_leader().await;
            match self.handle(leader).propose(data.clone()).await {
                Ok(index) => return index,
                Err(RaftError::NotLeader { .. }) => {}
                Err(e) => panic!("proposal failed: {}", e),
            }
            assert!(Instant::now() < deadline, "proposal was never accepted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_applied(&self, ids: &[NodeId], index: u64) {
        for id in ids {
            self.handle(*id)
                .wait_applied(index, Duration::from_secs(10))
                .await
                .unwrap_or_else(|e| panic!("node {} did not apply {}: {}", id, index, e));
        }
    }

    /// (index, term) of every entry a node's log still holds.
    pub fn log_terms(&self, id: NodeId) -> Vec<(u64, u64)> {
        let log = &self.nodes[&id].log;
        log.entries(log.first_index(), usize::MAX)
            .iter()
            .map(|e| (e.index, e.term))
            .collect()
    }
}
