use std::sync::Arc;
use std::time::Duration;

use lwraft::config::{NodeConfig, RuntimeConfig};
use lwraft::raft::{
    ClusterConfig, ConsensusNode, FileHardStateStore, FileLogStore, Member, MemorySink, NodeId,
    RaftConfig, RaftHandle, Role,
};
use lwraft::raft_client::GrpcTransport;
use lwraft::raft_service;
use lwraft::server::Server;
use slog::{o, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

fn logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

async fn wait_for_leader(handles: &[RaftHandle]) -> RaftHandle {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(handle) = handles
            .iter()
            .find(|h| h.status().role == Role::Leader && h.status().leader_ready)
        {
            return handle.clone();
        }
        assert!(Instant::now() < deadline, "no leader elected over grpc");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_replicate_over_grpc() {
    let dir = tempfile::tempdir().unwrap();
    let mut listeners = Vec::new();
    for _ in 0..3 {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let members: Vec<Member> = listeners
        .iter()
        .enumerate()
        .map(|(i, l)| Member::new(i as NodeId + 1, l.local_addr().unwrap().to_string()))
        .collect();
    let cluster = ClusterConfig::bootstrap(members);
    let config = RaftConfig::default();

    let mut handles = Vec::new();
    let mut sinks = Vec::new();
    let mut tasks = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let id = i as NodeId + 1;
        let node_dir = dir.path().join(format!("node{}", id));
        let sink = MemorySink::new();
        let (node, handle) = ConsensusNode::new(
            id,
            config.clone(),
            cluster.clone(),
            FileLogStore::open(node_dir.join("log"), config.segment_entries).unwrap(),
            FileHardStateStore::open(&node_dir).unwrap(),
            sink.clone(),
            Arc::new(GrpcTransport::new(config.max_frame_bytes)),
            &logger(),
        )
        .unwrap();
        let service = handle.clone();
        tasks.push(tokio::spawn(async move {
            raft_service::serve(listener, service).await.unwrap();
        }));
        tasks.push(node.spawn());
        handles.push(handle);
        sinks.push(sink);
    }

    let leader = wait_for_leader(&handles).await;
    let mut last = 0;
    for i in 0..5 {
        last = leader.propose(format!("cn=tcp{}", i).into_bytes()).await.unwrap();
    }
    for handle in &handles {
        handle.wait_applied(last, Duration::from_secs(10)).await.unwrap();
    }
    for sink in &sinks {
        assert_eq!(sink.mutations(), sinks[0].mutations());
        assert_eq!(sink.mutations().len(), 5);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let followers = leader.status().followers;
        if followers.len() == 2 && followers.iter().all(|f| f.reachable && f.match_index >= last) {
            break;
        }
        assert!(Instant::now() < deadline, "followers never caught up: {:?}", followers);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for handle in &handles {
        handle.shutdown().await;
    }
    for task in tasks {
        task.abort();
    }
}

async fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

async fn http_get(addr: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.0\r\nHost: {}\r\n\r\n", path, addr);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_server_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_addr().await;
    let config = RuntimeConfig {
        id: 1,
        addr: addr.clone(),
        metrics_addr: free_addr().await,
        data_dir: dir.path().to_path_buf(),
        node_list: vec![NodeConfig { id: 1, addr }],
        raft: RaftConfig::default(),
    };

    let mut server = Server::new(config.clone());
    server.start(&logger()).await.unwrap();
    let handle = server.handle().unwrap().clone();
    let leader = wait_for_leader(std::slice::from_ref(&handle)).await;
    let index = leader.propose(&b"cn=durable"[..]).await.unwrap();
    leader.wait_applied(index, Duration::from_secs(5)).await.unwrap();

    let status = http_get(&config.metrics_addr, "/status").await;
    assert!(status.contains("\"role\":\"leader\""), "{}", status);
    assert!(status.contains("\"followers\":[]"), "{}", status);
    let metrics = http_get(&config.metrics_addr, "/metrics").await;
    assert!(metrics.contains("raft_commit_index"), "{}", metrics);
    assert!(http_get(&config.metrics_addr, "/nope").await.contains("404"));
    server.stop().await;

    let mut restarted = Server::new(config);
    restarted.start(&logger()).await.unwrap();
    let handle = restarted.handle().unwrap().clone();
    assert!(handle.status().last_applied >= index);
    let leader = wait_for_leader(std::slice::from_ref(&handle)).await;
    assert!(leader.status().term >= 2);
    restarted.stop().await;
}
