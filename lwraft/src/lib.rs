//! lwraft: a Raft consensus core that keeps the replicas of a directory
//! server in agreement on one ordered log of mutations.

pub mod config;
pub mod metrics;
pub mod proto;
pub mod raft;
pub mod raft_client;
pub mod raft_service;
pub mod server;
pub mod store;
