//! Prometheus collectors for the consensus core.
//!
//! Every series is labelled with the node id so that several nodes sharing a
//! process stay apart.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    pub static ref TERM_GAUGE: IntGaugeVec =
        IntGaugeVec::new(Opts::new("raft_term", "current term"), &["node"]).unwrap();

    pub static ref COMMIT_INDEX_GAUGE: IntGaugeVec =
        IntGaugeVec::new(Opts::new("raft_commit_index", "highest committed log index"), &["node"]).unwrap();

    pub static ref LAST_APPLIED_GAUGE: IntGaugeVec =
        IntGaugeVec::new(Opts::new("raft_last_applied", "highest applied log index"), &["node"]).unwrap();

    /// 0 follower, 1 candidate, 2 leader
    pub static ref ROLE_GAUGE: IntGaugeVec =
        IntGaugeVec::new(Opts::new("raft_role", "current role"), &["node"]).unwrap();

    pub static ref ELECTION_COUNTER: IntCounterVec =
        IntCounterVec::new(Opts::new("raft_elections_total", "elections started"), &["node"]).unwrap();

    pub static ref PROPOSAL_COUNTER: IntCounterVec =
        IntCounterVec::new(Opts::new("raft_proposals_total", "entries accepted by the leader"), &["node"]).unwrap();

    /// Failed peer RPCs by kind (vote, append, snapshot)
    pub static ref RPC_FAILURE_COUNTER: IntCounterVec = IntCounterVec::new(
        Opts::new("raft_rpc_failures_total", "peer rpcs that failed or timed out"),
        &["node", "kind"]
    )
    .unwrap();

    /// Histogram for durable log appends
    pub static ref APPEND_HISTOGRAM: HistogramVec = HistogramVec::new(
        HistogramOpts::new("raft_append_seconds", "durable log append latency"),
        &["node"]
    )
    .unwrap();
}

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(TERM_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(COMMIT_INDEX_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(LAST_APPLIED_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ROLE_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ELECTION_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(PROPOSAL_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(RPC_FAILURE_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPEND_HISTOGRAM.clone()));
}

/// Renders the registry in the text exposition format.
pub fn encode_text() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY_INSTANCE.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_series_are_exported() {
        init_registry();
        TERM_GAUGE.with_label_values(&["metrics-test"]).set(4);
        RPC_FAILURE_COUNTER
            .with_label_values(&["metrics-test", "append"])
            .inc();
        let text = String::from_utf8(encode_text().unwrap()).unwrap();
        assert!(text.contains("raft_term{node=\"metrics-test\"} 4"));
        assert!(text.contains("raft_rpc_failures_total"));
    }
}
