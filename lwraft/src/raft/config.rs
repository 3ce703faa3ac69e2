use std::time::Duration;

use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::raft::error::RaftError;

/// Timing and sizing knobs of a consensus node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub heartbeat_interval_ms: u64,
    /// Lower bound T of the election timeout, drawn from [T, 2T].
    pub election_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    /// Extra delay before a freshly started node may campaign.
    pub startup_grace_ms: u64,
    pub max_entries_per_append: usize,
    /// Applied entries past the last snapshot that trigger a new one.
    pub snapshot_threshold: u64,
    /// Entries kept behind a snapshot for slightly lagging followers.
    pub keep_logs: u64,
    pub segment_entries: usize,
    /// Largest encoded AppendEntries or InstallSnapshot a leader sends.
    pub max_frame_bytes: usize,
    pub event_queue_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            heartbeat_interval_ms: 50,
            election_timeout_ms: 300,
            rpc_timeout_ms: 250,
            startup_grace_ms: 0,
            max_entries_per_append: 64,
            snapshot_threshold: 1024,
            keep_logs: 256,
            segment_entries: 4096,
            max_frame_bytes: 64 * 1024 * 1024,
            event_queue_size: 1024,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(RaftError::Config(format!(
                "heartbeat interval {}ms must be positive and below the election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_ms
            )));
        }
        if self.rpc_timeout_ms == 0 || self.rpc_timeout_ms > self.election_timeout_ms {
            return Err(RaftError::Config(format!(
                "rpc timeout {}ms must be positive and at most the election timeout {}ms",
                self.rpc_timeout_ms, self.election_timeout_ms
            )));
        }
        let sizes = [
            ("max_entries_per_append", self.max_entries_per_append as u64),
            ("snapshot_threshold", self.snapshot_threshold),
            ("segment_entries", self.segment_entries as u64),
            ("max_frame_bytes", self.max_frame_bytes as u64),
            ("event_queue_size", self.event_queue_size as u64),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(RaftError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// A fresh election timeout, uniformly random in [T, 2T].
    pub fn random_election_timeout(&self) -> Duration {
        let t = self.election_timeout_ms;
        Duration::from_millis(rand::thread_rng().gen_range(t..=2 * t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RaftConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_slow_heartbeat() {
        let config = RaftConfig {
            heartbeat_interval_ms: 300,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RaftError::Config(_))));
    }

    #[test]
    fn rejects_zero_sizes() {
        let config = RaftConfig {
            segment_entries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn election_timeout_stays_in_range() {
        let config = RaftConfig::default();
        for _ in 0..200 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= Duration::from_millis(300));
            assert!(timeout <= Duration::from_millis(600));
        }
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: RaftConfig = toml::from_str("election_timeout_ms = 1000").unwrap();
        assert_eq!(config.election_timeout_ms, 1000);
        assert_eq!(config.heartbeat_interval_ms, 50);
    }
}
