use anyhow::{bail, Context};
use log::warn;
use serde_derive::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::raft::membership::{ClusterConfig, Member};
use crate::raft::RaftConfig;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: u64,
    pub addr: String,
}

/// Process configuration, read from a TOML file.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub id: u64,
    /// Address the peer RPC listener binds.
    pub addr: String,
    /// Address of the `/metrics` and `/status` endpoint.
    pub metrics_addr: String,
    pub data_dir: PathBuf,
    /// Bootstrap members. A node missing from this list starts as a joiner
    /// and waits to be added.
    pub node_list: Vec<NodeConfig>,
    pub raft: RaftConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            id: 1,
            addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            data_dir: PathBuf::from("data"),
            node_list: Vec::new(),
            raft: RaftConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Reads the config at `path`. A missing file yields the defaults; a file
    /// that does not parse is an error.
    pub fn from_toml(path: &str) -> anyhow::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Runtime config file {} not found, using defaults", path);
                return Ok(RuntimeConfig::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading runtime config {}", path)),
        };
        Self::parse(&contents).with_context(|| format!("parsing runtime config {}", path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.raft.validate()?;
        let mut seen = HashSet::new();
        for node in &self.node_list {
            if !seen.insert(node.id) {
                bail!("node {} appears twice in node_list", node.id);
            }
        }
        if self.node_list.is_empty() {
            warn!("node_list is empty, node {} can only join an existing cluster", self.id);
        }
        Ok(())
    }

    /// Member set the cluster starts from.
    pub fn bootstrap(&self) -> ClusterConfig {
        ClusterConfig::bootstrap(
            self.node_list
                .iter()
                .map(|node| Member::new(node.id, node.addr.clone())),
        )
    }
}
