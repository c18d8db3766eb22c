//! Bootstrap configuration.
//!
//! Loaded from a TOML file. Every section and field has a default matching
//! the reference deployment (one router, three config servers, two shards of
//! three members each), so an empty file is a valid configuration.
//!
//! ```toml
//! [cluster]
//! router = "mongos:27017"
//! per_phase_timeout_secs = 120
//! checkpoint_path = "shardboot.checkpoint.json"
//!
//! [config_servers]
//! id = "configReplSet"
//! members = ["configsvr1:27019", "configsvr2:27019", "configsvr3:27019"]
//!
//! [[shards]]
//! id = "shard1ReplSet"
//! members = ["shard1-1:27018", "shard1-2:27018", "shard1-3:27018"]
//!
//! [sharding]
//! database = "vesselDB"
//! collections = ["raw_data", "filtered_data"]
//! shard_key = "MMSI"
//! strategy = "hashed"
//! ```

use crate::bootstrap::{OrchestratorOptions, PollPolicy};
use crate::error::{BootstrapError, Result};
use crate::topology::{
    ClusterTopology, DatabaseShardingSpec, Endpoint, ReplicaSetSpec, ShardKey, ShardStrategy,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which `ClusterAdmin` implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Real mongod/mongos nodes
    Mongo,
    /// In-process rehearsal against a simulated cluster
    Simulated,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub cluster: ClusterConfig,
    pub config_servers: ReplicaSetConfig,
    pub shards: Vec<ReplicaSetConfig>,
    pub sharding: ShardingConfig,
    pub poll: PollConfig,
    pub logging: LoggingConfig,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            config_servers: ReplicaSetConfig::numbered("configReplSet", "configsvr", 27019),
            shards: vec![
                ReplicaSetConfig::numbered("shard1ReplSet", "shard1-", 27018),
                ReplicaSetConfig::numbered("shard2ReplSet", "shard2-", 27018),
            ],
            sharding: ShardingConfig::default(),
            poll: PollConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub router: Endpoint,
    pub per_phase_timeout_secs: u64,
    pub overall_timeout_secs: u64,
    /// Progress marker; resumption is disabled when unset
    pub checkpoint_path: Option<PathBuf>,
    pub backend: Backend,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            router: Endpoint::new("mongos", 27017),
            per_phase_timeout_secs: 120,
            overall_timeout_secs: 900,
            checkpoint_path: Some(PathBuf::from("shardboot.checkpoint.json")),
            backend: Backend::Mongo,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSetConfig {
    pub id: String,
    pub members: Vec<Endpoint>,
}

impl ReplicaSetConfig {
    /// Three members named `<prefix>1..3` on `port`.
    fn numbered(id: &str, prefix: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            members: (1..=3)
                .map(|i| Endpoint::new(format!("{}{}", prefix, i), port))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub database: String,
    pub collections: Vec<String>,
    pub shard_key: String,
    pub strategy: ShardStrategy,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            database: "vesselDB".to_string(),
            collections: vec!["raw_data".to_string(), "filtered_data".to_string()],
            shard_key: "MMSI".to_string(),
            strategy: ShardStrategy::Hashed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 250,
            max_interval_ms: 5000,
            probe_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `shardboot=debug`
    pub level: String,
    /// `pretty`, `compact` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl BootstrapConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BootstrapError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BootstrapError::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster.per_phase_timeout_secs == 0 || self.cluster.overall_timeout_secs == 0 {
            return Err(BootstrapError::Config("timeouts must be positive".to_string()));
        }
        if self.poll.initial_interval_ms == 0 || self.poll.probe_timeout_ms == 0 {
            return Err(BootstrapError::Config(
                "poll intervals must be positive".to_string(),
            ));
        }
        self.topology().map(|_| ())
    }

    /// Build the immutable topology the orchestrator runs against.
    pub fn topology(&self) -> Result<ClusterTopology> {
        let config_servers = ReplicaSetSpec::new(
            self.config_servers.id.clone(),
            true,
            self.config_servers.members.clone(),
        )?;
        let shards = self
            .shards
            .iter()
            .map(|s| ReplicaSetSpec::new(s.id.clone(), false, s.members.clone()))
            .collect::<Result<Vec<_>>>()?;
        let key = ShardKey {
            field: self.sharding.shard_key.clone(),
            strategy: self.sharding.strategy,
        };
        let sharding = DatabaseShardingSpec::uniform(
            self.sharding.database.clone(),
            &self.sharding.collections,
            key,
        );

        ClusterTopology::new(config_servers, shards, self.cluster.router.clone(), sharding)
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            per_phase_timeout: Duration::from_secs(self.cluster.per_phase_timeout_secs),
            overall_timeout: Duration::from_secs(self.cluster.overall_timeout_secs),
            poll: PollPolicy {
                initial_interval: Duration::from_millis(self.poll.initial_interval_ms),
                max_interval: Duration::from_millis(self.poll.max_interval_ms),
                probe_timeout: Duration::from_millis(self.poll.probe_timeout_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_reference_topology() {
        let config = BootstrapConfig::from_toml("").unwrap();
        assert_eq!(config, BootstrapConfig::default());

        let topology = config.topology().unwrap();
        assert_eq!(topology.config_servers.members.len(), 3);
        assert_eq!(topology.shards.len(), 2);
        assert_eq!(topology.router, Endpoint::new("mongos", 27017));
        assert_eq!(topology.sharding.database, "vesselDB");
        assert_eq!(
            topology.sharding.key_for("filtered_data"),
            Some(&ShardKey::hashed("MMSI"))
        );
    }

    #[test]
    fn test_parse_custom_topology() {
        let toml = r#"
[cluster]
router = "router.local:27017"
per_phase_timeout_secs = 30
backend = "simulated"

[config_servers]
id = "cfg"
members = ["c1:27019"]

[[shards]]
id = "a"
members = ["a1:27018", "a2:27018"]

[[shards]]
id = "b"
members = ["b1:27018"]

[[shards]]
id = "c"
members = ["c1:27018"]

[sharding]
database = "ais"
collections = ["positions"]
shard_key = "ts"
strategy = "range"

[logging]
level = "debug"
"#;
        let config = BootstrapConfig::from_toml(toml).unwrap();
        assert_eq!(config.cluster.backend, Backend::Simulated);
        config.validate().unwrap();

        let topology = config.topology().unwrap();
        assert_eq!(topology.shards.len(), 3);
        assert_eq!(topology.sharding.key_for("positions"), Some(&ShardKey::range("ts")));
        assert_eq!(
            config.orchestrator_options().per_phase_timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_replica_set_without_members_rejected() {
        let config = BootstrapConfig::from_toml("[config_servers]\nid = \"cfg\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_endpoint_rejected() {
        let toml = "[cluster]\nrouter = \"mongos\"\n";
        assert!(BootstrapConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = BootstrapConfig::default();
        config.cluster.per_phase_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_print_and_reparse() {
        let config = BootstrapConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(BootstrapConfig::from_toml(&text).unwrap(), config);
    }
}
