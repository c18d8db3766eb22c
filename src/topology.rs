//! Cluster topology description.
//!
//! These types are value descriptions of the cluster that the bootstrap
//! forms. They are computed once from configuration and never mutated; all
//! mutation targets the external cluster.

use crate::error::{BootstrapError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// A `host:port` network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| BootstrapError::Topology(format!("endpoint '{}' is not host:port", s)))?;
        if host.is_empty() {
            return Err(BootstrapError::Topology(format!(
                "endpoint '{}' has an empty host",
                s
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BootstrapError::Topology(format!("endpoint '{}' has an invalid port", s)))?;
        Ok(Endpoint::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = BootstrapError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// One member of a replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member id, unique within its set
    pub id: u32,
    pub endpoint: Endpoint,
}

/// Description of one replica set, either the config-server set or a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSetSpec {
    /// Replica set name, unique across the topology
    pub id: String,
    /// Metadata-only (config server) when true, data-bearing shard otherwise
    pub config_server: bool,
    pub members: Vec<Member>,
}

impl ReplicaSetSpec {
    /// Build a replica set spec, numbering members in the given order.
    pub fn new(id: impl Into<String>, config_server: bool, endpoints: Vec<Endpoint>) -> Result<Self> {
        let members = endpoints
            .into_iter()
            .enumerate()
            .map(|(i, endpoint)| Member {
                id: i as u32,
                endpoint,
            })
            .collect();
        let spec = Self {
            id: id.into(),
            config_server,
            members,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Check the per-set invariants: a name, at least one member, unique
    /// member ids and unique member endpoints.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(BootstrapError::Topology(
                "replica set identifier must not be empty".to_string(),
            ));
        }
        if self.members.is_empty() {
            return Err(BootstrapError::Topology(format!(
                "replica set '{}' has no members",
                self.id
            )));
        }
        let mut ids = HashSet::new();
        let mut endpoints = HashSet::new();
        for member in &self.members {
            if !ids.insert(member.id) {
                return Err(BootstrapError::Topology(format!(
                    "replica set '{}' has duplicate member id {}",
                    self.id, member.id
                )));
            }
            if !endpoints.insert(&member.endpoint) {
                return Err(BootstrapError::Topology(format!(
                    "replica set '{}' lists {} twice",
                    self.id, member.endpoint
                )));
            }
        }
        Ok(())
    }

    /// The member the formation command is sent to.
    pub fn seed(&self) -> Result<&Member> {
        self.members.first().ok_or_else(|| {
            BootstrapError::Topology(format!("replica set '{}' has no members", self.id))
        })
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.members.iter().map(|m| m.endpoint.clone()).collect()
    }
}

/// Router registration record for one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    /// Shard name, equal to the replica set identifier
    pub name: String,
    pub members: Vec<Endpoint>,
}

impl ShardSpec {
    pub fn from_replica_set(set: &ReplicaSetSpec) -> Self {
        Self {
            name: set.id.clone(),
            members: set.endpoints(),
        }
    }

    /// Seed list in `setName/host:port,host:port` form.
    pub fn connection_string(&self) -> String {
        let hosts = self
            .members
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}/{}", self.name, hosts)
    }
}

/// How shard key values map onto chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStrategy {
    Hashed,
    Range,
}

impl fmt::Display for ShardStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardStrategy::Hashed => write!(f, "hashed"),
            ShardStrategy::Range => write!(f, "range"),
        }
    }
}

/// A single-field shard key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKey {
    pub field: String,
    pub strategy: ShardStrategy,
}

impl ShardKey {
    pub fn hashed(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            strategy: ShardStrategy::Hashed,
        }
    }

    pub fn range(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            strategy: ShardStrategy::Range,
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: {}}}", self.field, self.strategy)
    }
}

/// Partitioning plan for one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseShardingSpec {
    pub database: String,
    /// Collection name -> shard key, iterated in name order
    pub collections: BTreeMap<String, ShardKey>,
}

impl DatabaseShardingSpec {
    /// Shard every collection on the same key.
    pub fn uniform(database: impl Into<String>, collections: &[String], key: ShardKey) -> Self {
        Self {
            database: database.into(),
            collections: collections
                .iter()
                .map(|c| (c.clone(), key.clone()))
                .collect(),
        }
    }

    pub fn key_for(&self, collection: &str) -> Option<&ShardKey> {
        self.collections.get(collection)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(BootstrapError::Topology(
                "database name must not be empty".to_string(),
            ));
        }
        if self.collections.is_empty() {
            return Err(BootstrapError::Topology(format!(
                "database '{}' declares no collections",
                self.database
            )));
        }
        for (collection, key) in &self.collections {
            if collection.trim().is_empty() || key.field.trim().is_empty() {
                return Err(BootstrapError::Topology(format!(
                    "database '{}' has an empty collection or shard key field",
                    self.database
                )));
            }
        }
        Ok(())
    }
}

/// Full description of the cluster to form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    pub config_servers: ReplicaSetSpec,
    pub shards: Vec<ReplicaSetSpec>,
    pub router: Endpoint,
    pub sharding: DatabaseShardingSpec,
}

impl ClusterTopology {
    pub fn new(
        config_servers: ReplicaSetSpec,
        shards: Vec<ReplicaSetSpec>,
        router: Endpoint,
        sharding: DatabaseShardingSpec,
    ) -> Result<Self> {
        let topology = Self {
            config_servers,
            shards,
            router,
            sharding,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Check the cross-set invariants on top of the per-set ones.
    pub fn validate(&self) -> Result<()> {
        if !self.config_servers.config_server {
            return Err(BootstrapError::Topology(format!(
                "replica set '{}' must be marked as config server",
                self.config_servers.id
            )));
        }
        if self.shards.is_empty() {
            return Err(BootstrapError::Topology(
                "at least one shard replica set is required".to_string(),
            ));
        }
        if let Some(shard) = self.shards.iter().find(|s| s.config_server) {
            return Err(BootstrapError::Topology(format!(
                "shard '{}' must not be marked as config server",
                shard.id
            )));
        }

        let mut ids = HashSet::new();
        let mut endpoints: HashSet<&Endpoint> = HashSet::new();
        endpoints.insert(&self.router);

        for set in self.replica_sets() {
            set.validate()?;
            if !ids.insert(set.id.as_str()) {
                return Err(BootstrapError::Topology(format!(
                    "replica set identifier '{}' is used twice",
                    set.id
                )));
            }
            for member in &set.members {
                if !endpoints.insert(&member.endpoint) {
                    return Err(BootstrapError::Topology(format!(
                        "endpoint {} appears in more than one role",
                        member.endpoint
                    )));
                }
            }
        }

        self.sharding.validate()
    }

    /// Config-server set followed by the shard sets.
    pub fn replica_sets(&self) -> impl Iterator<Item = &ReplicaSetSpec> {
        std::iter::once(&self.config_servers).chain(self.shards.iter())
    }

    pub fn shard_specs(&self) -> Vec<ShardSpec> {
        self.shards.iter().map(ShardSpec::from_replica_set).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eps(host: &str, n: usize, port: u16) -> Vec<Endpoint> {
        (1..=n)
            .map(|i| Endpoint::new(format!("{}{}", host, i), port))
            .collect()
    }

    fn sharding() -> DatabaseShardingSpec {
        DatabaseShardingSpec::uniform(
            "vesselDB",
            &["raw_data".to_string(), "filtered_data".to_string()],
            ShardKey::hashed("MMSI"),
        )
    }

    #[test]
    fn test_endpoint_parse() {
        let ep: Endpoint = "configsvr1:27019".parse().unwrap();
        assert_eq!(ep, Endpoint::new("configsvr1", 27019));
        assert_eq!(ep.to_string(), "configsvr1:27019");

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":27017".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_replica_set_requires_members() {
        assert!(ReplicaSetSpec::new("rs", false, vec![]).is_err());
    }

    #[test]
    fn test_replica_set_rejects_duplicate_endpoint() {
        let ep = Endpoint::new("a", 1);
        assert!(ReplicaSetSpec::new("rs", false, vec![ep.clone(), ep]).is_err());
    }

    #[test]
    fn test_replica_set_rejects_duplicate_member_id() {
        let mut set = ReplicaSetSpec::new("rs", false, eps("a", 2, 1)).unwrap();
        set.members[1].id = 0;
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_shard_connection_string() {
        let set = ReplicaSetSpec::new("shard1ReplSet", false, eps("shard1-", 2, 27018)).unwrap();
        let shard = ShardSpec::from_replica_set(&set);
        assert_eq!(
            shard.connection_string(),
            "shard1ReplSet/shard1-1:27018,shard1-2:27018"
        );
    }

    #[test]
    fn test_topology_rejects_duplicate_set_ids() {
        let config = ReplicaSetSpec::new("cfg", true, eps("cfg", 3, 27019)).unwrap();
        let s1 = ReplicaSetSpec::new("shard", false, eps("a", 3, 27018)).unwrap();
        let s2 = ReplicaSetSpec::new("shard", false, eps("b", 3, 27018)).unwrap();
        let result = ClusterTopology::new(
            config,
            vec![s1, s2],
            Endpoint::new("mongos", 27017),
            sharding(),
        );
        assert!(matches!(result, Err(BootstrapError::Topology(_))));
    }

    #[test]
    fn test_topology_rejects_shared_endpoints() {
        let config = ReplicaSetSpec::new("cfg", true, eps("cfg", 3, 27019)).unwrap();
        let s1 = ReplicaSetSpec::new("s1", false, eps("a", 3, 27018)).unwrap();
        let s2 = ReplicaSetSpec::new("s2", false, eps("a", 1, 27018)).unwrap();
        let result = ClusterTopology::new(
            config,
            vec![s1, s2],
            Endpoint::new("mongos", 27017),
            sharding(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_topology_requires_a_shard() {
        let config = ReplicaSetSpec::new("cfg", true, eps("cfg", 3, 27019)).unwrap();
        let result = ClusterTopology::new(config, vec![], Endpoint::new("mongos", 27017), sharding());
        assert!(result.is_err());
    }

    #[test]
    fn test_topology_config_flag_enforced() {
        let config = ReplicaSetSpec::new("cfg", false, eps("cfg", 3, 27019)).unwrap();
        let s1 = ReplicaSetSpec::new("s1", false, eps("a", 3, 27018)).unwrap();
        let result = ClusterTopology::new(config, vec![s1], Endpoint::new("mongos", 27017), sharding());
        assert!(result.is_err());
    }

    #[test]
    fn test_seed_of_emptied_set_is_error() {
        let mut set = ReplicaSetSpec::new("s1", false, eps("a", 1, 27018)).unwrap();
        assert_eq!(set.seed().unwrap().endpoint, Endpoint::new("a1", 27018));

        set.members.clear();
        assert!(matches!(set.seed(), Err(BootstrapError::Topology(_))));
    }
}
