//! In-process model of a sharded cluster.
//!
//! Used by the tests and by `--simulate` rehearsal runs. Nodes can
//! be taken down or isolated to exercise the failure paths of the bootstrap.

use super::{
    AdminError, AdminResult, ClusterAdmin, MemberState, MemberStatus, RegisteredShard,
    ReplicaSetStatus,
};
use crate::topology::{ClusterTopology, Endpoint, ReplicaSetSpec, ShardKey, ShardSpec};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Fault state of a simulated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCondition {
    /// Healthy
    Up,
    /// Fails the liveness probe and every command
    Down,
    /// Answers probes but cannot reach its peers, so it never votes
    Isolated,
}

/// Record of one call made against the simulated cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCall {
    Ping(Endpoint),
    Initiate { seed: Endpoint, set_id: String },
    Status(Endpoint),
    ListShards,
    AddShard(String),
    EnableSharding(String),
    ListCollections(String),
    CreateCollection(String),
    ShardCollection(String),
    ShardKey(String),
}

#[derive(Debug)]
struct SimReplicaSet {
    config_server: bool,
    members: Vec<Endpoint>,
    status_polls: u32,
    primary: Option<Endpoint>,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: HashMap<Endpoint, NodeCondition>,
    sets: BTreeMap<String, SimReplicaSet>,
    membership: HashMap<Endpoint, String>,
    election_polls: u32,
    shards: BTreeMap<String, String>,
    sharded_databases: HashSet<String>,
    collections: BTreeMap<String, BTreeSet<String>>,
    shard_keys: HashMap<String, ShardKey>,
    calls: Vec<AdminCall>,
}

impl SimState {
    fn condition(&self, endpoint: &Endpoint) -> NodeCondition {
        self.nodes
            .get(endpoint)
            .copied()
            .unwrap_or(NodeCondition::Down)
    }

    fn reachable(&self, endpoint: &Endpoint) -> AdminResult<()> {
        match self.condition(endpoint) {
            NodeCondition::Down => Err(AdminError::Unreachable {
                endpoint: endpoint.clone(),
                reason: "connection refused".to_string(),
            }),
            NodeCondition::Up | NodeCondition::Isolated => Ok(()),
        }
    }

    /// The router can only serve metadata while the config servers have a primary.
    fn router_ready(&self, router: &Endpoint) -> AdminResult<()> {
        self.reachable(router)?;
        let config_ready = self
            .sets
            .values()
            .any(|set| set.config_server && set.primary.is_some());
        if config_ready {
            Ok(())
        } else {
            Err(AdminError::Rejected {
                code: Some(133),
                message: "could not find host matching read preference for config servers"
                    .to_string(),
            })
        }
    }

    fn try_elect(&mut self, set_id: &str) {
        let election_polls = self.election_polls;
        let healthy: Vec<Endpoint> = match self.sets.get(set_id) {
            Some(set) => set
                .members
                .iter()
                .filter(|m| self.condition(m) == NodeCondition::Up)
                .cloned()
                .collect(),
            None => return,
        };
        let Some(set) = self.sets.get_mut(set_id) else {
            return;
        };

        if let Some(primary) = &set.primary {
            if healthy.contains(primary) {
                return;
            }
            set.primary = None;
        }

        set.status_polls += 1;
        let majority = set.members.len() / 2 + 1;
        if set.status_polls >= election_polls && healthy.len() >= majority {
            set.primary = healthy.first().cloned();
        }
    }
}

/// Simulated cluster backend.
#[derive(Debug)]
pub struct SimulatedCluster {
    state: Mutex<SimState>,
    latency: Duration,
}

impl SimulatedCluster {
    /// Create an empty cluster. Unknown endpoints are treated as down.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                election_polls: 2,
                ..SimState::default()
            }),
            latency: Duration::ZERO,
        }
    }

    /// Create a cluster where every node of `topology` is up.
    pub fn for_topology(topology: &ClusterTopology) -> Self {
        let cluster = Self::new();
        {
            let mut state = cluster.lock();
            for set in topology.replica_sets() {
                for endpoint in set.endpoints() {
                    state.nodes.insert(endpoint, NodeCondition::Up);
                }
            }
            state.nodes.insert(topology.router.clone(), NodeCondition::Up);
        }
        cluster
    }

    /// Delay applied to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of status polls a set needs before it can elect a primary.
    pub fn with_election_polls(self, polls: u32) -> Self {
        self.lock().election_polls = polls.max(1);
        self
    }

    pub fn set_condition(&self, endpoint: &Endpoint, condition: NodeCondition) {
        self.lock().nodes.insert(endpoint.clone(), condition);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<AdminCall> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&AdminCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Members of an initialized set.
    pub fn replica_set_members(&self, set_id: &str) -> Option<Vec<Endpoint>> {
        self.lock().sets.get(set_id).map(|s| s.members.clone())
    }

    pub fn is_initialized(&self, set_id: &str) -> bool {
        self.lock().sets.contains_key(set_id)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn namespace(database: &str, collection: &str) -> String {
    format!("{}.{}", database, collection)
}

#[async_trait]
impl ClusterAdmin for SimulatedCluster {
    async fn ping(&self, endpoint: &Endpoint) -> AdminResult<()> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.push(AdminCall::Ping(endpoint.clone()));
        state.reachable(endpoint)
    }

    async fn initiate_replica_set(&self, seed: &Endpoint, spec: &ReplicaSetSpec) -> AdminResult<()> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.push(AdminCall::Initiate {
            seed: seed.clone(),
            set_id: spec.id.clone(),
        });
        state.reachable(seed)?;

        if state.membership.contains_key(seed) {
            return Err(AdminError::AlreadyInitialized);
        }
        let members = spec.endpoints();
        if !members.contains(seed) {
            return Err(AdminError::Rejected {
                code: Some(93),
                message: format!("{} is not a member of the proposed config", seed),
            });
        }
        if let Some(taken) = members.iter().find(|m| state.membership.contains_key(*m)) {
            return Err(AdminError::Rejected {
                code: Some(93),
                message: format!("{} already belongs to another replica set", taken),
            });
        }

        for member in &members {
            state.membership.insert(member.clone(), spec.id.clone());
        }
        state.sets.insert(
            spec.id.clone(),
            SimReplicaSet {
                config_server: spec.config_server,
                members,
                status_polls: 0,
                primary: None,
            },
        );
        Ok(())
    }

    async fn replica_set_status(&self, member: &Endpoint) -> AdminResult<ReplicaSetStatus> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.push(AdminCall::Status(member.clone()));
        state.reachable(member)?;

        let set_id = state
            .membership
            .get(member)
            .cloned()
            .ok_or(AdminError::NotYetInitialized)?;
        state.try_elect(&set_id);

        let set = state.sets.get(&set_id).ok_or(AdminError::NotYetInitialized)?;
        let members = set
            .members
            .iter()
            .map(|m| {
                let member_state = if set.primary.as_ref() == Some(m) {
                    MemberState::Primary
                } else {
                    match state.condition(m) {
                        NodeCondition::Up if set.primary.is_some() => MemberState::Secondary,
                        NodeCondition::Up => MemberState::Startup,
                        NodeCondition::Isolated => MemberState::Unknown,
                        NodeCondition::Down => MemberState::Down,
                    }
                };
                MemberStatus {
                    name: m.to_string(),
                    state: member_state,
                }
            })
            .collect();

        Ok(ReplicaSetStatus {
            set_name: set_id,
            members,
        })
    }

    async fn list_shards(&self, router: &Endpoint) -> AdminResult<Vec<RegisteredShard>> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.push(AdminCall::ListShards);
        state.router_ready(router)?;
        Ok(state
            .shards
            .iter()
            .map(|(name, host)| RegisteredShard {
                name: name.clone(),
                host: host.clone(),
            })
            .collect())
    }

    async fn add_shard(&self, router: &Endpoint, shard: &ShardSpec) -> AdminResult<()> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.push(AdminCall::AddShard(shard.name.clone()));
        state.router_ready(router)?;

        let host = shard.connection_string();
        if let Some(existing) = state.shards.get(&shard.name) {
            return if *existing == host {
                Err(AdminError::AlreadyExists(format!("shard {}", shard.name)))
            } else {
                Err(AdminError::Rejected {
                    code: Some(96),
                    message: format!(
                        "shard {} already exists with a different host {}",
                        shard.name, existing
                    ),
                })
            };
        }

        let set = state.sets.get(&shard.name).ok_or_else(|| AdminError::Rejected {
            code: Some(96),
            message: format!("no replica set named {} is reachable", shard.name),
        })?;
        if set.config_server {
            return Err(AdminError::Rejected {
                code: Some(96),
                message: format!("{} is a config server replica set", shard.name),
            });
        }
        if shard.members.is_empty() || shard.members.iter().any(|m| !set.members.contains(m)) {
            return Err(AdminError::Rejected {
                code: Some(96),
                message: format!("host list {} does not match replica set members", host),
            });
        }
        if set.primary.is_none() {
            return Err(AdminError::Rejected {
                code: Some(96),
                message: format!("replica set {} has no primary", shard.name),
            });
        }

        state.shards.insert(shard.name.clone(), host);
        Ok(())
    }

    async fn enable_sharding(&self, router: &Endpoint, database: &str) -> AdminResult<()> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.push(AdminCall::EnableSharding(database.to_string()));
        state.router_ready(router)?;
        if state.shards.is_empty() {
            return Err(AdminError::Rejected {
                code: Some(70),
                message: "no shards registered".to_string(),
            });
        }
        state.sharded_databases.insert(database.to_string());
        state.collections.entry(database.to_string()).or_default();
        Ok(())
    }

    async fn list_collections(&self, router: &Endpoint, database: &str) -> AdminResult<Vec<String>> {
        self.delay().await;
        let mut state = self.lock();
        state.calls.push(AdminCall::ListCollections(database.to_string()));
        state.router_ready(router)?;
        Ok(state
            .collections
            .get(database)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_collection(
        &self,
        router: &Endpoint,
        database: &str,
        collection: &str,
    ) -> AdminResult<()> {
        self.delay().await;
        let mut state = self.lock();
        let ns = namespace(database, collection);
        state.calls.push(AdminCall::CreateCollection(ns.clone()));
        state.router_ready(router)?;
        let created = state
            .collections
            .entry(database.to_string())
            .or_default()
            .insert(collection.to_string());
        if created {
            Ok(())
        } else {
            Err(AdminError::AlreadyExists(ns))
        }
    }

    async fn shard_collection(
        &self,
        router: &Endpoint,
        database: &str,
        collection: &str,
        key: &ShardKey,
    ) -> AdminResult<()> {
        self.delay().await;
        let mut state = self.lock();
        let ns = namespace(database, collection);
        state.calls.push(AdminCall::ShardCollection(ns.clone()));
        state.router_ready(router)?;

        if !state.sharded_databases.contains(database) {
            return Err(AdminError::Rejected {
                code: Some(20),
                message: format!("sharding not enabled for db {}", database),
            });
        }
        match state.shard_keys.get(&ns).cloned() {
            Some(existing) if existing == *key => Err(AdminError::AlreadyExists(ns)),
            Some(existing) => Err(AdminError::Rejected {
                code: Some(20),
                message: format!("{} is already sharded with key {}", ns, existing),
            }),
            None => {
                state
                    .collections
                    .entry(database.to_string())
                    .or_default()
                    .insert(collection.to_string());
                state.shard_keys.insert(ns, key.clone());
                Ok(())
            }
        }
    }

    async fn collection_shard_key(
        &self,
        router: &Endpoint,
        database: &str,
        collection: &str,
    ) -> AdminResult<Option<ShardKey>> {
        self.delay().await;
        let mut state = self.lock();
        let ns = namespace(database, collection);
        state.calls.push(AdminCall::ShardKey(ns.clone()));
        state.router_ready(router)?;
        Ok(state.shard_keys.get(&ns).cloned())
    }
}
