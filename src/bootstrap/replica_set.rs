//! Replica set formation.

use crate::admin::{AdminError, ClusterAdmin, ReplicaSetStatus};
use crate::bootstrap::poll::{Backoff, PollPolicy};
use crate::error::{BootstrapError, Result};
use crate::topology::ReplicaSetSpec;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The writable member of a formed replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryEndpoint {
    pub set_id: String,
    /// Address as reported by the set
    pub address: String,
}

/// Forms one replica set and waits for it to elect a primary.
///
/// The formation command is only sent when the seed reports no replica set
/// config, so running it against an already formed set is a no-op.
#[derive(Clone)]
pub struct ReplicaSetInitiator {
    admin: Arc<dyn ClusterAdmin>,
    policy: PollPolicy,
}

impl ReplicaSetInitiator {
    pub fn new(admin: Arc<dyn ClusterAdmin>, policy: PollPolicy) -> Self {
        Self { admin, policy }
    }

    /// Form `spec` (if needed) and wait up to `timeout` for a primary.
    pub async fn initiate(&self, spec: &ReplicaSetSpec, timeout: Duration) -> Result<PrimaryEndpoint> {
        let deadline = Instant::now() + timeout;

        match self.issue_initiate(spec).await {
            Ok(()) => info!(
                "Sent replSetInitiate for '{}' ({} members, configsvr={})",
                spec.id,
                spec.members.len(),
                spec.config_server
            ),
            Err(BootstrapError::AlreadyInitialized { set_id }) => {
                info!("Replica set '{}' already initialized, skipping formation", set_id)
            }
            Err(e) => return Err(e),
        }

        self.await_primary(spec, deadline, timeout).await
    }

    /// Send the formation command unless the seed already belongs to a set.
    ///
    /// Reports an existing set as [`BootstrapError::AlreadyInitialized`].
    async fn issue_initiate(&self, spec: &ReplicaSetSpec) -> Result<()> {
        let seed = &spec.seed()?.endpoint;

        match self.admin.replica_set_status(seed).await {
            Ok(status) => return self.check_existing(spec, &status),
            Err(AdminError::NotYetInitialized) => {}
            Err(AdminError::Unreachable { endpoint, .. }) => {
                return Err(BootstrapError::Connectivity {
                    unreachable: vec![endpoint],
                })
            }
            Err(e) => {
                return Err(BootstrapError::Backend(format!(
                    "replSetGetStatus on {} failed: {}",
                    seed, e
                )))
            }
        }

        match self.admin.initiate_replica_set(seed, spec).await {
            Ok(()) => Ok(()),
            Err(AdminError::AlreadyInitialized) => {
                warn!("'{}' was initialized concurrently", spec.id);
                Err(BootstrapError::AlreadyInitialized {
                    set_id: spec.id.clone(),
                })
            }
            Err(AdminError::Unreachable { endpoint, .. }) => Err(BootstrapError::Connectivity {
                unreachable: vec![endpoint],
            }),
            Err(e) => Err(BootstrapError::Backend(format!(
                "replSetInitiate for '{}' failed: {}",
                spec.id, e
            ))),
        }
    }

    fn check_existing(&self, spec: &ReplicaSetSpec, status: &ReplicaSetStatus) -> Result<()> {
        if !status.set_name.is_empty() && status.set_name != spec.id {
            return Err(BootstrapError::Topology(format!(
                "seed {} already belongs to replica set '{}', expected '{}'",
                spec.seed()?.endpoint,
                status.set_name,
                spec.id
            )));
        }
        Err(BootstrapError::AlreadyInitialized {
            set_id: spec.id.clone(),
        })
    }

    async fn await_primary(
        &self,
        spec: &ReplicaSetSpec,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<PrimaryEndpoint> {
        let seed = &spec.seed()?.endpoint;
        let mut backoff = Backoff::new(&self.policy);

        loop {
            match self.admin.replica_set_status(seed).await {
                Ok(status) => {
                    if let Some(primary) = status.primary() {
                        info!("Replica set '{}' elected primary {}", spec.id, primary.name);
                        return Ok(PrimaryEndpoint {
                            set_id: spec.id.clone(),
                            address: primary.name.clone(),
                        });
                    }
                    debug!("'{}' has no primary yet", spec.id);
                }
                // Transient while the new config propagates
                Err(e) => debug!("Status of '{}' unavailable: {}", spec.id, e),
            }

            if !backoff.wait(deadline).await {
                return Err(BootstrapError::ElectionTimeout {
                    set_id: spec.id.clone(),
                    waited: timeout,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{AdminCall, NodeCondition, SimulatedCluster};
    use crate::topology::Endpoint;

    fn fast() -> PollPolicy {
        PollPolicy {
            initial_interval: Duration::from_millis(2),
            max_interval: Duration::from_millis(5),
            probe_timeout: Duration::from_millis(50),
        }
    }

    fn three_node_set(id: &str) -> ReplicaSetSpec {
        let endpoints = (1..=3)
            .map(|i| Endpoint::new(format!("{}-{}", id, i), 27018))
            .collect();
        ReplicaSetSpec::new(id, false, endpoints).unwrap()
    }

    fn cluster_for(spec: &ReplicaSetSpec) -> Arc<SimulatedCluster> {
        let cluster = Arc::new(SimulatedCluster::new());
        for ep in spec.endpoints() {
            cluster.set_condition(&ep, NodeCondition::Up);
        }
        cluster
    }

    #[tokio::test]
    async fn test_initiate_elects_primary() {
        let spec = three_node_set("shard1");
        let cluster = cluster_for(&spec);
        let initiator = ReplicaSetInitiator::new(cluster.clone(), fast());

        let primary = initiator.initiate(&spec, Duration::from_secs(1)).await.unwrap();
        assert_eq!(primary.set_id, "shard1");
        assert!(spec.endpoints().iter().any(|e| e.to_string() == primary.address));
    }

    #[tokio::test]
    async fn test_initiate_twice_is_idempotent() {
        let spec = three_node_set("shard1");
        let cluster = cluster_for(&spec);
        let initiator = ReplicaSetInitiator::new(cluster.clone(), fast());

        initiator.initiate(&spec, Duration::from_secs(1)).await.unwrap();
        initiator.initiate(&spec, Duration::from_secs(1)).await.unwrap();

        let initiates = cluster.count_calls(|c| matches!(c, AdminCall::Initiate { .. }));
        assert_eq!(initiates, 1);
        assert_eq!(cluster.replica_set_members("shard1").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_no_majority_times_out() {
        let spec = three_node_set("shard2");
        let cluster = cluster_for(&spec);
        cluster.set_condition(&spec.members[1].endpoint, NodeCondition::Isolated);
        cluster.set_condition(&spec.members[2].endpoint, NodeCondition::Isolated);
        let initiator = ReplicaSetInitiator::new(cluster.clone(), fast());

        let err = initiator
            .initiate(&spec, Duration::from_millis(40))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::ElectionTimeout { .. }));
        assert!(cluster.is_initialized("shard2"));
    }

    #[tokio::test]
    async fn test_seed_down_is_connectivity_error() {
        let spec = three_node_set("shard1");
        let cluster = cluster_for(&spec);
        cluster.set_condition(&spec.seed().unwrap().endpoint, NodeCondition::Down);
        let initiator = ReplicaSetInitiator::new(cluster, fast());

        let err = initiator
            .initiate(&spec, Duration::from_millis(40))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConnectivityError");
    }

    #[tokio::test]
    async fn test_seed_in_foreign_set_rejected() {
        let spec = three_node_set("shard1");
        let cluster = cluster_for(&spec);
        let initiator = ReplicaSetInitiator::new(cluster, fast());
        initiator.initiate(&spec, Duration::from_secs(1)).await.unwrap();

        let mut renamed = spec.clone();
        renamed.id = "other".to_string();
        let err = initiator
            .initiate(&renamed, Duration::from_millis(40))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Topology(_)));
    }

    #[tokio::test]
    async fn test_set_without_members_rejected() {
        let spec = three_node_set("shard1");
        let cluster = cluster_for(&spec);
        let initiator = ReplicaSetInitiator::new(cluster.clone(), fast());

        let mut empty = spec.clone();
        empty.members.clear();
        let err = initiator
            .initiate(&empty, Duration::from_millis(40))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TopologyError");
        assert!(cluster.calls().is_empty());
    }
}
