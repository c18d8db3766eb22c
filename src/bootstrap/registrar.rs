//! Shard registration with the router.

use crate::admin::{AdminError, ClusterAdmin, RegisteredShard};
use crate::error::{BootstrapError, Result};
use crate::topology::{Endpoint, ShardSpec};
use std::sync::Arc;
use tracing::{info, warn};

/// Registers formed shard replica sets with the router.
///
/// Callers must have confirmed the router is reachable and the shard's
/// replica set has a primary.
pub struct ShardRegistrar {
    admin: Arc<dyn ClusterAdmin>,
    router: Endpoint,
}

impl ShardRegistrar {
    pub fn new(admin: Arc<dyn ClusterAdmin>, router: Endpoint) -> Self {
        Self { admin, router }
    }

    /// Register `shard`. A shard already registered under the same replica
    /// set counts as success.
    pub async fn add_shard(&self, shard: &ShardSpec) -> Result<()> {
        if let Some(existing) = self.find(&shard.name).await? {
            return self.check_same(shard, &existing);
        }

        match self.admin.add_shard(&self.router, shard).await {
            Ok(()) => {
                info!("Registered shard '{}' ({})", shard.name, shard.connection_string());
                Ok(())
            }
            Err(AdminError::AlreadyExists(msg)) => {
                warn!("Router reports shard '{}' already exists: {}", shard.name, msg);
                match self.find(&shard.name).await? {
                    Some(existing) => self.check_same(shard, &existing),
                    None => Err(BootstrapError::Registration {
                        shard: shard.name.clone(),
                        reason: msg,
                    }),
                }
            }
            Err(AdminError::Unreachable { endpoint, .. }) => Err(BootstrapError::Connectivity {
                unreachable: vec![endpoint],
            }),
            Err(e) => Err(BootstrapError::Registration {
                shard: shard.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Shards currently known to the router.
    pub async fn registered(&self) -> Result<Vec<RegisteredShard>> {
        self.admin.list_shards(&self.router).await.map_err(|e| match e {
            AdminError::Unreachable { endpoint, .. } => BootstrapError::Connectivity {
                unreachable: vec![endpoint],
            },
            other => BootstrapError::Backend(format!("listShards failed: {}", other)),
        })
    }

    async fn find(&self, name: &str) -> Result<Option<RegisteredShard>> {
        Ok(self.registered().await?.into_iter().find(|s| s.name == name))
    }

    /// The router stores `setName/host,...`; only the set name is stable,
    /// since the router rewrites the host list as members are discovered.
    fn check_same(&self, shard: &ShardSpec, existing: &RegisteredShard) -> Result<()> {
        let registered_set = existing
            .host
            .split_once('/')
            .map(|(set, _)| set)
            .unwrap_or(existing.host.as_str());
        if registered_set == shard.name {
            info!("Shard '{}' already registered", shard.name);
            Ok(())
        } else {
            Err(BootstrapError::Registration {
                shard: shard.name.clone(),
                reason: format!("name already registered for {}", existing.host),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{AdminCall, NodeCondition, SimulatedCluster};
    use crate::bootstrap::poll::PollPolicy;
    use crate::bootstrap::replica_set::ReplicaSetInitiator;
    use crate::topology::ReplicaSetSpec;
    use std::time::Duration;

    struct Fixture {
        cluster: Arc<SimulatedCluster>,
        router: Endpoint,
        shard: ShardSpec,
    }

    async fn formed() -> Fixture {
        let cluster = Arc::new(SimulatedCluster::new().with_election_polls(1));
        let router = Endpoint::new("mongos", 27017);
        cluster.set_condition(&router, NodeCondition::Up);

        let config = ReplicaSetSpec::new("cfg", true, vec![Endpoint::new("cfg1", 27019)]).unwrap();
        let shard_set = ReplicaSetSpec::new(
            "shard1",
            false,
            vec![Endpoint::new("s1a", 27018), Endpoint::new("s1b", 27018)],
        )
        .unwrap();
        for ep in config.endpoints().into_iter().chain(shard_set.endpoints()) {
            cluster.set_condition(&ep, NodeCondition::Up);
        }

        let initiator = ReplicaSetInitiator::new(
            cluster.clone(),
            PollPolicy {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                probe_timeout: Duration::from_millis(10),
            },
        );
        initiator.initiate(&config, Duration::from_secs(1)).await.unwrap();
        initiator.initiate(&shard_set, Duration::from_secs(1)).await.unwrap();

        Fixture {
            cluster,
            router,
            shard: ShardSpec::from_replica_set(&shard_set),
        }
    }

    #[tokio::test]
    async fn test_add_shard_twice() {
        let f = formed().await;
        let registrar = ShardRegistrar::new(f.cluster.clone(), f.router.clone());

        registrar.add_shard(&f.shard).await.unwrap();
        registrar.add_shard(&f.shard).await.unwrap();

        let shards = registrar.registered().await.unwrap();
        assert_eq!(shards.iter().filter(|s| s.name == "shard1").count(), 1);
        assert_eq!(
            f.cluster.count_calls(|c| matches!(c, AdminCall::AddShard(_))),
            1
        );
    }

    #[tokio::test]
    async fn test_bad_member_list_rejected() {
        let f = formed().await;
        let registrar = ShardRegistrar::new(f.cluster.clone(), f.router.clone());
        let mut bad = f.shard.clone();
        bad.members = vec![Endpoint::new("stranger", 1)];

        let err = registrar.add_shard(&bad).await.unwrap_err();
        assert_eq!(err.kind(), "RegistrationError");
    }

    #[test]
    fn test_check_same_compares_set_name() {
        let registrar = ShardRegistrar::new(Arc::new(SimulatedCluster::new()), Endpoint::new("r", 1));
        let shard = ShardSpec {
            name: "shard1".to_string(),
            members: vec![Endpoint::new("a", 1)],
        };
        let same = RegisteredShard {
            name: "shard1".to_string(),
            host: "shard1/a:1,b:1".to_string(),
        };
        let other = RegisteredShard {
            name: "shard1".to_string(),
            host: "elsewhere/x:1".to_string(),
        };
        assert!(registrar.check_same(&shard, &same).is_ok());
        assert!(registrar.check_same(&shard, &other).is_err());
    }
}
