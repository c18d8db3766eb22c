//! Phase-ordered cluster bootstrap.

use crate::admin::ClusterAdmin;
use crate::bootstrap::checkpoint::{Checkpoint, CheckpointStore};
use crate::bootstrap::phase::{BootstrapState, Phase};
use crate::bootstrap::poll::PollPolicy;
use crate::bootstrap::readiness::ReadinessGate;
use crate::bootstrap::registrar::ShardRegistrar;
use crate::bootstrap::replica_set::{PrimaryEndpoint, ReplicaSetInitiator};
use crate::bootstrap::sharding::ShardingEnabler;
use crate::error::{BootstrapError, Result};
use crate::topology::ClusterTopology;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Timing knobs for one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Bound for each readiness wait and each primary election
    pub per_phase_timeout: Duration,
    /// Bound for the whole run, cancelling whichever phase is in flight
    pub overall_timeout: Duration,
    pub poll: PollPolicy,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            per_phase_timeout: Duration::from_secs(120),
            overall_timeout: Duration::from_secs(900),
            poll: PollPolicy::default(),
        }
    }
}

/// Result of a run.
#[derive(Debug)]
pub struct BootstrapOutcome {
    pub state: BootstrapState,
    /// Phase loaded from the checkpoint, if the run resumed
    pub resumed_from: Option<Phase>,
    /// First checkpoint write that failed; a later run cannot resume past it
    pub checkpoint_error: Option<BootstrapError>,
    pub elapsed: Duration,
}

impl BootstrapOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self.state, BootstrapState::At(Phase::Complete))
    }

    /// Process exit status: zero only when the cluster reached `Complete`.
    pub fn exit_code(&self) -> i32 {
        if self.is_complete() {
            0
        } else {
            1
        }
    }

    pub fn failure(&self) -> Option<(Phase, &BootstrapError)> {
        match &self.state {
            BootstrapState::Failed { phase, cause } => Some((*phase, cause)),
            BootstrapState::At(_) => None,
        }
    }
}

/// Drives the bootstrap components through the phase sequence.
///
/// Completed phases are never rolled back. After each one the checkpoint (if
/// configured) records it, and a later run resumes from the next phase.
pub struct Orchestrator {
    topology: ClusterTopology,
    admin: Arc<dyn ClusterAdmin>,
    options: OrchestratorOptions,
    checkpoint: Option<CheckpointStore>,
    state: BootstrapState,
}

impl Orchestrator {
    pub fn new(
        topology: ClusterTopology,
        admin: Arc<dyn ClusterAdmin>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            topology,
            admin,
            options,
            checkpoint: None,
            state: BootstrapState::At(Phase::NotStarted),
        }
    }

    /// Persist progress to `store` and resume from it.
    pub fn with_checkpoint(mut self, store: CheckpointStore) -> Self {
        self.checkpoint = Some(store);
        self
    }

    /// Run until `Complete` or the first failure.
    pub async fn run(mut self) -> BootstrapOutcome {
        let started = Instant::now();
        let deadline = started + self.options.overall_timeout;

        let resumed = match self.resume_point().await {
            Ok(checkpoint) => checkpoint,
            Err(cause) => {
                error!("Cannot read checkpoint: {}", cause);
                return BootstrapOutcome {
                    state: BootstrapState::Failed {
                        phase: Phase::NotStarted,
                        cause,
                    },
                    resumed_from: None,
                    checkpoint_error: None,
                    elapsed: started.elapsed(),
                };
            }
        };
        let resumed_from = resumed.map(|checkpoint| {
            // The checkpoint does not record the topology it was written for
            warn!(
                "Resuming after phase {} completed at {}; use reset or --fresh if the topology changed since",
                checkpoint.phase,
                checkpoint.completed_at.to_rfc3339()
            );
            checkpoint.phase
        });
        if let Some(phase) = resumed_from {
            self.state = BootstrapState::At(phase);
        }
        let mut checkpoint_error = None;

        while let BootstrapState::At(current) = self.state {
            let Some(next) = current.next() else {
                break;
            };

            info!("Phase {} -> {}", current, next);
            let result = match tokio::time::timeout_at(deadline, self.execute(next)).await {
                Ok(result) => result,
                Err(_) => Err(BootstrapError::DeadlineExceeded {
                    phase: next.to_string(),
                }),
            };

            match result {
                Ok(()) => {
                    self.state = BootstrapState::At(next);
                    if let Err(e) = self.record(next).await {
                        warn!("Failed to persist checkpoint {}: {}", next, e);
                        checkpoint_error.get_or_insert(e);
                    }
                }
                Err(cause) => {
                    error!(
                        "Bootstrap failed at {}: {}: {}",
                        next,
                        cause.kind(),
                        cause
                    );
                    self.state = BootstrapState::Failed { phase: next, cause };
                }
            }
        }

        if let BootstrapState::At(Phase::Complete) = self.state {
            info!("Cluster bootstrap complete in {:?}", started.elapsed());
        }

        BootstrapOutcome {
            state: self.state,
            resumed_from,
            checkpoint_error,
            elapsed: started.elapsed(),
        }
    }

    async fn resume_point(&self) -> Result<Option<Checkpoint>> {
        match &self.checkpoint {
            Some(store) => store.load().await,
            None => Ok(None),
        }
    }

    async fn record(&self, phase: Phase) -> Result<()> {
        if let Some(store) = &self.checkpoint {
            store.save(phase).await?;
        }
        Ok(())
    }

    /// Perform the work that establishes `phase`.
    ///
    /// Every component call is preceded by a readiness wait on the nodes it
    /// targets, since a resumed run skips the earlier reachability phases.
    async fn execute(&self, phase: Phase) -> Result<()> {
        let timeout = self.options.per_phase_timeout;
        let gate = ReadinessGate::new(self.admin.clone(), self.options.poll);

        match phase {
            Phase::NotStarted => Ok(()),
            Phase::ConfigServersReachable => {
                gate.await_ready(&self.topology.config_servers.endpoints(), timeout)
                    .await
            }
            Phase::ConfigReplicaSetReady => {
                gate.await_ready(&self.topology.config_servers.endpoints(), timeout)
                    .await?;
                let initiator = ReplicaSetInitiator::new(self.admin.clone(), self.options.poll);
                initiator
                    .initiate(&self.topology.config_servers, timeout)
                    .await
                    .map(|_| ())
            }
            Phase::ShardNodesReachable => {
                let mut groups: Vec<_> = self.topology.shards.iter().map(|s| s.endpoints()).collect();
                groups.push(vec![self.topology.router.clone()]);
                gate.await_groups(&groups, timeout).await
            }
            Phase::ShardReplicaSetsReady => self.form_shards(&gate, timeout).await,
            Phase::ShardsRegistered => {
                gate.await_ready(&[self.topology.router.clone()], timeout)
                    .await?;
                let registrar = ShardRegistrar::new(self.admin.clone(), self.topology.router.clone());
                for shard in self.topology.shard_specs() {
                    registrar.add_shard(&shard).await?;
                }
                Ok(())
            }
            Phase::ShardingEnabled => {
                gate.await_ready(&[self.topology.router.clone()], timeout)
                    .await?;
                let mut enabler =
                    ShardingEnabler::new(self.admin.clone(), self.topology.router.clone());
                enabler.apply(&self.topology.sharding).await
            }
            Phase::Complete => Ok(()),
        }
    }

    /// Form every shard replica set concurrently and wait for all of them.
    ///
    /// The sets have disjoint members, so their formation commands never
    /// target the same set. Every task runs to completion before the first
    /// error is reported, leaving the other sets formed.
    async fn form_shards(&self, gate: &ReadinessGate, timeout: Duration) -> Result<()> {
        let initiator = ReplicaSetInitiator::new(self.admin.clone(), self.options.poll);
        let mut tasks = JoinSet::new();
        for spec in self.topology.shards.iter().cloned() {
            let initiator = initiator.clone();
            let gate = gate.clone();
            tasks.spawn(async move {
                gate.await_ready(&spec.endpoints(), timeout).await?;
                initiator.initiate(&spec, timeout).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result: Result<PrimaryEndpoint> = joined
                .unwrap_or_else(|e| Err(BootstrapError::Backend(format!("shard task failed: {}", e))));
            if let Err(e) = result {
                warn!("Shard formation failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{NodeCondition, SimulatedCluster};
    use crate::topology::{DatabaseShardingSpec, Endpoint, ReplicaSetSpec, ShardKey};

    fn topology() -> ClusterTopology {
        let set = |id: &str, prefix: &str, port: u16, config: bool| {
            let eps = (1..=3)
                .map(|i| Endpoint::new(format!("{}{}", prefix, i), port))
                .collect();
            ReplicaSetSpec::new(id, config, eps).unwrap()
        };
        ClusterTopology::new(
            set("configReplSet", "configsvr", 27019, true),
            vec![
                set("shard1ReplSet", "shard1-", 27018, false),
                set("shard2ReplSet", "shard2-", 27018, false),
            ],
            Endpoint::new("mongos", 27017),
            DatabaseShardingSpec::uniform(
                "vesselDB",
                &["raw_data".to_string()],
                ShardKey::hashed("MMSI"),
            ),
        )
        .unwrap()
    }

    fn options() -> OrchestratorOptions {
        OrchestratorOptions {
            per_phase_timeout: Duration::from_millis(200),
            overall_timeout: Duration::from_secs(5),
            poll: PollPolicy {
                initial_interval: Duration::from_millis(2),
                max_interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(50),
            },
        }
    }

    #[tokio::test]
    async fn test_run_to_complete() {
        let topology = topology();
        let cluster = Arc::new(SimulatedCluster::for_topology(&topology));
        let outcome = Orchestrator::new(topology, cluster, options()).run().await;
        assert!(outcome.is_complete(), "{}", outcome.state);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.resumed_from, None);
    }

    #[tokio::test]
    async fn test_config_server_down_fails_first_phase() {
        let topology = topology();
        let cluster = Arc::new(SimulatedCluster::for_topology(&topology));
        cluster.set_condition(&topology.config_servers.members[2].endpoint, NodeCondition::Down);

        let outcome = Orchestrator::new(topology, cluster.clone(), options()).run().await;
        let (phase, cause) = outcome.failure().unwrap();
        assert_eq!(phase, Phase::ConfigServersReachable);
        assert_eq!(cause.kind(), "ConnectivityError");
        assert_eq!(outcome.exit_code(), 1);
        assert!(!cluster.is_initialized("configReplSet"));
    }

    #[tokio::test]
    async fn test_overall_deadline_cancels_phase() {
        let topology = topology();
        let cluster = Arc::new(SimulatedCluster::for_topology(&topology));
        cluster.set_condition(&topology.router, NodeCondition::Down);
        let mut opts = options();
        opts.per_phase_timeout = Duration::from_secs(10);
        opts.overall_timeout = Duration::from_millis(150);

        let outcome = Orchestrator::new(topology, cluster, opts).run().await;
        let (phase, cause) = outcome.failure().unwrap();
        assert_eq!(phase, Phase::ShardNodesReachable);
        assert!(matches!(cause, BootstrapError::DeadlineExceeded { .. }));
        assert!(outcome.elapsed < Duration::from_secs(5));
    }
}
