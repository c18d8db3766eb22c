//! Administrative operations consumed by the bootstrap.
//!
//! The bootstrap components never talk to a database directly. They go
//! through [`ClusterAdmin`], which exposes the handful of administrative
//! commands needed to form a sharded cluster:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │     Bootstrap components / Orchestrator     │
//! └─────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │            ClusterAdmin (trait)             │
//! └─────────────────────────────────────────────┘
//!            │                       │
//!            ▼                       ▼
//! ┌────────────────────┐   ┌────────────────────┐
//! │     MongoAdmin     │   │  SimulatedCluster  │
//! │ (feature "mongo")  │   │  (tests, rehearsal)│
//! └────────────────────┘   └────────────────────┘
//! ```

#[cfg(feature = "mongo")]
mod mongo;
mod simulated;

#[cfg(feature = "mongo")]
pub use mongo::MongoAdmin;
pub use simulated::{AdminCall, NodeCondition, SimulatedCluster};

use crate::topology::{Endpoint, ReplicaSetSpec, ShardKey, ShardSpec};
use async_trait::async_trait;
use thiserror::Error;

/// Result type for backend calls.
pub type AdminResult<T> = std::result::Result<T, AdminError>;

/// Backend failures, classified just enough for the idempotency guards.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminError {
    /// The node could not be reached at all
    #[error("{endpoint} unreachable: {reason}")]
    Unreachable { endpoint: Endpoint, reason: String },

    /// The node is running but no replica set config has been installed yet
    #[error("replica set not yet initialized")]
    NotYetInitialized,

    #[error("replica set already initialized")]
    AlreadyInitialized,

    /// The object being created already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Any other command failure
    #[error("command rejected (code {code:?}): {message}")]
    Rejected { code: Option<i32>, message: String },
}

/// Replication state of one member as reported by the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Primary,
    Secondary,
    Startup,
    Recovering,
    Arbiter,
    Down,
    Unknown,
}

impl MemberState {
    /// Parse the server's `stateStr` value.
    pub fn from_state_str(s: &str) -> Self {
        match s {
            "PRIMARY" => MemberState::Primary,
            "SECONDARY" => MemberState::Secondary,
            "STARTUP" | "STARTUP2" => MemberState::Startup,
            "RECOVERING" | "ROLLBACK" => MemberState::Recovering,
            "ARBITER" => MemberState::Arbiter,
            "DOWN" | "REMOVED" => MemberState::Down,
            _ => MemberState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberStatus {
    /// Member address as the set reports it
    pub name: String,
    pub state: MemberState,
}

/// Snapshot of `replSetGetStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSetStatus {
    pub set_name: String,
    pub members: Vec<MemberStatus>,
}

impl ReplicaSetStatus {
    pub fn primary(&self) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.state == MemberState::Primary)
    }

    pub fn has_primary(&self) -> bool {
        self.primary().is_some()
    }
}

/// A shard as listed by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredShard {
    pub name: String,
    /// `setName/host:port,...` as stored by the router
    pub host: String,
}

/// Administrative commands against cluster nodes and the router.
///
/// Implementations report backend conditions through [`AdminError`]; they do
/// not retry or absorb anything themselves.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Minimal liveness check.
    async fn ping(&self, endpoint: &Endpoint) -> AdminResult<()>;

    /// Send the replica set formation command to `seed`.
    async fn initiate_replica_set(&self, seed: &Endpoint, spec: &ReplicaSetSpec) -> AdminResult<()>;

    /// Replica set status as seen from `member`.
    ///
    /// Returns [`AdminError::NotYetInitialized`] when no set is configured.
    async fn replica_set_status(&self, member: &Endpoint) -> AdminResult<ReplicaSetStatus>;

    async fn list_shards(&self, router: &Endpoint) -> AdminResult<Vec<RegisteredShard>>;

    async fn add_shard(&self, router: &Endpoint, shard: &ShardSpec) -> AdminResult<()>;

    async fn enable_sharding(&self, router: &Endpoint, database: &str) -> AdminResult<()>;

    async fn list_collections(&self, router: &Endpoint, database: &str) -> AdminResult<Vec<String>>;

    async fn create_collection(
        &self,
        router: &Endpoint,
        database: &str,
        collection: &str,
    ) -> AdminResult<()>;

    async fn shard_collection(
        &self,
        router: &Endpoint,
        database: &str,
        collection: &str,
        key: &ShardKey,
    ) -> AdminResult<()>;

    /// Shard key of a collection, `None` when it is not sharded.
    async fn collection_shard_key(
        &self,
        router: &Endpoint,
        database: &str,
        collection: &str,
    ) -> AdminResult<Option<ShardKey>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_state_parse() {
        assert_eq!(MemberState::from_state_str("PRIMARY"), MemberState::Primary);
        assert_eq!(MemberState::from_state_str("STARTUP2"), MemberState::Startup);
        assert_eq!(MemberState::from_state_str("(not reachable/healthy)"), MemberState::Unknown);
    }

    #[test]
    fn test_status_primary() {
        let status = ReplicaSetStatus {
            set_name: "rs".to_string(),
            members: vec![
                MemberStatus {
                    name: "a:1".to_string(),
                    state: MemberState::Secondary,
                },
                MemberStatus {
                    name: "b:1".to_string(),
                    state: MemberState::Primary,
                },
            ],
        };
        assert!(status.has_primary());
        assert_eq!(status.primary().map(|m| m.name.as_str()), Some("b:1"));
    }
}
