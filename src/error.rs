//! Error types for shardboot.

use crate::topology::Endpoint;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for bootstrap operations.
pub type Result<T> = std::result::Result<T, BootstrapError>;

/// Errors surfaced by the bootstrap components and the orchestrator.
#[derive(Error, Debug)]
pub enum BootstrapError {
    /// Endpoints did not answer the liveness check within the bound.
    #[error("endpoints unreachable: {}", join_endpoints(.unreachable))]
    Connectivity { unreachable: Vec<Endpoint> },

    /// A replica set did not report a primary within the bound.
    #[error("replica set '{set_id}' elected no primary within {waited:?}")]
    ElectionTimeout { set_id: String, waited: Duration },

    /// The replica set already exists. Absorbed by the initiator.
    #[error("replica set '{set_id}' is already initialized")]
    AlreadyInitialized { set_id: String },

    /// The router rejected a shard for a reason other than duplication.
    #[error("router rejected shard '{shard}': {reason}")]
    Registration { shard: String, reason: String },

    /// A sharding step was invoked before `enableSharding` completed.
    #[error("shardCollection on '{database}.{collection}' before enableSharding on '{database}'")]
    Order { database: String, collection: String },

    /// Shard key conflict or backend rejection while sharding.
    #[error("sharding '{namespace}' failed: {reason}")]
    Sharding { namespace: String, reason: String },

    /// The overall orchestration deadline expired.
    #[error("orchestration deadline exceeded during {phase}")]
    DeadlineExceeded { phase: String },

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Backend failure that does not fit any other kind.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BootstrapError {
    /// Stable name of the error kind, used in operator-facing output.
    pub fn kind(&self) -> &'static str {
        match self {
            BootstrapError::Connectivity { .. } => "ConnectivityError",
            BootstrapError::ElectionTimeout { .. } => "ElectionTimeoutError",
            BootstrapError::AlreadyInitialized { .. } => "AlreadyInitializedError",
            BootstrapError::Registration { .. } => "RegistrationError",
            BootstrapError::Order { .. } => "OrderError",
            BootstrapError::Sharding { .. } => "ShardingError",
            BootstrapError::DeadlineExceeded { .. } => "DeadlineExceededError",
            BootstrapError::Topology(_) => "TopologyError",
            BootstrapError::Config(_) => "ConfigError",
            BootstrapError::Backend(_) => "BackendError",
            BootstrapError::Io(_) => "IoError",
            BootstrapError::Serialization(_) => "SerializationError",
        }
    }
}

impl From<serde_json::Error> for BootstrapError {
    fn from(err: serde_json::Error) -> Self {
        BootstrapError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BootstrapError {
    fn from(err: toml::de::Error) -> Self {
        BootstrapError::Config(err.to_string())
    }
}

fn join_endpoints(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_names_endpoints() {
        let err = BootstrapError::Connectivity {
            unreachable: vec![
                Endpoint::new("shard1-a", 27018),
                Endpoint::new("shard1-b", 27018),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("shard1-a:27018"));
        assert!(msg.contains("shard1-b:27018"));
        assert_eq!(err.kind(), "ConnectivityError");
    }

    #[test]
    fn test_order_error_kind() {
        let err = BootstrapError::Order {
            database: "vesselDB".to_string(),
            collection: "raw_data".to_string(),
        };
        assert_eq!(err.kind(), "OrderError");
        assert!(err.to_string().contains("vesselDB.raw_data"));
    }
}
