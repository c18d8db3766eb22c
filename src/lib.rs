//! shardboot - ordered, resumable bootstrap of a sharded MongoDB cluster.
//!
//! Forms the config-server replica set, forms every shard replica set,
//! registers the shards with the router and enables sharding on the target
//! database and its collections. Every step waits on a verifiable condition
//! instead of a fixed delay, is safe to repeat, and records progress so a
//! failed run can be resumed.
//!
//! ```no_run
//! use shardboot::admin::SimulatedCluster;
//! use shardboot::bootstrap::Orchestrator;
//! use shardboot::config::BootstrapConfig;
//! use std::sync::Arc;
//!
//! # async fn demo() -> shardboot::Result<()> {
//! let config = BootstrapConfig::default();
//! let topology = config.topology()?;
//! let admin = Arc::new(SimulatedCluster::for_topology(&topology));
//! let outcome = Orchestrator::new(topology, admin, config.orchestrator_options())
//!     .run()
//!     .await;
//! assert!(outcome.is_complete());
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod topology;

pub use error::{BootstrapError, Result};
