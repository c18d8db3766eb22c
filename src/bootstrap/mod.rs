//! Sharded cluster bootstrap.
//!
//! Turns a set of freshly started, mutually unaware nodes into a working
//! sharded cluster. The components are composed strictly in dependency
//! order by the [`Orchestrator`]:
//!
//! ```text
//! ┌──────────────────────┐
//! │    ReadinessGate     │  config servers reachable
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │ ReplicaSetInitiator  │  config replica set has a primary
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │    ReadinessGate     │  shard nodes + router reachable
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │ ReplicaSetInitiator  │  every shard set has a primary (concurrent, joined)
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │    ShardRegistrar    │  every shard registered with the router
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │   ShardingEnabler    │  database enabled, collections sharded
//! └──────────────────────┘
//! ```

mod checkpoint;
mod orchestrator;
mod phase;
mod poll;
mod readiness;
mod registrar;
mod replica_set;
mod sharding;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use orchestrator::{BootstrapOutcome, Orchestrator, OrchestratorOptions};
pub use phase::{BootstrapState, Phase};
pub use poll::{Backoff, PollPolicy};
pub use readiness::ReadinessGate;
pub use registrar::ShardRegistrar;
pub use replica_set::{PrimaryEndpoint, ReplicaSetInitiator};
pub use sharding::ShardingEnabler;
