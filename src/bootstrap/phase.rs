//! Bootstrap phases and orchestrator state.

use crate::error::BootstrapError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Forward-only sequence of bootstrap phases.
///
/// Each phase names the condition that holds once it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    NotStarted,
    ConfigServersReachable,
    ConfigReplicaSetReady,
    ShardNodesReachable,
    ShardReplicaSetsReady,
    ShardsRegistered,
    ShardingEnabled,
    Complete,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::NotStarted,
        Phase::ConfigServersReachable,
        Phase::ConfigReplicaSetReady,
        Phase::ShardNodesReachable,
        Phase::ShardReplicaSetsReady,
        Phase::ShardsRegistered,
        Phase::ShardingEnabled,
        Phase::Complete,
    ];

    /// The phase after this one, `None` once complete.
    pub fn next(self) -> Option<Phase> {
        let idx = Self::ALL.iter().position(|p| *p == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::NotStarted => "NotStarted",
            Phase::ConfigServersReachable => "ConfigServersReachable",
            Phase::ConfigReplicaSetReady => "ConfigReplicaSetReady",
            Phase::ShardNodesReachable => "ShardNodesReachable",
            Phase::ShardReplicaSetsReady => "ShardReplicaSetsReady",
            Phase::ShardsRegistered => "ShardsRegistered",
            Phase::ShardingEnabled => "ShardingEnabled",
            Phase::Complete => "Complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Orchestrator state: a reached phase, or the absorbing failure state.
#[derive(Debug)]
pub enum BootstrapState {
    At(Phase),
    /// `phase` is the phase whose transition failed
    Failed { phase: Phase, cause: BootstrapError },
}

impl BootstrapState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BootstrapState::At(Phase::Complete) | BootstrapState::Failed { .. }
        )
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapState::At(phase) => write!(f, "{}", phase),
            BootstrapState::Failed { phase, cause } => {
                write!(f, "Failed({}, {}: {})", phase, cause.kind(), cause)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_sequence() {
        let mut phase = Phase::NotStarted;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(next > phase);
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen, Phase::ALL.to_vec());
        assert_eq!(Phase::Complete.next(), None);
    }

    #[test]
    fn test_phase_serde_uses_name() {
        let json = serde_json::to_string(&Phase::ShardsRegistered).unwrap();
        assert_eq!(json, "\"ShardsRegistered\"");
    }

    #[test]
    fn test_failed_display() {
        let state = BootstrapState::Failed {
            phase: Phase::ShardReplicaSetsReady,
            cause: BootstrapError::Backend("boom".to_string()),
        };
        let text = state.to_string();
        assert!(text.contains("ShardReplicaSetsReady"));
        assert!(text.contains("BackendError"));
        assert!(state.is_terminal());
    }
}
