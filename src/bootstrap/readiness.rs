//! Readiness gate: wait until endpoints accept connections.

use crate::admin::ClusterAdmin;
use crate::bootstrap::poll::{Backoff, PollPolicy};
use crate::error::{BootstrapError, Result};
use crate::topology::Endpoint;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Probes endpoints until every one answers a liveness check.
#[derive(Clone)]
pub struct ReadinessGate {
    admin: Arc<dyn ClusterAdmin>,
    policy: PollPolicy,
}

impl ReadinessGate {
    pub fn new(admin: Arc<dyn ClusterAdmin>, policy: PollPolicy) -> Self {
        Self { admin, policy }
    }

    /// Wait until all `endpoints` respond, or fail with
    /// [`BootstrapError::Connectivity`] naming those that never did.
    pub async fn await_ready(&self, endpoints: &[Endpoint], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut pending: BTreeSet<Endpoint> = endpoints.iter().cloned().collect();
        let mut backoff = Backoff::new(&self.policy);

        loop {
            let probes = pending.iter().map(|endpoint| async move {
                let reachable = self.probe(endpoint).await;
                (endpoint.clone(), reachable)
            });
            let results = join_all(probes).await;
            for (endpoint, reachable) in results {
                if reachable {
                    pending.remove(&endpoint);
                }
            }

            if pending.is_empty() {
                info!("{} endpoint(s) reachable", endpoints.len());
                return Ok(());
            }
            debug!(
                "Waiting for {} endpoint(s), attempt {}",
                pending.len(),
                backoff.attempts() + 1
            );
            if !backoff.wait(deadline).await {
                return Err(BootstrapError::Connectivity {
                    unreachable: pending.into_iter().collect(),
                });
            }
        }
    }

    /// Probe independent endpoint groups concurrently.
    ///
    /// Fails with one `Connectivity` error listing the unreachable endpoints
    /// of every group.
    pub async fn await_groups(&self, groups: &[Vec<Endpoint>], timeout: Duration) -> Result<()> {
        let results = join_all(groups.iter().map(|group| self.await_ready(group, timeout))).await;

        let mut unreachable = Vec::new();
        for result in results {
            match result {
                Ok(()) => {}
                Err(BootstrapError::Connectivity { unreachable: group }) => {
                    unreachable.extend(group)
                }
                Err(e) => return Err(e),
            }
        }

        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(BootstrapError::Connectivity { unreachable })
        }
    }

    async fn probe(&self, endpoint: &Endpoint) -> bool {
        match tokio::time::timeout(self.policy.probe_timeout, self.admin.ping(endpoint)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", endpoint, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out", endpoint);
                false
            }
        }
    }
}
