//! Database and collection sharding.

use crate::admin::{AdminError, ClusterAdmin};
use crate::error::{BootstrapError, Result};
use crate::topology::{DatabaseShardingSpec, Endpoint, ShardKey};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Enables partitioned storage on a database and declares shard keys.
///
/// Tracks which databases have had `enableSharding` complete through this
/// instance; collection steps on any other database are refused with
/// [`BootstrapError::Order`] before the backend is contacted.
pub struct ShardingEnabler {
    admin: Arc<dyn ClusterAdmin>,
    router: Endpoint,
    enabled: HashSet<String>,
}

impl ShardingEnabler {
    pub fn new(admin: Arc<dyn ClusterAdmin>, router: Endpoint) -> Self {
        Self {
            admin,
            router,
            enabled: HashSet::new(),
        }
    }

    /// Run every step for `spec` in order: enable the database, create the
    /// collections, then shard each of them.
    pub async fn apply(&mut self, spec: &DatabaseShardingSpec) -> Result<()> {
        self.enable_sharding(&spec.database).await?;
        for collection in spec.collections.keys() {
            self.ensure_collection(&spec.database, collection).await?;
        }
        for (collection, key) in &spec.collections {
            self.shard_collection(&spec.database, collection, key).await?;
        }
        info!(
            "Sharding enabled on '{}' for {} collection(s)",
            spec.database,
            spec.collections.len()
        );
        Ok(())
    }

    /// Enable sharding on `database`.
    ///
    /// Sent without a prior state query: the router accepts the command again
    /// on an enabled database, and `AlreadyExists` is absorbed.
    pub async fn enable_sharding(&mut self, database: &str) -> Result<()> {
        match self.admin.enable_sharding(&self.router, database).await {
            Ok(()) | Err(AdminError::AlreadyExists(_)) => {
                info!("enableSharding on '{}' done", database);
                self.enabled.insert(database.to_string());
                Ok(())
            }
            Err(e) => Err(self.backend_error(database, e)),
        }
    }

    /// Create the collection unless it already exists.
    pub async fn ensure_collection(&self, database: &str, collection: &str) -> Result<()> {
        self.check_order(database, collection)?;
        let namespace = format!("{}.{}", database, collection);

        let existing = self
            .admin
            .list_collections(&self.router, database)
            .await
            .map_err(|e| self.backend_error(&namespace, e))?;
        if existing.iter().any(|c| c == collection) {
            debug!("Collection '{}' exists", namespace);
            return Ok(());
        }

        match self
            .admin
            .create_collection(&self.router, database, collection)
            .await
        {
            Ok(()) => {
                info!("Created collection '{}'", namespace);
                Ok(())
            }
            Err(AdminError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(self.backend_error(&namespace, e)),
        }
    }

    /// Declare the shard key of a collection.
    ///
    /// Re-declaring the same key is a no-op; a different key on an already
    /// sharded collection is a [`BootstrapError::Sharding`] error, since
    /// shard keys cannot be changed here.
    pub async fn shard_collection(
        &self,
        database: &str,
        collection: &str,
        key: &ShardKey,
    ) -> Result<()> {
        self.check_order(database, collection)?;
        let namespace = format!("{}.{}", database, collection);

        if self.current_key(database, collection).await?.is_some() {
            return self.check_key(database, collection, key).await;
        }

        match self
            .admin
            .shard_collection(&self.router, database, collection, key)
            .await
        {
            Ok(()) => {
                info!("Sharded '{}' on {}", namespace, key);
                Ok(())
            }
            Err(AdminError::AlreadyExists(msg)) => {
                warn!("'{}' reported as already sharded: {}", namespace, msg);
                self.check_key(database, collection, key).await
            }
            Err(e) => Err(self.backend_error(&namespace, e)),
        }
    }

    async fn current_key(&self, database: &str, collection: &str) -> Result<Option<ShardKey>> {
        let namespace = format!("{}.{}", database, collection);
        self.admin
            .collection_shard_key(&self.router, database, collection)
            .await
            .map_err(|e| self.backend_error(&namespace, e))
    }

    async fn check_key(&self, database: &str, collection: &str, key: &ShardKey) -> Result<()> {
        let namespace = format!("{}.{}", database, collection);
        match self.current_key(database, collection).await? {
            Some(existing) if existing == *key => {
                info!("'{}' already sharded on {}", namespace, key);
                Ok(())
            }
            Some(existing) => Err(BootstrapError::Sharding {
                namespace,
                reason: format!(
                    "already sharded on {}, refusing to declare {}",
                    existing, key
                ),
            }),
            None => Err(BootstrapError::Sharding {
                namespace,
                reason: "router reported the collection sharded but lists no key".to_string(),
            }),
        }
    }

    fn check_order(&self, database: &str, collection: &str) -> Result<()> {
        if self.enabled.contains(database) {
            Ok(())
        } else {
            Err(BootstrapError::Order {
                database: database.to_string(),
                collection: collection.to_string(),
            })
        }
    }

    fn backend_error(&self, namespace: &str, err: AdminError) -> BootstrapError {
        match err {
            AdminError::Unreachable { endpoint, .. } => BootstrapError::Connectivity {
                unreachable: vec![endpoint],
            },
            other => BootstrapError::Sharding {
                namespace: namespace.to_string(),
                reason: other.to_string(),
            },
        }
    }
}
