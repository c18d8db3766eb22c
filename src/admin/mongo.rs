//! MongoDB backend.
//!
//! Every node is addressed with a direct connection so that commands land on
//! exactly the member named by the caller, even before a replica set exists.

use super::{
    AdminError, AdminResult, ClusterAdmin, MemberState, MemberStatus, RegisteredShard,
    ReplicaSetStatus,
};
use crate::topology::{Endpoint, ReplicaSetSpec, ShardKey, ShardSpec, ShardStrategy};
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::ClientOptions;
use mongodb::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Server error codes the bootstrap cares about.
const CODE_ALREADY_INITIALIZED: i32 = 23;
const CODE_NAMESPACE_EXISTS: i32 = 48;
const CODE_NOT_YET_INITIALIZED: i32 = 94;

/// `ClusterAdmin` over the official MongoDB driver.
pub struct MongoAdmin {
    clients: Mutex<HashMap<Endpoint, Client>>,
    connect_timeout: Duration,
}

impl MongoAdmin {
    /// `connect_timeout` bounds both connection setup and server selection.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    async fn client(&self, endpoint: &Endpoint) -> AdminResult<Client> {
        if let Some(client) = self.cached(endpoint) {
            return Ok(client);
        }

        let uri = format!("mongodb://{}/?directConnection=true", endpoint);
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| classify(endpoint, e))?;
        options.app_name = Some("shardboot".to_string());
        options.connect_timeout = Some(self.connect_timeout);
        options.server_selection_timeout = Some(self.connect_timeout);

        let client = Client::with_options(options).map_err(|e| classify(endpoint, e))?;
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(endpoint.clone(), client.clone());
        Ok(client)
    }

    fn cached(&self, endpoint: &Endpoint) -> Option<Client> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(endpoint)
            .cloned()
    }

    async fn admin_command(&self, endpoint: &Endpoint, command: Document) -> AdminResult<Document> {
        debug!("{} <- {}", endpoint, command);
        let client = self.client(endpoint).await?;
        client
            .database("admin")
            .run_command(command, None)
            .await
            .map_err(|e| classify(endpoint, e))
    }
}

/// Map a driver error onto the backend error classes.
fn classify(endpoint: &Endpoint, err: MongoError) -> AdminError {
    match err.kind.as_ref() {
        ErrorKind::Command(cmd) => classify_command(cmd.code, &cmd.message),
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::DnsResolve { .. } => {
            AdminError::Unreachable {
                endpoint: endpoint.clone(),
                reason: err.to_string(),
            }
        }
        _ => AdminError::Rejected {
            code: None,
            message: err.to_string(),
        },
    }
}

/// Map a server command failure by its error code.
fn classify_command(code: i32, message: &str) -> AdminError {
    match code {
        CODE_ALREADY_INITIALIZED => AdminError::AlreadyInitialized,
        CODE_NOT_YET_INITIALIZED => AdminError::NotYetInitialized,
        CODE_NAMESPACE_EXISTS => AdminError::AlreadyExists(message.to_string()),
        code => AdminError::Rejected {
            code: Some(code),
            message: message.to_string(),
        },
    }
}

/// `addShard` and `shardCollection` report duplicates only in the message.
fn rejected_as_existing(err: AdminError, marker: &str) -> AdminError {
    match err {
        AdminError::Rejected { message, .. } if message.contains(marker) => {
            AdminError::AlreadyExists(message)
        }
        other => other,
    }
}

fn shard_key_document(key: &ShardKey) -> Document {
    let mut document = Document::new();
    match key.strategy {
        ShardStrategy::Hashed => document.insert(key.field.clone(), "hashed"),
        ShardStrategy::Range => document.insert(key.field.clone(), 1i32),
    };
    document
}

fn shard_key_from_document(document: &Document) -> Option<ShardKey> {
    let (field, value) = document.iter().next()?;
    let strategy = match value {
        Bson::String(s) if s == "hashed" => ShardStrategy::Hashed,
        _ => ShardStrategy::Range,
    };
    Some(ShardKey {
        field: field.clone(),
        strategy,
    })
}

#[async_trait]
impl ClusterAdmin for MongoAdmin {
    async fn ping(&self, endpoint: &Endpoint) -> AdminResult<()> {
        self.admin_command(endpoint, doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn initiate_replica_set(&self, seed: &Endpoint, spec: &ReplicaSetSpec) -> AdminResult<()> {
        let members: Vec<Document> = spec
            .members
            .iter()
            .map(|m| doc! { "_id": (m.id as i32), "host": m.endpoint.to_string() })
            .collect();
        let mut config = doc! { "_id": spec.id.clone(), "members": members };
        if spec.config_server {
            config.insert("configsvr", true);
        }
        self.admin_command(seed, doc! { "replSetInitiate": config })
            .await?;
        Ok(())
    }

    async fn replica_set_status(&self, member: &Endpoint) -> AdminResult<ReplicaSetStatus> {
        let reply = self
            .admin_command(member, doc! { "replSetGetStatus": 1 })
            .await?;
        let set_name = reply.get_str("set").unwrap_or_default().to_string();
        let members = reply
            .get_array("members")
            .map(|members| {
                members
                    .iter()
                    .filter_map(Bson::as_document)
                    .map(|m| MemberStatus {
                        name: m.get_str("name").unwrap_or_default().to_string(),
                        state: MemberState::from_state_str(m.get_str("stateStr").unwrap_or_default()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ReplicaSetStatus { set_name, members })
    }

    async fn list_shards(&self, router: &Endpoint) -> AdminResult<Vec<RegisteredShard>> {
        let reply = self.admin_command(router, doc! { "listShards": 1 }).await?;
        let shards = reply
            .get_array("shards")
            .map(|shards| {
                shards
                    .iter()
                    .filter_map(Bson::as_document)
                    .map(|s| RegisteredShard {
                        name: s.get_str("_id").unwrap_or_default().to_string(),
                        host: s.get_str("host").unwrap_or_default().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(shards)
    }

    async fn add_shard(&self, router: &Endpoint, shard: &ShardSpec) -> AdminResult<()> {
        let command = doc! {
            "addShard": shard.connection_string(),
            "name": shard.name.clone(),
        };
        self.admin_command(router, command)
            .await
            .map(|_| ())
            .map_err(|e| rejected_as_existing(e, "already exists"))
    }

    async fn enable_sharding(&self, router: &Endpoint, database: &str) -> AdminResult<()> {
        self.admin_command(router, doc! { "enableSharding": database })
            .await?;
        Ok(())
    }

    async fn list_collections(&self, router: &Endpoint, database: &str) -> AdminResult<Vec<String>> {
        let client = self.client(router).await?;
        client
            .database(database)
            .list_collection_names(None)
            .await
            .map_err(|e| classify(router, e))
    }

    async fn create_collection(
        &self,
        router: &Endpoint,
        database: &str,
        collection: &str,
    ) -> AdminResult<()> {
        let client = self.client(router).await?;
        client
            .database(database)
            .create_collection(collection, None)
            .await
            .map_err(|e| classify(router, e))
    }

    async fn shard_collection(
        &self,
        router: &Endpoint,
        database: &str,
        collection: &str,
        key: &ShardKey,
    ) -> AdminResult<()> {
        let command = doc! {
            "shardCollection": format!("{}.{}", database, collection),
            "key": shard_key_document(key),
        };
        self.admin_command(router, command)
            .await
            .map(|_| ())
            .map_err(|e| rejected_as_existing(e, "already sharded"))
    }

    async fn collection_shard_key(
        &self,
        router: &Endpoint,
        database: &str,
        collection: &str,
    ) -> AdminResult<Option<ShardKey>> {
        let client = self.client(router).await?;
        let entry = client
            .database("config")
            .collection::<Document>("collections")
            .find_one(doc! { "_id": format!("{}.{}", database, collection) }, None)
            .await
            .map_err(|e| classify(router, e))?;

        Ok(entry
            .filter(|e| !e.get_bool("dropped").unwrap_or(false))
            .and_then(|e| e.get_document("key").ok().and_then(shard_key_from_document)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_key_document_hashed() {
        let document = shard_key_document(&ShardKey::hashed("MMSI"));
        assert_eq!(document, doc! { "MMSI": "hashed" });
        assert_eq!(shard_key_from_document(&document), Some(ShardKey::hashed("MMSI")));
    }

    #[test]
    fn test_shard_key_document_range() {
        let document = shard_key_document(&ShardKey::range("ts"));
        assert_eq!(document, doc! { "ts": 1 });
        assert_eq!(shard_key_from_document(&document), Some(ShardKey::range("ts")));
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(
            classify_command(23, "already initialized"),
            AdminError::AlreadyInitialized
        );
        assert_eq!(
            classify_command(94, "no replset config has been received"),
            AdminError::NotYetInitialized
        );
        assert_eq!(
            classify_command(48, "Collection vesselDB.raw_data already exists."),
            AdminError::AlreadyExists("Collection vesselDB.raw_data already exists.".to_string())
        );
        assert_eq!(
            classify_command(96, "operation failed"),
            AdminError::Rejected {
                code: Some(96),
                message: "operation failed".to_string(),
            }
        );
    }

    #[test]
    fn test_duplicate_messages_become_already_exists() {
        let duplicate = classify_command(96, "A shard named shard1ReplSet already exists");
        assert!(matches!(
            rejected_as_existing(duplicate, "already exists"),
            AdminError::AlreadyExists(_)
        ));

        let sharded = classify_command(20, "vesselDB.raw_data already sharded");
        assert!(matches!(
            rejected_as_existing(sharded, "already sharded"),
            AdminError::AlreadyExists(_)
        ));

        let other = classify_command(96, "host does not belong to replica set");
        assert!(matches!(
            rejected_as_existing(other, "already exists"),
            AdminError::Rejected { code: Some(96), .. }
        ));
        assert_eq!(
            rejected_as_existing(AdminError::NotYetInitialized, "already exists"),
            AdminError::NotYetInitialized
        );
    }
}
