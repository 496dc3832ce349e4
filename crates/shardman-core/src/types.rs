//! Durable data model.
//!
//! Every struct here is stored in etcd or carried over the admin API as
//! camelCase JSON. Values are UTF-8; keys come from [`crate::NodeManager`].

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A declared application service managed by the SM cluster.
///
/// Created once via the admin API, idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub service: String,
    pub create_time: i64,
    /// Hard cap on shards per container. Zero means unlimited.
    #[serde(default)]
    pub max_shard_count: usize,
    /// Declared recovery tolerance in seconds. Informational: the lease TTL
    /// already encodes the re-home delay.
    #[serde(default)]
    pub max_recovery_time: i64,
}

impl ServiceSpec {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            create_time: now_unix(),
            max_shard_count: 0,
            max_recovery_time: 0,
        }
    }
}

/// Value held by the elected SM replica on the leader key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderValue {
    pub container_id: String,
    pub create_time: i64,
}

/// A declared shard and its current placement.
///
/// `task` is opaque to SM and handed to the worker verbatim. `group`
/// partitions shards balanced independently within a service. A non-empty
/// `manual_container_id` pins the shard and is never auto-migrated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSpec {
    pub id: String,
    pub service: String,
    pub task: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub manual_container_id: String,
}

/// Lease-bound container liveness record. Presence means the container is
/// alive; the value carries an opaque load hint for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHeartbeat {
    pub id: String,
    #[serde(default)]
    pub load: String,
    pub create_time: i64,
}

/// Lease-bound shard ownership assertion. Presence means the named container
/// claims the shard; absence past the lease TTL means the shard is orphaned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardHeartbeat {
    pub container_id: String,
    #[serde(default)]
    pub load: String,
}

/// One move command for a worker container.
///
/// Empty `drop_endpoint`/`add_endpoint` mean "no drop"/"no add". `task`
/// rides along on adds so the worker can instantiate the shard without a
/// spec read. `allow_drop` lets the worker reject the add without
/// destabilizing the cluster; the next planner cycle re-homes the shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveAction {
    pub service: String,
    pub shard_id: String,
    #[serde(default)]
    pub drop_endpoint: String,
    #[serde(default)]
    pub add_endpoint: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub allow_drop: bool,
}

impl MoveAction {
    pub fn drops_on(&self, container_id: &str) -> bool {
        !self.drop_endpoint.is_empty() && self.drop_endpoint == container_id
    }

    pub fn adds_on(&self, container_id: &str) -> bool {
        !self.add_endpoint.is_empty() && self.add_endpoint == container_id
    }
}

/// The most recent move-action list for a service, published as a single
/// atomic write: workers see either the entire new plan or the old one.
pub type MoveActionList = Vec<MoveAction>;
