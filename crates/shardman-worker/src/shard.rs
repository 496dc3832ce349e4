//! A shard owned by this container.

use async_trait::async_trait;
use shardman_core::{NodeManager, Result, ShardHeartbeat, ShardSpec};
use shardman_etcd::{delete_key, put_json, Client, Session};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// The application side of a shard: the actual work behind an opaque task
/// string.
#[async_trait]
pub trait ShardTask: Send + Sync {
    /// Current load report. Opaque to the shard manager; surfaced through
    /// heartbeats as a capacity hint.
    fn load(&self) -> String;

    /// Stop the work. Must be idempotent.
    async fn close(&self);
}

/// Application seam: turns a shard spec into running work.
///
/// A failed `create` propagates to the move-action applier so the leader can
/// re-home the shard on the next cycle.
#[async_trait]
pub trait ShardFactory: Send + Sync {
    async fn create(&self, spec: &ShardSpec) -> Result<Box<dyn ShardTask>>;
}

/// A running shard instance plus its ownership assertion in etcd.
///
/// The shard heartbeat is bound to the container's session lease; it is
/// deleted eagerly on close so ownership is released immediately rather
/// than after TTL expiry. At most one heartbeat per shard exists at any
/// instant because a shard only starts after the previous owner dropped it
/// (or died, taking its lease-bound key along).
pub struct Shard {
    spec: ShardSpec,
    task: Box<dyn ShardTask>,
    client: Client,
    container_id: String,
    hb_key: String,
    closed: AtomicBool,
}

impl Shard {
    /// Instantiate the application task and register the shard heartbeat.
    pub async fn start(
        client: Client,
        session: &Session,
        nm: &NodeManager,
        container_id: &str,
        spec: ShardSpec,
        factory: &dyn ShardFactory,
    ) -> Result<Self> {
        let task = factory.create(&spec).await?;
        let hb_key = nm.shard_hb(&spec.service, &spec.id);

        let hb = ShardHeartbeat {
            container_id: container_id.to_string(),
            load: task.load(),
        };
        put_json(&client, &hb_key, &hb, Some(session.lease_id())).await?;
        debug!(shard = %spec.id, key = %hb_key, "shard heartbeat registered");

        Ok(Self {
            spec,
            task,
            client,
            container_id: container_id.to_string(),
            hb_key,
            closed: AtomicBool::new(false),
        })
    }

    pub fn spec(&self) -> &ShardSpec {
        &self.spec
    }

    pub fn load(&self) -> String {
        self.task.load()
    }

    /// Re-publish the heartbeat with the current load.
    pub async fn refresh_heartbeat(&self, session: &Session) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let hb = ShardHeartbeat {
            container_id: self.container_id.clone(),
            load: self.task.load(),
        };
        put_json(&self.client, &self.hb_key, &hb, Some(session.lease_id())).await
    }

    /// Release ownership and stop the work. Idempotent and thread-safe.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Delete before stopping the task: observers must see ownership
        // released no later than the work actually stops.
        if let Err(e) = delete_key(&self.client, &self.hb_key).await {
            // The key is lease-bound; if the delete failed the lease expiry
            // still clears it.
            warn!(shard = %self.spec.id, error = %e, "shard heartbeat delete failed");
        }
        self.task.close().await;
        debug!(shard = %self.spec.id, "shard closed");
    }
}
