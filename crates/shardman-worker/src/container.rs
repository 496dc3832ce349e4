//! Worker container: shard ownership and liveness.

use crate::shard::{Shard, ShardFactory};
use shardman_core::{
    now_unix, ContainerHeartbeat, NodeManager, Result, ShardSpec, SmError,
};
use shardman_etcd::{connect, put_json, Client, Session, ShutdownSignal};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_LEASE_TTL: i64 = 15;

/// Configuration for a worker container. `id`, `service`, and `endpoints`
/// are required; `id` must be stable across restarts.
#[derive(Default)]
pub struct ContainerOptions {
    id: String,
    service: String,
    endpoints: Vec<String>,
    etcd_prefix: String,
    lease_ttl: i64,
}

impl ContainerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, v: impl Into<String>) -> Self {
        self.id = v.into();
        self
    }

    pub fn service(mut self, v: impl Into<String>) -> Self {
        self.service = v.into();
        self
    }

    pub fn endpoints(mut self, v: Vec<String>) -> Self {
        self.endpoints = v;
        self
    }

    pub fn etcd_prefix(mut self, v: impl Into<String>) -> Self {
        self.etcd_prefix = v.into();
        self
    }

    pub fn lease_ttl(mut self, v: i64) -> Self {
        self.lease_ttl = v;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(SmError::Config("container id required".into()));
        }
        if self.service.is_empty() {
            return Err(SmError::Config("service required".into()));
        }
        if self.endpoints.is_empty() {
            return Err(SmError::Config("etcd endpoints required".into()));
        }
        Ok(())
    }
}

/// A worker container: one process's membership in a service.
///
/// Owns the session every lease-bound key of this process hangs off, the
/// local shard map, and the heartbeat loop. The mutex guards the map for
/// the duration of map mutation plus the closing check; shard I/O happens
/// outside it.
pub struct Container {
    id: String,
    service: String,
    nm: NodeManager,
    client: Client,
    session: Session,
    factory: Arc<dyn ShardFactory>,
    shards: Mutex<HashMap<String, Arc<Shard>>>,
    closing: AtomicBool,
}

impl Container {
    /// Connect, open the session, publish the container heartbeat, and start
    /// the load-reporting loop.
    pub async fn start(
        options: ContainerOptions,
        factory: Arc<dyn ShardFactory>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let prefix = if options.etcd_prefix.is_empty() {
            shardman_core::DEFAULT_ETCD_PREFIX.to_string()
        } else {
            options.etcd_prefix.clone()
        };
        let ttl = if options.lease_ttl > 0 {
            options.lease_ttl
        } else {
            DEFAULT_LEASE_TTL
        };

        let client = connect(&options.endpoints).await?;
        let session = Session::new(client.clone(), ttl).await?;

        let container = Arc::new(Self {
            id: options.id.clone(),
            service: options.service.clone(),
            nm: NodeManager::new(prefix, options.service.clone()),
            client,
            session,
            factory,
            shards: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        });

        container.publish_heartbeat().await?;
        container.clone().spawn_heartbeat_loop();

        info!(
            id = %container.id,
            service = %container.service,
            lease_id = container.session.lease_id(),
            "container started"
        );
        Ok(container)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn node_manager(&self) -> &NodeManager {
        &self.nm
    }

    /// Fires when the session ends, actively or through keepalive failure.
    pub fn done(&self) -> ShutdownSignal {
        self.session.done()
    }

    /// Add a shard. `Exist` when the shard is present with an unchanged
    /// task; a changed task closes the old instance and starts a fresh one
    /// in place.
    pub async fn add(&self, spec: ShardSpec) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(SmError::Closing);
        }
        // A lost session means every heartbeat this container would write is
        // already doomed; the caller re-registers instead of retrying.
        if self.session.is_closed() {
            return Err(SmError::SessionLost);
        }

        let replaced = {
            let mut shards = self.shards.lock().await;
            if self.closing.load(Ordering::SeqCst) {
                return Err(SmError::Closing);
            }
            match shards.get(&spec.id) {
                Some(existing) if existing.spec().task == spec.task => {
                    debug!(shard = %spec.id, "shard existed and task not changed");
                    return Err(SmError::Exist);
                }
                Some(_) => shards.remove(&spec.id),
                None => None,
            }
        };
        if let Some(old) = replaced {
            info!(shard = %spec.id, "task changed, closing current instance");
            old.close().await;
        }

        let shard = Arc::new(
            Shard::start(
                self.client.clone(),
                &self.session,
                &self.nm,
                &self.id,
                spec.clone(),
                self.factory.as_ref(),
            )
            .await?,
        );

        let mut shards = self.shards.lock().await;
        if self.closing.load(Ordering::SeqCst) {
            drop(shards);
            shard.close().await;
            return Err(SmError::Closing);
        }
        if let Some(displaced) = shards.insert(spec.id.clone(), shard) {
            // Two concurrent adds for the same id; the later one wins.
            drop(shards);
            displaced.close().await;
        }
        info!(shard = %spec.id, service = %self.service, "shard added");
        Ok(())
    }

    /// Drop a shard, releasing its heartbeat. `NotExist` when absent.
    pub async fn drop_shard(&self, id: &str) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(SmError::Closing);
        }

        let shard = {
            let mut shards = self.shards.lock().await;
            if self.closing.load(Ordering::SeqCst) {
                return Err(SmError::Closing);
            }
            shards.remove(id).ok_or(SmError::NotExist)?
        };
        shard.close().await;
        info!(shard = %id, service = %self.service, "shard dropped");
        Ok(())
    }

    /// Current load string of one shard.
    pub async fn load(&self, id: &str) -> Result<String> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(SmError::Closing);
        }
        let shards = self.shards.lock().await;
        let shard = shards.get(id).ok_or(SmError::NotExist)?;
        Ok(shard.load())
    }

    /// Ids of the shards currently owned.
    pub async fn shard_ids(&self) -> Vec<String> {
        let shards = self.shards.lock().await;
        let mut ids: Vec<String> = shards.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Graceful shutdown: refuse new work, close every shard (their
    /// heartbeats are deleted), then close the session so the container
    /// heartbeat vanishes. Idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<Arc<Shard>> = {
            let mut shards = self.shards.lock().await;
            shards.drain().map(|(_, s)| s).collect()
        };
        for shard in drained {
            shard.close().await;
        }

        self.session.close().await;
        info!(id = %self.id, service = %self.service, "container closed");
    }

    async fn publish_heartbeat(&self) -> Result<()> {
        let shard_count = self.shards.lock().await.len();
        let hb = ContainerHeartbeat {
            id: self.id.clone(),
            load: format!("shards={shard_count}"),
            create_time: now_unix(),
        };
        put_json(
            &self.client,
            &self.nm.container_hb(&self.service, &self.id),
            &hb,
            Some(self.session.lease_id()),
        )
        .await
    }

    /// Bounded load reporting: re-publish the container heartbeat and every
    /// shard heartbeat with fresh load values until the session ends.
    fn spawn_heartbeat_loop(self: Arc<Self>) {
        let done = self.session.done();
        let interval = Duration::from_secs((self.session.ttl() / 3).max(1) as u64);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = done.wait() => {
                        debug!(id = %self.id, "heartbeat loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                if let Err(e) = self.publish_heartbeat().await {
                    // Transient: the next tick retries, the lease keepalive
                    // is what decides liveness.
                    warn!(id = %self.id, error = %e, "container heartbeat refresh failed");
                }

                let shards: Vec<Arc<Shard>> = {
                    let shards = self.shards.lock().await;
                    shards.values().cloned().collect()
                };
                for shard in shards {
                    if let Err(e) = shard.refresh_heartbeat(&self.session).await {
                        warn!(
                            shard = %shard.spec().id,
                            error = %e,
                            "shard heartbeat refresh failed"
                        );
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> ContainerOptions {
        ContainerOptions::new()
            .id("c1")
            .service("proxy.dev")
            .endpoints(vec!["http://127.0.0.1:2379".into()])
    }

    #[test]
    fn options_validate_required_fields() {
        assert!(full().validate().is_ok());
        assert!(matches!(full().id("").validate(), Err(SmError::Config(_))));
        assert!(matches!(
            full().service("").validate(),
            Err(SmError::Config(_))
        ));
        assert!(matches!(
            full().endpoints(vec![]).validate(),
            Err(SmError::Config(_))
        ));
    }
}
