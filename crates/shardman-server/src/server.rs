//! SM server: construction, supervision, and shutdown.

use crate::api::{self, ApiState};
use crate::replica::SmReplica;
use async_trait::async_trait;
use shardman_core::{Result, ShardSpec, SmError};
use shardman_etcd::ShutdownSignal;
use shardman_worker::{
    Container, ContainerOptions, ShardFactory, ShardServer, ShardServerOptions, ShardTask,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(3);
const RETRY_DELAY_MAX: Duration = Duration::from_secs(30);

/// Configuration for one SM replica. All fields are required; the logger is
/// the process-global `tracing` subscriber installed by the binary.
#[derive(Clone, Default)]
pub struct ServerOptions {
    id: String,
    service: String,
    endpoints: Vec<String>,
    addr: String,
    etcd_prefix: String,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable identity of this replica across restarts.
    pub fn id(mut self, v: impl Into<String>) -> Self {
        self.id = v.into();
        self
    }

    /// Name of the SM service itself in the registry.
    pub fn service(mut self, v: impl Into<String>) -> Self {
        self.service = v.into();
        self
    }

    pub fn endpoints(mut self, v: Vec<String>) -> Self {
        self.endpoints = v;
        self
    }

    /// Admin HTTP bind address.
    pub fn addr(mut self, v: impl Into<String>) -> Self {
        self.addr = v.into();
        self
    }

    /// Root prefix carved out of etcd for shardman.
    pub fn etcd_prefix(mut self, v: impl Into<String>) -> Self {
        self.etcd_prefix = v.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(SmError::Config("id required".into()));
        }
        if self.service.is_empty() {
            return Err(SmError::Config("service required".into()));
        }
        if self.endpoints.is_empty() {
            return Err(SmError::Config("endpoints required".into()));
        }
        if self.addr.is_empty() {
            return Err(SmError::Config("addr required".into()));
        }
        if self.etcd_prefix.is_empty() {
            return Err(SmError::Config("etcdPrefix required".into()));
        }
        Ok(())
    }
}

/// The SM service declares no shards of its own; the factory exists because
/// the replica registers as a regular container through the worker library.
struct SmShardFactory;

struct SmShardTask;

#[async_trait]
impl ShardTask for SmShardTask {
    fn load(&self) -> String {
        "0".into()
    }

    async fn close(&self) {}
}

#[async_trait]
impl ShardFactory for SmShardFactory {
    async fn create(&self, _spec: &ShardSpec) -> Result<Box<dyn ShardTask>> {
        Ok(Box::new(SmShardTask))
    }
}

struct Inner {
    replica: Arc<SmReplica>,
    shard_server: Arc<ShardServer>,
}

/// One SM server process.
///
/// `Server::new` runs the full stack and spawns a supervisor. Active close
/// (`close()`) is terminal; passive exit (session loss) tears the stack
/// down and re-runs it with bounded backoff until closed for real. Both
/// paths converge on the closed state and may race safely: every
/// sub-component's close is idempotent.
pub struct Server {
    opts: ServerOptions,
    inner: Mutex<Option<Inner>>,
    donec: ShutdownSignal,
}

impl Server {
    pub async fn new(opts: ServerOptions) -> Result<Arc<Self>> {
        opts.validate()?;
        let server = Arc::new(Self {
            opts,
            inner: Mutex::new(None),
            donec: ShutdownSignal::new(),
        });
        server.run().await?;
        tokio::spawn(server.clone().supervise());
        Ok(server)
    }

    /// Fires on active close.
    pub fn done(&self) -> ShutdownSignal {
        self.donec.clone()
    }

    /// Active shutdown. Idempotent; may race the passive-exit path.
    pub async fn close(&self) {
        self.donec.trigger();
        self.teardown().await;
        info!(service = %self.opts.service, "server closed");
    }

    /// Build the whole stack: container (session + heartbeat), replica
    /// (election), admin API, shard server (HTTP + task watcher).
    async fn run(&self) -> Result<()> {
        let container = Container::start(
            ContainerOptions::new()
                .id(self.opts.id.clone())
                .service(self.opts.service.clone())
                .endpoints(self.opts.endpoints.clone())
                .etcd_prefix(self.opts.etcd_prefix.clone()),
            Arc::new(SmShardFactory),
        )
        .await?;

        let replica = match SmReplica::start(container.clone(), DEFAULT_QUIET_PERIOD).await {
            Ok(replica) => replica,
            Err(e) => {
                container.close().await;
                return Err(e);
            }
        };

        let routes = api::router(ApiState {
            client: container.client().clone(),
            nm: container.node_manager().clone(),
            replica: replica.clone(),
        });
        let shard_server = match ShardServer::start(
            ShardServerOptions::new()
                .addr(self.opts.addr.clone())
                .routes(routes),
            container.clone(),
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                replica.close();
                container.close().await;
                return Err(e);
            }
        };

        *self.inner.lock().await = Some(Inner {
            replica,
            shard_server,
        });
        Ok(())
    }

    async fn teardown(&self) {
        let inner = self.inner.lock().await.take();
        if let Some(inner) = inner {
            // Replica first: admin mutations stop and control shards close
            // while the session still holds leadership.
            inner.replica.close();
            inner.shard_server.close().await;
        }
    }

    /// Active close returns; passive exit (session loss) rebuilds the stack
    /// until an active close arrives.
    async fn supervise(self: Arc<Self>) {
        loop {
            let passive = {
                let inner = self.inner.lock().await;
                match inner.as_ref() {
                    Some(inner) => inner.shard_server.done(),
                    None => return,
                }
            };

            tokio::select! {
                _ = self.donec.wait() => {
                    info!(service = %self.opts.service, "server active exit");
                    return;
                }
                _ = passive.wait() => {
                    info!(service = %self.opts.service, "server passive exit, restarting");
                    self.teardown().await;

                    let mut delay = Duration::from_secs(1);
                    loop {
                        if self.donec.is_triggered() {
                            info!(service = %self.opts.service, "active exit during restart");
                            return;
                        }
                        match self.run().await {
                            Ok(()) => break,
                            Err(e) => {
                                error!(service = %self.opts.service, error = %e, "restart failed");
                                tokio::time::sleep(delay).await;
                                delay = (delay * 2).min(RETRY_DELAY_MAX);
                            }
                        }
                    }
                }
            }
        }
    }
}
