//! Shard server: the HTTP surface and move-command consumer of a worker.

use crate::Container;
use axum::{routing::get, Router};
use shardman_core::{MoveAction, MoveActionList, Result, ShardSpec, SmError};
use shardman_etcd::{get_raw, watch_key, ShutdownSignal};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Configuration for the shard server. `addr` is required; `routes` lets the
/// embedding application (or the SM server) mount extra handlers next to the
/// built-in `/health`.
#[derive(Default)]
pub struct ShardServerOptions {
    addr: String,
    routes: Option<Router>,
}

impl ShardServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn addr(mut self, v: impl Into<String>) -> Self {
        self.addr = v.into();
        self
    }

    pub fn routes(mut self, router: Router) -> Self {
        self.routes = Some(router);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(SmError::Config("listen addr required".into()));
        }
        Ok(())
    }
}

/// Hosts the admin HTTP endpoint and obeys the leader's move commands.
///
/// Watches the service's task key; each published move-action list is
/// filtered down to the actions addressed to this container and applied to
/// the local shard map. The list is replace-latest: whatever value the key
/// holds is the whole current plan.
pub struct ShardServer {
    container: Arc<Container>,
}

impl ShardServer {
    pub async fn start(options: ShardServerOptions, container: Arc<Container>) -> Result<Arc<Self>> {
        options.validate()?;

        let listener = tokio::net::TcpListener::bind(&options.addr)
            .await
            .map_err(|e| SmError::Config(format!("bind {}: {e}", options.addr)))?;

        let mut app = Router::new().route("/health", get(|| async { "ok" }));
        if let Some(routes) = options.routes {
            app = app.merge(routes);
        }

        let done = container.done();
        let addr = options.addr.clone();
        tokio::spawn(async move {
            info!(addr = %addr, "shard server listening");
            let shutdown = async move { done.wait().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "shard server terminated");
            }
        });

        let server = Arc::new(Self { container });
        server.clone().spawn_task_watcher();
        Ok(server)
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// Fires when the underlying session ends, actively or passively.
    pub fn done(&self) -> ShutdownSignal {
        self.container.done()
    }

    /// Graceful shutdown: closes the container (shards, then session), which
    /// in turn stops the HTTP server and the task watcher. Idempotent.
    pub async fn close(&self) {
        self.container.close().await;
    }

    /// Watch the task key and apply each published plan. Transient watch
    /// failures re-read the key and re-watch from the fresh revision.
    fn spawn_task_watcher(self: Arc<Self>) {
        let done = self.container.done();
        let client = self.container.client().clone();
        let task_key = self
            .container
            .node_manager()
            .task(self.container.service());

        tokio::spawn(async move {
            loop {
                if done.is_triggered() {
                    return;
                }

                let (current, revision) = match get_raw(&client, &task_key).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(key = %task_key, error = %e, "task read failed, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };
                if let Some(value) = current {
                    self.apply_plan(&value).await;
                }

                let mut watcher = match watch_key(&client, &task_key, revision).await {
                    Ok(w) => w,
                    Err(e) => {
                        warn!(key = %task_key, error = %e, "task watch failed, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };

                loop {
                    tokio::select! {
                        _ = done.wait() => {
                            debug!(key = %task_key, "task watcher stopped");
                            return;
                        }
                        events = watcher.next() => {
                            match events {
                                Ok(events) => {
                                    for event in events {
                                        if let shardman_etcd::WatchEvent::Put { value, .. } = event {
                                            self.apply_plan(&value).await;
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(key = %task_key, error = %e, "task watch interrupted, reconnecting");
                                    tokio::time::sleep(RECONNECT_DELAY).await;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    async fn apply_plan(&self, value: &str) {
        let actions: MoveActionList = match serde_json::from_str(value) {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "undecodable move action list ignored");
                return;
            }
        };

        for step in steps_for(&actions, self.container.id()) {
            if self.apply_step(step).await.is_err() {
                // Closing: the remainder of the plan is moot.
                return;
            }
        }
    }

    /// Execute one step. Returns `Err` only when the container is closing.
    async fn apply_step(&self, step: ApplyStep) -> Result<()> {
        match step {
            ApplyStep::Drop { shard_id } => {
                match self.container.drop_shard(&shard_id).await {
                    Ok(()) => {}
                    // Already gone; drops are idempotent.
                    Err(SmError::NotExist) => {}
                    Err(SmError::Closing) => return Err(SmError::Closing),
                    Err(e) => {
                        warn!(shard = %shard_id, error = %e, "drop failed");
                    }
                }
            }
            ApplyStep::Add { spec, allow_drop } => {
                let shard_id = spec.id.clone();
                match self.container.add(spec).await {
                    Ok(()) => {}
                    // Already owned with the same task; adds are idempotent.
                    Err(SmError::Exist) => {}
                    Err(SmError::Closing) => return Err(SmError::Closing),
                    Err(e) if allow_drop => {
                        // The leader seeded this assignment speculatively;
                        // the next planner cycle re-homes the shard.
                        info!(shard = %shard_id, error = %e, "assignment rejected");
                    }
                    Err(e) => {
                        warn!(shard = %shard_id, error = %e, "add failed, awaiting next rebalance");
                    }
                }
            }
        }
        Ok(())
    }
}

/// One local operation derived from a move action.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ApplyStep {
    Drop { shard_id: String },
    Add { spec: ShardSpec, allow_drop: bool },
}

/// Filter a published plan down to the steps addressed to `container_id`,
/// in application order. When an action hands a shard over within the same
/// container (task change), the drop precedes the add.
fn steps_for(actions: &[MoveAction], container_id: &str) -> Vec<ApplyStep> {
    let mut steps = Vec::new();
    for action in actions {
        if action.drops_on(container_id) {
            steps.push(ApplyStep::Drop {
                shard_id: action.shard_id.clone(),
            });
        }
        if action.adds_on(container_id) {
            steps.push(ApplyStep::Add {
                spec: ShardSpec {
                    id: action.shard_id.clone(),
                    service: action.service.clone(),
                    task: action.task.clone(),
                    ..Default::default()
                },
                allow_drop: action.allow_drop,
            });
        }
    }
    steps
}
