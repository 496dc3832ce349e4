//! SM replica: election and control-shard lifecycle.
//!
//! Each SM process runs one replica. The replica campaigns on the SM leader
//! key with its session lease; the winner discovers the managed services and
//! runs one control shard per service until it loses the session or is
//! closed. Teardown order matters: admin mutations stop first, control
//! shards close next, and only then is leadership resigned so no second
//! leader plans while this one still writes.

use crate::control::ControlShard;
use shardman_core::{now_unix, LeaderValue, NodeManager, Result, ServiceSpec};
use shardman_etcd::{campaign, create_and_get, ShutdownSignal};
use shardman_worker::Container;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const CAMPAIGN_RETRY_DELAY: Duration = Duration::from_secs(3);
/// Post-campaign wait: long enough for every container to heartbeat at
/// least once before the first plan is derived from the heartbeat view.
const SETTLE_DELAY: Duration = Duration::from_secs(3);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Election lifecycle of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Idle,
    Campaigning,
    Leader,
    Resigning,
    Closed,
}

pub struct SmReplica {
    container: Arc<Container>,
    nm: NodeManager,
    quiet: Duration,
    state: StdMutex<ReplicaState>,
    control_shards: Mutex<BTreeMap<String, Arc<ControlShard>>>,
    /// Active close, as opposed to the session's passive loss.
    closing: ShutdownSignal,
}

impl SmReplica {
    /// Ensure the SM's own service spec exists, then start campaigning.
    pub async fn start(container: Arc<Container>, quiet: Duration) -> Result<Arc<Self>> {
        let nm = container.node_manager().clone();

        let spec = ServiceSpec::new(container.service());
        let (_, created) = create_and_get(
            container.client(),
            &nm.service_spec(container.service()),
            &serde_json::to_string(&spec)?,
            None,
        )
        .await?;
        debug!(service = %container.service(), created, "sm service spec ensured");

        let replica = Arc::new(Self {
            container,
            nm,
            quiet,
            state: StdMutex::new(ReplicaState::Idle),
            control_shards: Mutex::new(BTreeMap::new()),
            closing: ShutdownSignal::new(),
        });
        tokio::spawn(replica.clone().campaign_loop());
        Ok(replica)
    }

    pub fn state(&self) -> ReplicaState {
        *self.state.lock().expect("state lock")
    }

    /// Whether admin mutations should be refused (teardown in progress).
    pub fn is_closing(&self) -> bool {
        self.closing.is_triggered() || self.container.done().is_triggered()
    }

    /// Active close: stops campaigning, tears down control shards, resigns.
    /// Idempotent; safe to race the passive session-loss path.
    pub fn close(&self) {
        self.closing.trigger();
    }

    fn set_state(&self, next: ReplicaState) {
        let mut state = self.state.lock().expect("state lock");
        if *state != ReplicaState::Closed {
            *state = next;
        }
    }

    async fn campaign_loop(self: Arc<Self>) {
        let session_done = self.container.done();

        loop {
            if self.closing.is_triggered() || session_done.is_triggered() {
                break;
            }

            self.set_state(ReplicaState::Campaigning);
            let value = LeaderValue {
                container_id: self.container.id().to_string(),
                create_time: now_unix(),
            };
            let value = match serde_json::to_string(&value) {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "leader value encode failed");
                    break;
                }
            };

            let leader_key = self.nm.leader();
            let leadership = tokio::select! {
                _ = self.closing.wait() => break,
                _ = session_done.wait() => break,
                res = campaign(
                    self.container.client(),
                    self.container.session(),
                    &leader_key,
                    &value,
                ) => match res {
                    Ok(leadership) => leadership,
                    Err(e) => {
                        error!(error = %e, "campaign failed, retrying");
                        tokio::time::sleep(CAMPAIGN_RETRY_DELAY).await;
                        continue;
                    }
                },
            };

            self.set_state(ReplicaState::Leader);
            info!(id = %self.container.id(), "replica is leader");
            tokio::time::sleep(SETTLE_DELAY).await;

            // Blocks until the term ends.
            self.run_leader(&session_done).await;

            self.set_state(ReplicaState::Resigning);
            self.stop_control_shards().await;
            if !session_done.is_triggered() {
                if let Err(e) = leadership.resign().await {
                    warn!(error = %e, "resign failed, lease expiry takes over");
                }
            }
            self.set_state(ReplicaState::Idle);
        }

        if self.closing.is_triggered() {
            let mut state = self.state.lock().expect("state lock");
            *state = ReplicaState::Closed;
        }
        debug!(id = %self.container.id(), "campaign loop exited");
    }

    /// The leader's term: keep the control-shard set in sync with the
    /// declared service specs until close or session loss.
    async fn run_leader(&self, session_done: &ShutdownSignal) {
        loop {
            if self.closing.is_triggered() || session_done.is_triggered() {
                return;
            }

            let root = self.nm.service_root();
            let (entries, revision) =
                match shardman_etcd::get_prefix(self.container.client(), &root).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "service listing failed, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };
            for (key, _) in &entries {
                if let Some(service) = self.nm.service_of_spec_key(key) {
                    self.ensure_control_shard(service).await;
                }
            }

            let mut watcher =
                match shardman_etcd::watch_prefix(self.container.client(), &root, revision).await {
                    Ok(w) => w,
                    Err(e) => {
                        warn!(error = %e, "service watch failed, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };

            loop {
                tokio::select! {
                    _ = self.closing.wait() => return,
                    _ = session_done.wait() => return,
                    events = watcher.next() => match events {
                        Ok(events) => {
                            for event in events {
                                match &event {
                                    shardman_etcd::WatchEvent::Put { key, .. } => {
                                        if let Some(service) = self.nm.service_of_spec_key(key) {
                                            self.ensure_control_shard(service).await;
                                        }
                                    }
                                    shardman_etcd::WatchEvent::Delete { key } => {
                                        if let Some(service) = self.nm.service_of_spec_key(key) {
                                            self.remove_control_shard(service).await;
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "service watch interrupted, reconnecting");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn ensure_control_shard(&self, service: &str) {
        let mut shards = self.control_shards.lock().await;
        if shards.contains_key(service) {
            return;
        }
        match ControlShard::start(
            self.container.client().clone(),
            self.nm.clone(),
            service.to_string(),
            self.quiet,
        )
        .await
        {
            Ok(shard) => {
                shards.insert(service.to_string(), shard);
            }
            Err(e) => {
                // Retried when the next spec event for the service arrives.
                error!(service = %service, error = %e, "control shard start failed");
            }
        }
    }

    async fn remove_control_shard(&self, service: &str) {
        let mut shards = self.control_shards.lock().await;
        if let Some(shard) = shards.remove(service) {
            shard.close();
            info!(service = %service, "control shard removed");
        }
    }

    async fn stop_control_shards(&self) {
        let mut shards = self.control_shards.lock().await;
        for (service, shard) in shards.iter() {
            debug!(service = %service, "stopping control shard");
            shard.close();
        }
        shards.clear();
    }
}
