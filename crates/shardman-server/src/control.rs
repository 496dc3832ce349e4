//! Control shard: the per-service rebalance loop.
//!
//! One control shard exists per managed service, only on the leader. It
//! keeps a snapshot of the service (declared shards, container heartbeats,
//! shard heartbeats) behind a single mutex, fed by three prefix watchers.
//! Changes post a dirty signal; after a quiet period with no further events
//! the planner runs the assignment engine and publishes the resulting move
//! list together with the updated shard placements in one transaction.

use crate::engine::{self, EngineInput, EngineShard};
use shardman_core::{
    MoveAction, NodeManager, Result, ServiceSpec, ShardHeartbeat, ShardSpec,
};
use shardman_etcd::{
    get_json_prefix, put_json, txn_puts, Client, ShutdownSignal, WatchEvent,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// In-memory view of one service, updated by the watchers.
#[derive(Default)]
struct Snapshot {
    service_spec: Option<ServiceSpec>,
    shards: BTreeMap<String, ShardSpec>,
    containers: BTreeSet<String>,
    shard_hbs: BTreeMap<String, ShardHeartbeat>,
    /// Shards whose spec task changed since they were last planned; the
    /// next plan recycles them in place.
    task_changed: BTreeSet<String>,
}

enum WatchKind {
    /// The service's spec + shard subtree under the SM root.
    SpecTree,
    ContainerHb,
    ShardHb,
}

pub struct ControlShard {
    service: String,
    nm: NodeManager,
    client: Client,
    quiet: Duration,
    done: ShutdownSignal,
    snapshot: Mutex<Snapshot>,
    dirty_tx: mpsc::UnboundedSender<()>,
}

impl ControlShard {
    /// Seed the workers with the current placements, then start the
    /// watchers and the planner.
    pub async fn start(
        client: Client,
        nm: NodeManager,
        service: String,
        quiet: Duration,
    ) -> Result<Arc<Self>> {
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let shard = Arc::new(Self {
            service,
            nm,
            client,
            quiet,
            done: ShutdownSignal::new(),
            snapshot: Mutex::new(Snapshot::default()),
            dirty_tx,
        });

        shard.leader_start_distribution().await?;

        shard
            .clone()
            .spawn_watcher(shard.nm.service_subtree(&shard.service), WatchKind::SpecTree);
        shard.clone().spawn_watcher(
            shard.nm.container_hb_root(&shard.service),
            WatchKind::ContainerHb,
        );
        shard
            .clone()
            .spawn_watcher(shard.nm.shard_hb_root(&shard.service), WatchKind::ShardHb);
        shard.clone().spawn_planner(dirty_rx);

        info!(service = %shard.service, "control shard started");
        Ok(shard)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Stop the watchers and the planner. A planner run already in flight
    /// completes; its publish is atomic either way. Idempotent.
    pub fn close(&self) {
        self.done.trigger();
        info!(service = %self.service, "control shard closed");
    }

    /// Re-issue the placements recorded in the shard specs so workers that
    /// restarted during the leader gap pick their shards back up.
    /// `allow_drop` lets an overloaded worker reject the seed; the first
    /// planner cycle then re-homes it.
    async fn leader_start_distribution(&self) -> Result<()> {
        let (specs, _) =
            get_json_prefix::<ShardSpec>(&self.client, &self.nm.shard_root(&self.service)).await?;

        let mut actions = Vec::new();
        for (shard_id, spec) in &specs {
            if spec.container_id.is_empty() {
                continue;
            }
            actions.push(MoveAction {
                service: self.service.clone(),
                shard_id: shard_id.clone(),
                add_endpoint: spec.container_id.clone(),
                task: spec.task.clone(),
                allow_drop: true,
                ..Default::default()
            });
        }

        if actions.is_empty() {
            debug!(service = %self.service, "no placements to seed");
            return Ok(());
        }

        info!(
            service = %self.service,
            count = actions.len(),
            "seeding current placements"
        );
        put_json(&self.client, &self.nm.task(&self.service), &actions, None).await
    }

    /// One watcher: load the prefix, stream changes into the snapshot, post
    /// dirty. Watch failures re-read the prefix and re-watch from the fresh
    /// revision.
    fn spawn_watcher(self: Arc<Self>, prefix: String, kind: WatchKind) {
        tokio::spawn(async move {
            loop {
                if self.done.is_triggered() {
                    return;
                }

                let (entries, revision) =
                    match shardman_etcd::get_prefix(&self.client, &prefix).await {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(prefix = %prefix, error = %e, "prefix read failed, retrying");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            continue;
                        }
                    };
                self.reload(&kind, &prefix, entries).await;
                self.mark_dirty();

                let mut watcher =
                    match shardman_etcd::watch_prefix(&self.client, &prefix, revision).await {
                        Ok(w) => w,
                        Err(e) => {
                            warn!(prefix = %prefix, error = %e, "watch open failed, retrying");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            continue;
                        }
                    };

                loop {
                    tokio::select! {
                        _ = self.done.wait() => return,
                        events = watcher.next() => match events {
                            Ok(events) => {
                                if events.is_empty() {
                                    continue;
                                }
                                let mut snapshot = self.snapshot.lock().await;
                                for event in events {
                                    self.apply_event(&mut snapshot, &kind, &prefix, event);
                                }
                                drop(snapshot);
                                self.mark_dirty();
                            }
                            Err(e) => {
                                warn!(prefix = %prefix, error = %e, "watch interrupted, reconnecting");
                                tokio::time::sleep(RECONNECT_DELAY).await;
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Replace this watcher's slice of the snapshot with a fresh read.
    async fn reload(&self, kind: &WatchKind, prefix: &str, entries: Vec<(String, String)>) {
        let mut snapshot = self.snapshot.lock().await;
        let old_shards = match kind {
            WatchKind::SpecTree => {
                snapshot.service_spec = None;
                Some(std::mem::take(&mut snapshot.shards))
            }
            WatchKind::ContainerHb => {
                snapshot.containers.clear();
                None
            }
            WatchKind::ShardHb => {
                snapshot.shard_hbs.clear();
                None
            }
        };
        for (key, value) in entries {
            self.apply_event(&mut snapshot, kind, prefix, WatchEvent::Put { key, value });
        }
        // Task changes that landed while the watch was down would otherwise
        // go unnoticed: diff the reloaded specs against the previous view.
        if let Some(old_shards) = old_shards {
            let changed: Vec<String> = snapshot
                .shards
                .iter()
                .filter(|(id, spec)| {
                    old_shards.get(*id).is_some_and(|old| old.task != spec.task)
                })
                .map(|(id, _)| id.clone())
                .collect();
            snapshot.task_changed.extend(changed);
        }
    }

    fn apply_event(
        &self,
        snapshot: &mut Snapshot,
        kind: &WatchKind,
        prefix: &str,
        event: WatchEvent,
    ) {
        match kind {
            WatchKind::SpecTree => self.apply_spec_event(snapshot, event),
            WatchKind::ContainerHb => {
                let id = event.key().strip_prefix(prefix).unwrap_or("").to_string();
                if id.is_empty() {
                    return;
                }
                match event {
                    WatchEvent::Put { .. } => {
                        snapshot.containers.insert(id);
                    }
                    WatchEvent::Delete { .. } => {
                        snapshot.containers.remove(&id);
                    }
                }
            }
            WatchKind::ShardHb => {
                let id = event.key().strip_prefix(prefix).unwrap_or("").to_string();
                if id.is_empty() {
                    return;
                }
                match event {
                    WatchEvent::Put { value, .. } => {
                        match serde_json::from_str::<ShardHeartbeat>(&value) {
                            Ok(hb) => {
                                snapshot.shard_hbs.insert(id, hb);
                            }
                            Err(e) => {
                                warn!(shard = %id, error = %e, "undecodable shard heartbeat");
                            }
                        }
                    }
                    WatchEvent::Delete { .. } => {
                        snapshot.shard_hbs.remove(&id);
                    }
                }
            }
        }
    }

    fn apply_spec_event(&self, snapshot: &mut Snapshot, event: WatchEvent) {
        let spec_key = self.nm.service_spec(&self.service);
        let shard_root = self.nm.shard_root(&self.service);

        if event.key() == spec_key {
            match event {
                WatchEvent::Put { value, .. } => match serde_json::from_str(&value) {
                    Ok(spec) => snapshot.service_spec = Some(spec),
                    Err(e) => warn!(service = %self.service, error = %e, "undecodable service spec"),
                },
                WatchEvent::Delete { .. } => snapshot.service_spec = None,
            }
            return;
        }

        let Some(shard_id) = event.key().strip_prefix(&shard_root).map(str::to_string) else {
            return;
        };
        if shard_id.is_empty() {
            return;
        }
        match event {
            WatchEvent::Put { value, .. } => match serde_json::from_str::<ShardSpec>(&value) {
                Ok(spec) => {
                    if let Some(old) = snapshot.shards.get(&shard_id) {
                        if old.task != spec.task {
                            snapshot.task_changed.insert(shard_id.clone());
                        }
                    }
                    snapshot.shards.insert(shard_id, spec);
                }
                Err(e) => warn!(shard = %shard_id, error = %e, "undecodable shard spec"),
            },
            WatchEvent::Delete { .. } => {
                snapshot.shards.remove(&shard_id);
                snapshot.task_changed.remove(&shard_id);
            }
        }
    }

    fn mark_dirty(&self) {
        let _ = self.dirty_tx.send(());
    }

    /// Debounce dirty signals with the quiet period, then plan. Planner
    /// errors are logged; the next dirty signal retries.
    fn spawn_planner(self: Arc<Self>, mut dirty_rx: mpsc::UnboundedReceiver<()>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.done.wait() => return,
                    msg = dirty_rx.recv() => {
                        if msg.is_none() {
                            return;
                        }
                    }
                }

                // Absorb the burst: wait until the service has been quiet
                // for the full period. Rolling restarts land as one plan.
                if !wait_quiet(&mut dirty_rx, self.quiet).await {
                    return;
                }

                if self.done.is_triggered() {
                    return;
                }
                if let Err(e) = self.run_planner().await {
                    error!(service = %self.service, error = %e, "planner run failed");
                }
            }
        });
    }

    async fn run_planner(&self) -> Result<()> {
        let (input, specs, consumed) = {
            let snapshot = self.snapshot.lock().await;
            let shards = snapshot
                .shards
                .values()
                .map(|spec| EngineShard {
                    id: spec.id.clone(),
                    group: spec.group.clone(),
                    task: spec.task.clone(),
                    manual_container_id: spec.manual_container_id.clone(),
                    current_container: spec.container_id.clone(),
                    asserted: snapshot
                        .shard_hbs
                        .get(&spec.id)
                        .is_some_and(|hb| hb.container_id == spec.container_id),
                    task_changed: snapshot.task_changed.contains(&spec.id),
                })
                .collect();

            // Heartbeats without a declaration: the spec was deleted while
            // a worker still runs the shard. The plan reaps them.
            let mut orphans = BTreeMap::new();
            for (id, hb) in &snapshot.shard_hbs {
                if snapshot.shards.contains_key(id) || hb.container_id.is_empty() {
                    continue;
                }
                orphans.insert(id.clone(), hb.container_id.clone());
            }

            // Which task changes this plan consumes, with the task it
            // plans. Needed to clear the flags precisely afterwards.
            let mut consumed = BTreeMap::new();
            for id in &snapshot.task_changed {
                if let Some(spec) = snapshot.shards.get(id) {
                    consumed.insert(id.clone(), spec.task.clone());
                }
            }

            let input = EngineInput {
                containers: snapshot.containers.clone(),
                max_shard_count: snapshot
                    .service_spec
                    .as_ref()
                    .map(|s| s.max_shard_count)
                    .unwrap_or(0),
                shards,
                orphans,
            };
            (input, snapshot.shards.clone(), consumed)
        };

        let plan = engine::plan(&self.service, &input);
        if !plan.overflow.is_empty() {
            // Infeasible placements never crash the leader; the excess
            // stays unassigned until capacity appears.
            warn!(
                service = %self.service,
                shards = ?plan.overflow,
                "no feasible assignment, shards left unassigned"
            );
        }

        // Persist changed placements so specs never point at a container
        // the plan abandoned.
        let mut puts: Vec<(String, String)> = Vec::new();
        for (shard_id, new_owner) in &plan.placements {
            let Some(spec) = specs.get(shard_id) else {
                continue;
            };
            if &spec.container_id != new_owner {
                let mut updated = spec.clone();
                updated.container_id = new_owner.clone();
                puts.push((
                    self.nm.shard_spec(&self.service, shard_id),
                    serde_json::to_string(&updated)?,
                ));
            }
        }

        if plan.actions.is_empty() && puts.is_empty() {
            debug!(service = %self.service, "snapshot converged, nothing to publish");
        } else {
            if !plan.actions.is_empty() {
                info!(
                    service = %self.service,
                    moves = plan.actions.len(),
                    "publishing move action list"
                );
                puts.push((
                    self.nm.task(&self.service),
                    serde_json::to_string(&plan.actions)?,
                ));
            }
            txn_puts(&self.client, puts).await?;
        }

        // Clear exactly the task changes this plan consumed. The lock was
        // released during the publish, so a change that landed in between
        // (the task no longer matches what was planned) stays flagged and
        // the next cycle recycles it.
        let mut snapshot = self.snapshot.lock().await;
        for (shard_id, new_owner) in &plan.placements {
            if let Some(spec) = snapshot.shards.get_mut(shard_id) {
                spec.container_id = new_owner.clone();
            }
        }
        for (shard_id, planned_task) in &consumed {
            if snapshot.shards.get(shard_id).map(|s| s.task.as_str())
                == Some(planned_task.as_str())
            {
                snapshot.task_changed.remove(shard_id);
            }
        }
        Ok(())
    }
}

/// Drain dirty signals until `quiet` elapses with none arriving. Returns
/// `false` when the channel closed (the control shard is gone).
async fn wait_quiet(dirty_rx: &mut mpsc::UnboundedReceiver<()>, quiet: Duration) -> bool {
    loop {
        match tokio::time::timeout(quiet, dirty_rx.recv()).await {
            Ok(Some(())) => continue,
            Ok(None) => return false,
            Err(_) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn quiet_period_absorbs_bursts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..5 {
            tx.send(()).unwrap();
        }

        assert!(wait_quiet(&mut rx, Duration::from_secs(3)).await);
        // The burst was fully drained; nothing is pending afterwards.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_ends_the_wait() {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        drop(tx);
        assert!(!wait_quiet(&mut rx, Duration::from_secs(3)).await);
    }
}
