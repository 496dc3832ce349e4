//! End-to-end rebalance against a live etcd: an SM server, two worker
//! containers, three shards.
//!
//! Needs an etcd reachable at `ETCD_ENDPOINTS` (default
//! `http://127.0.0.1:2379`); ignored by default.

use async_trait::async_trait;
use shardman_core::{NodeManager, ServiceSpec, ShardSpec};
use shardman_etcd::{connect, create_and_get, delete_key, put_json};
use shardman_server::{Server, ServerOptions};
use shardman_worker::{
    Container, ContainerOptions, ShardFactory, ShardServer, ShardServerOptions, ShardTask,
};
use std::sync::Arc;
use std::time::Duration;

const SM_SERVICE: &str = "sm.it";
const APP_SERVICE: &str = "app.it";

fn endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
        .split(',')
        .map(|s| s.to_string())
        .collect()
}

fn prefix() -> String {
    // Unique per run so repeated invocations do not see stale state.
    format!("/sm-it-{}", std::process::id())
}

struct NoopTask;

#[async_trait]
impl ShardTask for NoopTask {
    fn load(&self) -> String {
        "0".into()
    }

    async fn close(&self) {}
}

struct NoopFactory;

#[async_trait]
impl ShardFactory for NoopFactory {
    async fn create(&self, _spec: &ShardSpec) -> shardman_core::Result<Box<dyn ShardTask>> {
        Ok(Box::new(NoopTask))
    }
}

async fn start_worker(id: &str) -> (Arc<Container>, Arc<ShardServer>) {
    let container = Container::start(
        ContainerOptions::new()
            .id(id)
            .service(APP_SERVICE)
            .endpoints(endpoints())
            .etcd_prefix(prefix())
            .lease_ttl(5),
        Arc::new(NoopFactory),
    )
    .await
    .expect("worker container start");
    let server = ShardServer::start(
        ShardServerOptions::new().addr("127.0.0.1:0"),
        container.clone(),
    )
    .await
    .expect("worker shard server start");
    (container, server)
}

#[tokio::test]
#[ignore = "requires a local etcd"]
async fn cold_start_splits_shards_across_workers() {
    let server = Server::new(
        ServerOptions::new()
            .id("sm-a")
            .service(SM_SERVICE)
            .endpoints(endpoints())
            .addr("127.0.0.1:0")
            .etcd_prefix(prefix()),
    )
    .await
    .expect("sm server start");

    // Declare the managed service and three unplaced shards, the way the
    // admin API would.
    let client = connect(&endpoints()).await.expect("etcd connect");
    let nm = NodeManager::new(prefix(), SM_SERVICE);
    let spec = ServiceSpec::new(APP_SERVICE);
    create_and_get(
        &client,
        &nm.service_spec(APP_SERVICE),
        &serde_json::to_string(&spec).unwrap(),
        None,
    )
    .await
    .expect("service spec");
    for id in ["s1", "s2", "s3"] {
        let shard = ShardSpec {
            id: id.into(),
            service: APP_SERVICE.into(),
            task: "task-a".into(),
            ..Default::default()
        };
        put_json(&client, &nm.shard_spec(APP_SERVICE, id), &shard, None)
            .await
            .expect("shard spec");
    }

    let (c1, s1) = start_worker("c1").await;
    let (c2, s2) = start_worker("c2").await;

    // Leader settle + quiet period + apply latency.
    tokio::time::sleep(Duration::from_secs(12)).await;

    let owned1 = c1.shard_ids().await;
    let owned2 = c2.shard_ids().await;
    let mut all: Vec<String> = owned1.iter().chain(owned2.iter()).cloned().collect();
    all.sort();
    assert_eq!(all, vec!["s1", "s2", "s3"]);
    assert!(
        owned1.len().abs_diff(owned2.len()) <= 1,
        "uneven split: {owned1:?} / {owned2:?}"
    );

    // del-shard: removing the declaration reaps the running instance from
    // whichever worker still owns it.
    delete_key(&client, &nm.shard_spec(APP_SERVICE, "s3"))
        .await
        .expect("delete shard spec");
    tokio::time::sleep(Duration::from_secs(8)).await;

    let mut remaining: Vec<String> = c1.shard_ids().await;
    remaining.extend(c2.shard_ids().await);
    remaining.sort();
    assert_eq!(remaining, vec!["s1", "s2"]);

    s1.close().await;
    s2.close().await;
    server.close().await;
}
