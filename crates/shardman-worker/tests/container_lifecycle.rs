//! Worker container lifecycle against a live etcd.
//!
//! These tests need an etcd reachable at `ETCD_ENDPOINTS` (default
//! `http://127.0.0.1:2379`) and are ignored by default.

use async_trait::async_trait;
use shardman_core::{ShardSpec, SmError};
use shardman_etcd::get_json;
use shardman_worker::{Container, ContainerOptions, ShardFactory, ShardTask};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
        .split(',')
        .map(|s| s.to_string())
        .collect()
}

struct NoopTask;

#[async_trait]
impl ShardTask for NoopTask {
    fn load(&self) -> String {
        "0".into()
    }

    async fn close(&self) {}
}

struct CountingFactory {
    created: AtomicUsize,
}

#[async_trait]
impl ShardFactory for CountingFactory {
    async fn create(&self, _spec: &ShardSpec) -> shardman_core::Result<Box<dyn ShardTask>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(NoopTask))
    }
}

fn spec(id: &str, task: &str) -> ShardSpec {
    ShardSpec {
        id: id.into(),
        service: "it.worker".into(),
        task: task.into(),
        ..Default::default()
    }
}

async fn start_container(id: &str) -> (Arc<Container>, Arc<CountingFactory>) {
    let factory = Arc::new(CountingFactory {
        created: AtomicUsize::new(0),
    });
    let container = Container::start(
        ContainerOptions::new()
            .id(id)
            .service("it.worker")
            .endpoints(endpoints())
            .etcd_prefix("/sm-it")
            .lease_ttl(5),
        factory.clone(),
    )
    .await
    .expect("container start");
    (container, factory)
}

#[tokio::test]
#[ignore = "requires a local etcd"]
async fn add_is_idempotent_and_task_change_replaces() {
    let (container, factory) = start_container("it-c1").await;

    container.add(spec("s1", "a")).await.unwrap();
    assert!(matches!(
        container.add(spec("s1", "a")).await,
        Err(SmError::Exist)
    ));
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);

    // Changed task closes the old instance and starts a new one in place.
    container.add(spec("s1", "b")).await.unwrap();
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    assert_eq!(container.shard_ids().await, vec!["s1".to_string()]);

    container.close().await;
}

#[tokio::test]
#[ignore = "requires a local etcd"]
async fn drop_twice_returns_not_exist() {
    let (container, _) = start_container("it-c2").await;

    container.add(spec("s2", "a")).await.unwrap();
    container.drop_shard("s2").await.unwrap();
    assert!(matches!(
        container.drop_shard("s2").await,
        Err(SmError::NotExist)
    ));

    container.close().await;
}

#[tokio::test]
#[ignore = "requires a local etcd"]
async fn close_rejects_further_operations_and_clears_heartbeats() {
    let (container, _) = start_container("it-c3").await;
    let client = container.client().clone();
    let hb_key = container
        .node_manager()
        .shard_hb("it.worker", "s3");

    container.add(spec("s3", "a")).await.unwrap();
    assert!(
        get_json::<shardman_core::ShardHeartbeat>(&client, &hb_key)
            .await
            .unwrap()
            .is_some()
    );

    container.close().await;
    // Close is idempotent.
    container.close().await;

    assert!(matches!(
        container.add(spec("s4", "a")).await,
        Err(SmError::Closing)
    ));
    assert!(matches!(
        container.drop_shard("s3").await,
        Err(SmError::Closing)
    ));
    assert!(matches!(
        container.load("s3").await,
        Err(SmError::Closing)
    ));

    // Shard heartbeats are deleted eagerly on close, not left to TTL.
    assert!(
        get_json::<shardman_core::ShardHeartbeat>(&client, &hb_key)
            .await
            .unwrap()
            .is_none()
    );
}
