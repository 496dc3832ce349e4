//! Shard manager server binary.

use anyhow::Context;
use shardman_server::{Server, ServerOptions};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let id = std::env::var("SM_ID")
        .unwrap_or_else(|_| format!("shardman-{}", uuid::Uuid::new_v4()));
    let service = std::env::var("SM_SERVICE").unwrap_or_else(|_| "shardman".to_string());
    let endpoints = std::env::var("ETCD_ENDPOINTS")
        .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect::<Vec<_>>();
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8888".to_string());
    let etcd_prefix =
        std::env::var("ETCD_PREFIX").unwrap_or_else(|_| shardman_core::DEFAULT_ETCD_PREFIX.into());

    info!(id = %id, service = %service, addr = %addr, "starting shardman server");

    let server = Server::new(
        ServerOptions::new()
            .id(id)
            .service(service)
            .endpoints(endpoints)
            .addr(addr)
            .etcd_prefix(etcd_prefix),
    )
    .await
    .context("server start failed")?;

    tokio::signal::ctrl_c()
        .await
        .context("signal handler failed")?;
    info!("termination signal received");
    server.close().await;
    Ok(())
}
