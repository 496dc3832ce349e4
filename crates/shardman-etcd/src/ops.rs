//! Keyed reads, writes, and mini-transactions.

use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp, TxnOpResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardman_core::{Result, SmError};
use tracing::warn;

/// Atomically create `key` with `value`, or fetch the current value if the
/// key already exists. Returns `(value, created)`.
///
/// This is the idempotent bootstrap primitive: callers treat `created ==
/// false` as success and use the returned value as authoritative.
pub async fn create_and_get(
    client: &Client,
    key: &str,
    value: &str,
    lease: Option<i64>,
) -> Result<(String, bool)> {
    let mut client = client.clone();
    let put_options = lease.map(|id| PutOptions::new().with_lease(id));
    let txn = Txn::new()
        .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
        .and_then(vec![TxnOp::put(key, value, put_options)])
        .or_else(vec![TxnOp::get(key, None)]);

    let resp = client.txn(txn).await?;
    if resp.succeeded() {
        return Ok((value.to_string(), true));
    }

    for op in resp.op_responses() {
        if let TxnOpResponse::Get(get) = op {
            if let Some(kv) = get.kvs().first() {
                return Ok((kv.value_str()?.to_string(), false));
            }
        }
    }
    // The key was deleted between the compare and the get; surface it as
    // retryable.
    Err(SmError::TransientKv(format!(
        "create_and_get raced a delete on {key}"
    )))
}

/// Serialize `value` as JSON and put it, optionally bound to a lease.
pub async fn put_json<T: Serialize>(
    client: &Client,
    key: &str,
    value: &T,
    lease: Option<i64>,
) -> Result<()> {
    let mut client = client.clone();
    let json = serde_json::to_string(value)?;
    let options = lease.map(|id| PutOptions::new().with_lease(id));
    client.put(key, json, options).await?;
    Ok(())
}

/// Fetch and decode one key. `Ok(None)` when absent.
pub async fn get_json<T: DeserializeOwned>(client: &Client, key: &str) -> Result<Option<T>> {
    let mut client = client.clone();
    let resp = client.get(key, None).await?;
    let Some(kv) = resp.kvs().first() else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(kv.value_str()?)?))
}

/// Fetch and decode every key under `prefix`, keyed by the suffix after the
/// prefix. Undecodable values are logged and skipped rather than failing the
/// whole read. Also returns the store revision of the read.
pub async fn get_json_prefix<T: DeserializeOwned>(
    client: &Client,
    prefix: &str,
) -> Result<(Vec<(String, T)>, i64)> {
    let (entries, revision) = crate::get_prefix(client, prefix).await?;
    let mut decoded = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let suffix = key.strip_prefix(prefix).unwrap_or(&key).to_string();
        match serde_json::from_str(&value) {
            Ok(v) => decoded.push((suffix, v)),
            Err(e) => {
                warn!(key = %key, error = %e, "undecodable value skipped");
            }
        }
    }
    Ok((decoded, revision))
}

/// Fetch one key as a raw string plus the store revision of the read.
pub async fn get_raw(client: &Client, key: &str) -> Result<(Option<String>, i64)> {
    let mut client = client.clone();
    let resp = client.get(key, None).await?;
    let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
    let value = match resp.kvs().first() {
        Some(kv) => Some(kv.value_str()?.to_string()),
        None => None,
    };
    Ok((value, revision))
}

pub async fn delete_key(client: &Client, key: &str) -> Result<()> {
    let mut client = client.clone();
    client.delete(key, None).await?;
    Ok(())
}

/// Apply several puts in one transaction. Observers see all of them or none,
/// which is what lets a rebalance publish the move list and the updated
/// shard placements as a single atomic write.
pub async fn txn_puts(client: &Client, puts: Vec<(String, String)>) -> Result<()> {
    if puts.is_empty() {
        return Ok(());
    }
    let mut client = client.clone();
    let ops: Vec<TxnOp> = puts
        .into_iter()
        .map(|(key, value)| TxnOp::put(key, value, None))
        .collect();
    client.txn(Txn::new().and_then(ops)).await?;
    Ok(())
}
