//! Prefix reads and watches.

use etcd_client::{Client, EventType, GetOptions, WatchOptions, WatchStream, Watcher};
use shardman_core::{Result, SmError};
use tracing::warn;

/// One decoded watch event. All shardman values are UTF-8 JSON, so values
/// arrive as strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

/// Read every key under `prefix`, returning `(key, value)` pairs and the
/// store revision of the read. Watching from `revision + 1` observes exactly
/// the changes after this snapshot.
pub async fn get_prefix(client: &Client, prefix: &str) -> Result<(Vec<(String, String)>, i64)> {
    let mut client = client.clone();
    let resp = client
        .get(prefix, Some(GetOptions::new().with_prefix()))
        .await?;
    let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

    let mut entries = Vec::with_capacity(resp.kvs().len());
    for kv in resp.kvs() {
        let key = kv.key_str()?.to_string();
        let value = kv.value_str()?.to_string();
        entries.push((key, value));
    }
    Ok((entries, revision))
}

/// An open prefix watch. Dropping it cancels the server-side watcher.
pub struct PrefixWatcher {
    _watcher: Watcher,
    stream: WatchStream,
}

impl PrefixWatcher {
    /// The next batch of events.
    ///
    /// A cancelled or closed stream surfaces as [`SmError::TransientKv`];
    /// the consumer re-reads the prefix and re-watches from the new
    /// revision.
    pub async fn next(&mut self) -> Result<Vec<WatchEvent>> {
        let resp = self
            .stream
            .message()
            .await?
            .ok_or_else(|| SmError::TransientKv("watch stream ended".into()))?;
        if resp.canceled() {
            return Err(SmError::TransientKv("watch stream canceled".into()));
        }

        let mut events = Vec::with_capacity(resp.events().len());
        for event in resp.events() {
            let Some(kv) = event.kv() else {
                continue;
            };
            let key = kv.key_str()?.to_string();
            match event.event_type() {
                EventType::Put => match kv.value_str() {
                    Ok(value) => events.push(WatchEvent::Put {
                        key,
                        value: value.to_string(),
                    }),
                    Err(e) => {
                        warn!(key = %key, error = %e, "non-utf8 watch value dropped");
                    }
                },
                // A DELETE means the owner is gone; there is no separate
                // liveness signal to wait for.
                EventType::Delete => events.push(WatchEvent::Delete { key }),
            }
        }
        Ok(events)
    }
}

/// Open a watch over `prefix` starting after `revision` (pass the revision
/// returned by [`get_prefix`] to observe every change since that snapshot).
pub async fn watch_prefix(client: &Client, prefix: &str, revision: i64) -> Result<PrefixWatcher> {
    let mut client = client.clone();
    let mut options = WatchOptions::new().with_prefix();
    if revision > 0 {
        options = options.with_start_revision(revision + 1);
    }
    let (watcher, stream) = client.watch(prefix, Some(options)).await?;
    Ok(PrefixWatcher {
        _watcher: watcher,
        stream,
    })
}

/// Watch a single key (no prefix) starting after `revision`.
pub async fn watch_key(client: &Client, key: &str, revision: i64) -> Result<PrefixWatcher> {
    let mut client = client.clone();
    let mut options = WatchOptions::new();
    if revision > 0 {
        options = options.with_start_revision(revision + 1);
    }
    let (watcher, stream) = client.watch(key, Some(options)).await?;
    Ok(PrefixWatcher {
        _watcher: watcher,
        stream,
    })
}
