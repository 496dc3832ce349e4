//! Lease-bound session with background keepalive.

use crate::ShutdownSignal;
use etcd_client::Client;
use shardman_core::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

/// A session is one lease on the KV store, refreshed in the background.
///
/// Every lease-bound key of the owning process (heartbeats, election key)
/// hangs off this lease, so the session must outlive anything it leases.
/// When keepalive fails the session's done signal fires and observers see
/// all bound keys vanish once the TTL lapses.
#[derive(Clone)]
pub struct Session {
    client: Client,
    lease_id: i64,
    ttl: i64,
    done: ShutdownSignal,
    closed: Arc<AtomicBool>,
}

impl Session {
    /// Grant a lease with the given TTL (seconds) and start the keepalive
    /// loop at ~TTL/5.
    pub async fn new(client: Client, ttl: i64) -> Result<Self> {
        let mut lease_client = client.clone();
        let resp = lease_client.lease_grant(ttl, None).await?;
        let lease_id = resp.id();
        debug!(lease_id, ttl, "lease granted");

        let session = Self {
            client,
            lease_id,
            ttl,
            done: ShutdownSignal::new(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        session.spawn_keepalive();
        Ok(session)
    }

    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    /// Fires when the session ends, actively or through keepalive failure.
    pub fn done(&self) -> ShutdownSignal {
        self.done.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_triggered()
    }

    /// End the session and revoke the lease so bound keys are deleted
    /// immediately instead of lingering until TTL expiry. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done.trigger();

        let mut client = self.client.clone();
        match client.lease_revoke(self.lease_id).await {
            Ok(_) => debug!(lease_id = self.lease_id, "lease revoked"),
            Err(e) => {
                // The lease still expires on its own; observers just wait
                // out the TTL.
                debug!(lease_id = self.lease_id, error = %e, "lease revoke failed");
            }
        }
    }

    fn spawn_keepalive(&self) {
        let client = self.client.clone();
        let lease_id = self.lease_id;
        let done = self.done.clone();
        let interval = Duration::from_secs((self.ttl / 5).max(1) as u64);

        tokio::spawn(async move {
            let mut client = client;
            let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(lease_id, error = %e, "keepalive stream open failed");
                    done.trigger();
                    return;
                }
            };

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick

            loop {
                tokio::select! {
                    _ = done.wait() => {
                        trace!(lease_id, "keepalive loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                if let Err(e) = keeper.keep_alive().await {
                    error!(lease_id, error = %e, "keepalive send failed");
                    done.trigger();
                    return;
                }

                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        trace!(lease_id, ttl = resp.ttl(), "keepalive ok");
                    }
                    Ok(Some(resp)) => {
                        // TTL of zero means the lease already expired
                        // server-side.
                        error!(lease_id, ttl = resp.ttl(), "lease expired");
                        done.trigger();
                        return;
                    }
                    Ok(None) => {
                        error!(lease_id, "keepalive stream closed");
                        done.trigger();
                        return;
                    }
                    Err(e) => {
                        error!(lease_id, error = %e, "keepalive failed");
                        done.trigger();
                        return;
                    }
                }
            }
        });
    }
}
