//! Leader election bound to a session lease.

use crate::Session;
use etcd_client::{Client, LeaderKey, ResignOptions};
use shardman_core::Result;
use tracing::{debug, info};

/// Proof of won leadership.
///
/// The underlying election key is bound to the session lease: losing the
/// session loses leadership without an explicit resign, and campaigners
/// queued behind the holder are woken in campaign order.
pub struct Leadership {
    client: Client,
    leader_key: LeaderKey,
}

impl Leadership {
    /// The etcd key this leader holds.
    pub fn key(&self) -> &[u8] {
        self.leader_key.key()
    }

    /// Step down explicitly so the next campaigner wins immediately instead
    /// of waiting out the lease TTL.
    pub async fn resign(self) -> Result<()> {
        let mut client = self.client;
        client
            .resign(Some(ResignOptions::new().with_leader(self.leader_key)))
            .await?;
        debug!("leadership resigned");
        Ok(())
    }
}

/// Campaign on the election key, blocking until this session wins.
///
/// The call suspends for as long as another leader holds the key; callers
/// bound the wait by selecting against a shutdown signal, which aborts the
/// campaign when the future is dropped.
pub async fn campaign(
    client: &Client,
    session: &Session,
    key: &str,
    value: &str,
) -> Result<Leadership> {
    let mut client = client.clone();
    let mut resp = client
        .campaign(key, value, session.lease_id())
        .await?;
    let leader_key = resp
        .take_leader()
        .ok_or_else(|| shardman_core::SmError::TransientKv("campaign returned no leader key".into()))?;
    info!(key = %key, lease_id = session.lease_id(), "campaign won");
    Ok(Leadership {
        client,
        leader_key,
    })
}
