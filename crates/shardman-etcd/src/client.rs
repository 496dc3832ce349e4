//! etcd connection establishment.

use backoff::{future::retry, ExponentialBackoff};
use etcd_client::Client;
use shardman_core::{Result, SmError};
use std::time::Duration;
use tracing::{debug, warn};

/// Connect to the etcd cluster with exponential backoff.
///
/// Transient connection failures are retried for up to a minute before the
/// error is surfaced as [`SmError::TransientKv`].
pub async fn connect(endpoints: &[String]) -> Result<Client> {
    if endpoints.is_empty() {
        return Err(SmError::Config("etcd endpoints required".into()));
    }

    let backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(Duration::from_secs(60)),
        ..Default::default()
    };

    let client = retry(backoff, || async {
        match Client::connect(endpoints, None).await {
            Ok(client) => {
                debug!("connected to etcd");
                Ok(client)
            }
            Err(e) => {
                warn!(error = %e, "etcd connection failed, retrying");
                Err(backoff::Error::transient(e))
            }
        }
    })
    .await
    .map_err(|e| SmError::TransientKv(format!("etcd connect: {e}")))?;

    Ok(client)
}
