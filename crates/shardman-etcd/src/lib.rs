//! etcd access layer.
//!
//! Thin wrappers over `etcd_client` for the primitives the coordination
//! plane needs: connection with backoff, lease-bound sessions with
//! background keepalive, leader election, prefix watches, atomic
//! create-and-get, and keyed transactions.
//!
//! Every long-running call here can suspend indefinitely; callers bound the
//! wait by selecting against a [`ShutdownSignal`] subscription.

mod client;
mod election;
mod ops;
mod session;
mod shutdown;
mod watch;

pub use client::connect;
pub use election::{campaign, Leadership};
pub use ops::{
    create_and_get, delete_key, get_json, get_json_prefix, get_raw, put_json, txn_puts,
};
pub use session::Session;
pub use shutdown::ShutdownSignal;
pub use watch::{get_prefix, watch_key, watch_prefix, PrefixWatcher, WatchEvent};

pub use etcd_client::Client;
