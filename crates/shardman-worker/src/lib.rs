//! Embedded shard-server library.
//!
//! An application process links this crate to become a shardman worker
//! container: it heartbeats its liveness into etcd, owns the shards the
//! leader assigns to it, and obeys move commands published on its service's
//! task key.
//!
//! The application supplies a [`ShardFactory`] that turns a shard spec into
//! running work; everything else (session, heartbeats, the task watcher, the
//! admin HTTP surface) is handled here.

mod container;
mod server;
mod shard;

pub use container::{Container, ContainerOptions};
pub use server::{ShardServer, ShardServerOptions};
pub use shard::{Shard, ShardFactory, ShardTask};
