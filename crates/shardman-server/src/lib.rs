//! Shard manager server.
//!
//! A leader-elected coordinator that assigns the shards of managed services
//! onto their worker containers. Each replica campaigns on the SM leader
//! key; the winner runs one control shard per managed service, planning
//! with the pure assignment engine and publishing move commands the worker
//! library consumes.

pub mod api;
pub mod control;
pub mod engine;
pub mod replica;
pub mod server;

pub use replica::{ReplicaState, SmReplica};
pub use server::{Server, ServerOptions};
