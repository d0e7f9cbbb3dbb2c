//! Redis Cluster access layer
//!
//! # Modules
//!
//! - `commands`: the key-value operations the session store needs
//! - `pool`: bounded, validated pool of cluster clients
//! - `cluster`: Redis Cluster client factory
//! - `memory`: in-process cluster stand-in for single-node runs and tests
//! - `evictor`: timer-driven idle eviction

mod cluster;
mod commands;
mod evictor;
mod memory;
pub mod pool;

pub use cluster::RedisClusterFactory;
pub use commands::{ClusterCommands, CommandError};
pub use evictor::EvictionTask;
pub use memory::{MemoryCluster, MemoryConnection};
pub use pool::{
    ClusterPool, ConnectionFactory, EvictionRun, PoolError, PoolStats, PooledConnection,
};
