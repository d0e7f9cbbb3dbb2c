//! Key-value commands the session store issues against the cluster.

use async_trait::async_trait;
use redis::RedisError;

/// Outcome of a failed cluster command.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    /// Retry budget exhausted, node unreachable or topology in flux.
    /// The connection that produced it must not go back to the pool.
    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    /// The cluster answered with an error reply
    #[error("Command failed: {0}")]
    Failed(String),
}

impl CommandError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CommandError::Unavailable(_))
    }
}

impl From<RedisError> for CommandError {
    fn from(err: RedisError) -> Self {
        // Redirects (MOVED/ASK), TRYAGAIN and CLUSTERDOWN only reach us once
        // the client has spent its retry budget.
        if err.is_cluster_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_io_error()
            || err.is_timeout()
        {
            CommandError::Unavailable(err.to_string())
        } else {
            CommandError::Failed(err.to_string())
        }
    }
}

/// Wire operations against a sharded key-value cluster.
///
/// Implementations route each key to its owning shard themselves; callers
/// never see individual nodes.
#[async_trait]
pub trait ClusterCommands: Send {
    /// `SET key value NX EX seconds`: returns true when the key was written.
    async fn set_nx_ex(
        &mut self,
        key: &str,
        value: &[u8],
        seconds: i64,
    ) -> Result<bool, CommandError>;

    /// `GET`
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, CommandError>;

    /// `SET`, which also drops any TTL the key had.
    async fn set(&mut self, key: &str, value: &[u8]) -> Result<(), CommandError>;

    /// `EXPIRE`: returns false when the key does not exist.
    async fn expire(&mut self, key: &str, seconds: i64) -> Result<bool, CommandError>;

    /// `DEL`: returns true when a key was removed.
    async fn del(&mut self, key: &str) -> Result<bool, CommandError>;

    /// `KEYS`, administrative only.
    async fn keys(&mut self, pattern: &str) -> Result<Vec<String>, CommandError>;

    async fn ping(&mut self) -> Result<(), CommandError>;
}
