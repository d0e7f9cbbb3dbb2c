//! Redis Cluster backed connection factory.

use async_trait::async_trait;
use redis::cluster::{ClusterClient, ClusterClientBuilder};
use redis::cluster_async::ClusterConnection;

use crate::config::ClusterConfig;

use super::commands::{ClusterCommands, CommandError};
use super::pool::{ConnectionFactory, PoolError};

/// Creates cluster-wide clients for the pool.
///
/// Each client discovers the slot map from the seed nodes, routes every key
/// to its owning shard and follows MOVED/ASK redirects, retrying up to
/// `max_attempts` times before surfacing an error.
#[derive(Clone)]
pub struct RedisClusterFactory {
    client: ClusterClient,
    nodes: Vec<String>,
}

impl RedisClusterFactory {
    pub fn new(config: &ClusterConfig) -> Result<Self, PoolError> {
        let mut builder = ClusterClientBuilder::new(config.node_urls())
            .retries(config.max_attempts)
            .connection_timeout(config.timeout())
            .response_timeout(config.socket_timeout());

        if let Some(password) = &config.password {
            builder = builder.password(password.clone());
        }

        let client = builder
            .build()
            .map_err(|e| PoolError::ConnectFailed(e.to_string()))?;

        Ok(Self {
            client,
            nodes: config.nodes.clone(),
        })
    }

    /// Seed nodes (for debugging).
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }
}

#[async_trait]
impl ConnectionFactory for RedisClusterFactory {
    type Connection = ClusterConnection;

    async fn create(&self) -> Result<Self::Connection, PoolError> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| PoolError::ConnectFailed(e.to_string()))
    }
}

#[async_trait]
impl ClusterCommands for ClusterConnection {
    async fn set_nx_ex(
        &mut self,
        key: &str,
        value: &[u8],
        seconds: i64,
    ) -> Result<bool, CommandError> {
        // Nil reply when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(seconds)
            .query_async(self)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, CommandError> {
        let data: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(self).await?;
        Ok(data)
    }

    async fn set(&mut self, key: &str, value: &[u8]) -> Result<(), CommandError> {
        let _: () = redis::cmd("SET").arg(key).arg(value).query_async(self).await?;
        Ok(())
    }

    async fn expire(&mut self, key: &str, seconds: i64) -> Result<bool, CommandError> {
        let applied: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(self)
            .await?;
        Ok(applied)
    }

    async fn del(&mut self, key: &str) -> Result<bool, CommandError> {
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(self).await?;
        Ok(removed > 0)
    }

    async fn keys(&mut self, pattern: &str) -> Result<Vec<String>, CommandError> {
        let keys: Vec<String> = redis::cmd("KEYS").arg(pattern).query_async(self).await?;
        Ok(keys)
    }

    async fn ping(&mut self) -> Result<(), CommandError> {
        let _: String = redis::cmd("PING").query_async(self).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_creation() {
        let config = ClusterConfig {
            nodes: vec!["127.0.0.1:7000".to_string(), "127.0.0.1:7001".to_string()],
            password: Some("secret".to_string()),
            ..Default::default()
        };

        let factory = RedisClusterFactory::new(&config);
        assert!(factory.is_ok());
        assert_eq!(factory.unwrap().nodes().len(), 2);
    }
}
