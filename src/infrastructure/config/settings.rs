use std::collections::BTreeSet;
use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::session::{SerializerKind, SessionPersistPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Which key space backs the session store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBackend {
    #[default]
    Redis,
    /// In-process key space, single instance only
    Memory,
}

/// Connection settings for the backing Redis Cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub backend: ClusterBackend,
    /// Seed nodes as `host:port` pairs
    #[serde(default = "default_nodes")]
    pub nodes: Vec<String>,
    /// Connect and request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Per-response (socket) timeout in milliseconds, defaults to `timeout_ms`
    #[serde(default)]
    pub socket_timeout_ms: Option<u64>,
    /// Retry budget for redirects and unreachable nodes
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub password: Option<String>,
}

/// Bounds, wait, eviction and validation policy of the connection pool.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default)]
    pub min_idle: usize,
    #[serde(default = "default_true")]
    pub block_when_exhausted: bool,
    /// Negative means wait indefinitely
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: i64,
    #[serde(default = "default_true")]
    pub lifo: bool,
    #[serde(default = "default_min_evictable_idle_time_ms")]
    pub min_evictable_idle_time_ms: u64,
    /// Non-positive disables the evictor
    #[serde(default = "default_time_between_eviction_runs_ms")]
    pub time_between_eviction_runs_ms: i64,
    #[serde(default = "default_num_tests_per_eviction_run")]
    pub num_tests_per_eviction_run: usize,
    #[serde(default)]
    pub test_on_create: bool,
    #[serde(default)]
    pub test_on_borrow: bool,
    #[serde(default)]
    pub test_on_return: bool,
    #[serde(default = "default_true")]
    pub test_while_idle: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Time-to-live applied to every session key on save
    #[serde(default = "default_max_inactive_interval")]
    pub max_inactive_interval_seconds: i64,
    /// Affinity tag appended to generated ids as `.{node_route}`
    #[serde(default)]
    pub node_route: Option<String>,
    #[serde(default)]
    pub serializer: SerializerKind,
    /// Comma separated list of persist policy names
    #[serde(default = "default_persist_policies")]
    pub persist_policies: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_nodes() -> Vec<String> {
    vec!["127.0.0.1:7000".to_string()]
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_total() -> usize {
    8
}

fn default_max_idle() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_max_wait_ms() -> i64 {
    -1
}

fn default_min_evictable_idle_time_ms() -> u64 {
    60_000
}

fn default_time_between_eviction_runs_ms() -> i64 {
    30_000
}

fn default_num_tests_per_eviction_run() -> usize {
    3
}

fn default_max_inactive_interval() -> i64 {
    1800 // 30 minutes
}

fn default_persist_policies() -> String {
    "DEFAULT".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .set_default("session.max_inactive_interval_seconds", default_max_inactive_interval())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // SESSIONS__CLUSTER__NODES=10.0.0.1:7000,10.0.0.2:7000
            // SESSIONS__POOL__MAX_TOTAL=16, SESSIONS__SESSION__NODE_ROUTE=web1, ...
            .add_source(
                Environment::with_prefix("SESSIONS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cluster.nodes"),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject configurations the store cannot operate under.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cluster.validate()?;
        self.pool.validate()?;
        self.session.validate()?;
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ClusterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == ClusterBackend::Memory {
            return Ok(());
        }
        if self.nodes.is_empty() {
            return Err(ConfigError::Message(
                "cluster.nodes must name at least one host:port".to_string(),
            ));
        }
        for node in &self.nodes {
            let valid = node
                .trim()
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::Message(format!(
                    "invalid cluster node '{}', expected host:port",
                    node
                )));
            }
        }
        Ok(())
    }

    /// Node list as `redis://` URLs.
    pub fn node_urls(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|node| format!("redis://{}", node.trim()))
            .collect()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms.unwrap_or(self.timeout_ms))
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_total == 0 {
            return Err(ConfigError::Message("pool.max_total must be at least 1".to_string()));
        }
        if self.min_idle > self.max_idle {
            return Err(ConfigError::Message(format!(
                "pool.min_idle ({}) exceeds pool.max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        Ok(())
    }

    /// How long an exhausted acquire waits, `None` meaning no bound.
    pub fn max_wait(&self) -> Option<Duration> {
        u64::try_from(self.max_wait_ms).ok().map(Duration::from_millis)
    }

    pub fn min_evictable_idle_time(&self) -> Duration {
        Duration::from_millis(self.min_evictable_idle_time_ms)
    }

    /// Interval of the background eviction run, `None` when disabled.
    pub fn eviction_interval(&self) -> Option<Duration> {
        u64::try_from(self.time_between_eviction_runs_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_inactive_interval_seconds <= 0 {
            return Err(ConfigError::Message(
                "session.max_inactive_interval_seconds must be positive".to_string(),
            ));
        }
        self.policies()?;
        Ok(())
    }

    /// Parse the configured persist policies. `DEFAULT` is always present.
    pub fn policies(&self) -> Result<BTreeSet<SessionPersistPolicy>, ConfigError> {
        let mut policies = BTreeSet::from([SessionPersistPolicy::Default]);
        for name in self.persist_policies.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let policy = name
                .parse::<SessionPersistPolicy>()
                .map_err(ConfigError::Message)?;
            policies.insert(policy);
        }
        Ok(policies)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::default(),
            nodes: default_nodes(),
            timeout_ms: default_timeout_ms(),
            socket_timeout_ms: None,
            max_attempts: default_max_attempts(),
            password: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: default_max_total(),
            max_idle: default_max_idle(),
            min_idle: 0,
            block_when_exhausted: true,
            max_wait_ms: default_max_wait_ms(),
            lifo: true,
            min_evictable_idle_time_ms: default_min_evictable_idle_time_ms(),
            time_between_eviction_runs_ms: default_time_between_eviction_runs_ms(),
            num_tests_per_eviction_run: default_num_tests_per_eviction_run(),
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_inactive_interval_seconds: default_max_inactive_interval(),
            node_route: None,
            serializer: SerializerKind::default(),
            persist_policies: default_persist_policies(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cluster: ClusterConfig::default(),
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
        }
    }
}
