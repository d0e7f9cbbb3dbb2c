mod settings;

pub use settings::{
    ClusterBackend, ClusterConfig, PoolConfig, ServerConfig, SessionConfig, Settings,
};
