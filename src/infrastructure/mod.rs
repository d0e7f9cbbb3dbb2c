//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `config`: Application configuration and settings
//! - `error`: Unified error types
//! - `metrics`: Prometheus metrics helpers
//! - `redis`: Redis Cluster commands, connection pool and eviction

pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;
