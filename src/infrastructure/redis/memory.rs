//! In-process cluster stand-in.
//!
//! Keeps the key space in a `DashMap` with Redis-like TTL semantics (expired
//! keys vanish on access, `SET` clears a TTL). Used for single-instance runs
//! and tests; the counters double as probes for write-avoidance checks.
//! Data is lost on restart and is not shared between processes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::commands::{ClusterCommands, CommandError};
use super::pool::{ConnectionFactory, PoolError};

struct MemoryEntry {
    value: Vec<u8>,
    ttl_seconds: Option<i64>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct MemoryShared {
    entries: DashMap<String, MemoryEntry>,
    writes: AtomicUsize,
    expires: AtomicUsize,
    deletes: AtomicUsize,
    connections: AtomicU64,
    failing_commands: AtomicUsize,
    failing_sets: AtomicUsize,
    failing_pings: AtomicUsize,
}

impl MemoryShared {
    fn live_entry(&self, key: &str) -> bool {
        match self.entries.get(key) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                self.entries.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn check_failure(&self) -> Result<(), CommandError> {
        if take_one(&self.failing_commands) {
            return Err(CommandError::Unavailable(
                "too many cluster redirections".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deadline `seconds` from now. Redis rejects an expire time it cannot
/// represent, and so does this.
fn deadline(seconds: i64) -> Result<Instant, CommandError> {
    u64::try_from(seconds)
        .ok()
        .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)))
        .ok_or_else(|| CommandError::Failed("invalid expire time".to_string()))
}

/// Decrement `counter` if positive; returns whether a unit was taken.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory key space acting as its own connection factory.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    shared: Arc<MemoryShared>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `SET` calls and successful reservations so far.
    pub fn write_count(&self) -> usize {
        self.shared.writes.load(Ordering::Acquire)
    }

    pub fn expire_count(&self) -> usize {
        self.shared.expires.load(Ordering::Acquire)
    }

    pub fn delete_count(&self) -> usize {
        self.shared.deletes.load(Ordering::Acquire)
    }

    pub fn connections_created(&self) -> u64 {
        self.shared.connections.load(Ordering::Acquire)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.live_entry(key)
    }

    /// TTL last applied to `key` with `EXPIRE`, if the key has one.
    pub fn ttl_seconds(&self, key: &str) -> Option<i64> {
        if !self.shared.live_entry(key) {
            return None;
        }
        self.shared.entries.get(key).and_then(|entry| entry.ttl_seconds)
    }

    /// Raw stored bytes.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        if !self.shared.live_entry(key) {
            return None;
        }
        self.shared.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Overwrite the stored bytes without touching the counters.
    pub fn put_raw(&self, key: &str, value: Vec<u8>) {
        self.shared.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                ttl_seconds: None,
                expires_at: None,
            },
        );
    }

    /// Make the next `count` data commands fail as if the cluster were unreachable.
    pub fn fail_commands(&self, count: usize) {
        self.shared.failing_commands.store(count, Ordering::Release);
    }

    /// Make the next `count` plain `SET` commands fail as if the cluster were
    /// unreachable. Other commands are unaffected.
    pub fn fail_sets(&self, count: usize) {
        self.shared.failing_sets.store(count, Ordering::Release);
    }

    /// Make the next `count` pings fail.
    pub fn fail_pings(&self, count: usize) {
        self.shared.failing_pings.store(count, Ordering::Release);
    }
}

/// One "client" of the in-memory cluster.
pub struct MemoryConnection {
    shared: Arc<MemoryShared>,
}

#[async_trait]
impl ConnectionFactory for MemoryCluster {
    type Connection = MemoryConnection;

    async fn create(&self) -> Result<Self::Connection, PoolError> {
        self.shared.connections.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryConnection {
            shared: self.shared.clone(),
        })
    }
}

#[async_trait]
impl ClusterCommands for MemoryConnection {
    async fn set_nx_ex(
        &mut self,
        key: &str,
        value: &[u8],
        seconds: i64,
    ) -> Result<bool, CommandError> {
        self.shared.check_failure()?;
        if seconds <= 0 {
            return Err(CommandError::Failed("invalid expire time".to_string()));
        }
        let expires_at = deadline(seconds)?;
        self.shared.live_entry(key);

        let mut written = false;
        self.shared.entries.entry(key.to_string()).or_insert_with(|| {
            written = true;
            MemoryEntry {
                value: value.to_vec(),
                ttl_seconds: Some(seconds),
                expires_at: Some(expires_at),
            }
        });
        if written {
            self.shared.writes.fetch_add(1, Ordering::AcqRel);
        }
        Ok(written)
    }

    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, CommandError> {
        self.shared.check_failure()?;
        if !self.shared.live_entry(key) {
            return Ok(None);
        }
        Ok(self.shared.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&mut self, key: &str, value: &[u8]) -> Result<(), CommandError> {
        self.shared.check_failure()?;
        if take_one(&self.shared.failing_sets) {
            return Err(CommandError::Unavailable("connection reset".to_string()));
        }
        self.shared.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                ttl_seconds: None,
                expires_at: None,
            },
        );
        self.shared.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn expire(&mut self, key: &str, seconds: i64) -> Result<bool, CommandError> {
        self.shared.check_failure()?;
        self.shared.expires.fetch_add(1, Ordering::AcqRel);
        if !self.shared.live_entry(key) {
            return Ok(false);
        }

        if seconds <= 0 {
            self.shared.entries.remove(key);
            return Ok(true);
        }

        let expires_at = deadline(seconds)?;
        if let Some(mut entry) = self.shared.entries.get_mut(key) {
            entry.ttl_seconds = Some(seconds);
            entry.expires_at = Some(expires_at);
        }
        Ok(true)
    }

    async fn del(&mut self, key: &str) -> Result<bool, CommandError> {
        self.shared.check_failure()?;
        self.shared.deletes.fetch_add(1, Ordering::AcqRel);
        let existed = self.shared.live_entry(key);
        self.shared.entries.remove(key);
        Ok(existed)
    }

    async fn keys(&mut self, pattern: &str) -> Result<Vec<String>, CommandError> {
        self.shared.check_failure()?;
        let mut keys: Vec<String> = self
            .shared
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired() && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&mut self) -> Result<(), CommandError> {
        if take_one(&self.shared.failing_pings) {
            return Err(CommandError::Unavailable("connection reset".to_string()));
        }
        Ok(())
    }
}

/// `KEYS`-style matching supporting `*` and `?`.
fn glob_match(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    let (mut p, mut k) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while k < key.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == key[k]) {
            p += 1;
            k += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, k));
            p += 1;
        } else if let Some((star_p, star_k)) = star {
            p = star_p + 1;
            k = star_k + 1;
            star = Some((star_p, star_k + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
