//! Bounded pool of cluster clients.
//!
//! Every pooled handle is a client bound to the whole cluster (it routes
//! keys to shards and follows redirects itself), so the pool only bounds how
//! many of them exist and recycles them between requests.
//!
//! A handle is idle (in the queue), leased (owned by one `PooledConnection`)
//! or under test by the evictor. Leased and tested handles each hold one
//! semaphore permit, so `live <= max_total` holds without a global lock.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::metrics::PoolMetrics;

use super::commands::ClusterCommands;
use super::evictor::EvictionTask;

/// Error type for pool operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    /// Wait timeout elapsed (or fail-fast policy) with every handle leased
    #[error("Connection pool exhausted")]
    Exhausted,

    /// A new cluster client could not be created or failed validation
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection pool is closed")]
    Closed,
}

/// Creates and validates the clients held by a [`ClusterPool`].
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: ClusterCommands + Send + 'static;

    async fn create(&self) -> Result<Self::Connection, PoolError>;

    /// Liveness probe used by the test-on-* policies.
    async fn validate(&self, conn: &mut Self::Connection) -> bool {
        conn.ping().await.is_ok()
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub leased: usize,
    pub max_total: usize,
}

/// Counters of one eviction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionRun {
    pub evicted: usize,
    pub failed_validation: usize,
    pub created: usize,
}

struct IdleEntry<C> {
    id: u64,
    conn: C,
    idle_since: Instant,
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleEntry<F::Connection>>>,
    permits: Arc<Semaphore>,
    live: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

/// Shared handle to the pool; clones refer to the same pool.
pub struct ClusterPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ClusterPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A leased connection. Dropping it returns the handle to the idle set,
/// unless it was marked broken, in which case it is destroyed.
pub struct PooledConnection<F: ConnectionFactory> {
    id: u64,
    conn: Option<F::Connection>,
    broken: bool,
    pool: Arc<PoolInner<F>>,
    // Declared last: released only after the handle is back in the idle set.
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flag the handle so it is discarded instead of reused.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(self.id, conn, self.broken);
        }
    }
}

impl<F: ConnectionFactory> ClusterPool<F> {
    /// Create an empty pool. Connections are created lazily on acquire.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let permits = Arc::new(Semaphore::new(config.max_total));

        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                idle: Mutex::new(VecDeque::new()),
                permits,
                live: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner<F>>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<PoolInner<F>> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Lease a connection, waiting up to `max_wait` when every handle is in use.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        let permit = self.acquire_permit().await?;

        loop {
            let (id, mut conn, fresh) = match self.inner.pop_idle() {
                Some(entry) => (entry.id, entry.conn, false),
                None => {
                    let (id, conn) = self.inner.create().await?;
                    (id, conn, true)
                }
            };

            if self.inner.config.test_on_borrow && !self.inner.factory.validate(&mut conn).await {
                self.inner.destroy(id, conn, "failed validation on borrow");
                if fresh {
                    return Err(PoolError::ConnectFailed(format!(
                        "connection {} failed validation",
                        id
                    )));
                }
                continue;
            }

            PoolMetrics::record_acquired();
            return Ok(PooledConnection {
                id,
                conn: Some(conn),
                broken: false,
                pool: self.inner.clone(),
                _permit: permit,
            });
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        let permits = self.inner.permits.clone();

        if !self.inner.config.block_when_exhausted {
            return permits.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::Closed => PoolError::Closed,
                TryAcquireError::NoPermits => {
                    PoolMetrics::record_exhausted();
                    PoolError::Exhausted
                }
            });
        }

        let acquired = match self.inner.config.max_wait() {
            Some(wait) => match tokio::time::timeout(wait, permits.acquire_owned()).await {
                Ok(result) => result,
                Err(_) => {
                    PoolMetrics::record_exhausted();
                    tracing::warn!(
                        max_wait_ms = wait.as_millis() as u64,
                        max_total = self.inner.config.max_total,
                        "Timed out waiting for a cluster connection"
                    );
                    return Err(PoolError::Exhausted);
                }
            },
            None => permits.acquire_owned().await,
        };

        acquired.map_err(|_| PoolError::Closed)
    }

    /// Return a leased connection, validating it first under `test_on_return`.
    pub async fn release(&self, mut conn: PooledConnection<F>) {
        if self.inner.config.test_on_return && !conn.broken {
            let valid = match conn.conn.as_mut() {
                Some(c) => self.inner.factory.validate(c).await,
                None => false,
            };
            if !valid {
                conn.mark_broken();
            }
        }
        drop(conn);
    }

    /// Discard a leased connection without returning it to the idle set.
    /// No replacement is created until the next acquire needs one.
    pub fn invalidate(&self, mut conn: PooledConnection<F>) {
        conn.mark_broken();
        drop(conn);
    }

    /// Start the background evictor if eviction is enabled. Needs a tokio runtime.
    pub fn spawn_evictor(&self) -> bool {
        let Some(task) = self.evictor() else {
            return false;
        };
        tokio::spawn(task.run());
        true
    }

    /// Eviction task bound to this pool, `None` when eviction is disabled.
    pub(crate) fn evictor(&self) -> Option<EvictionTask<F>> {
        let interval = self.inner.config.eviction_interval()?;
        Some(EvictionTask::new(
            self.downgrade(),
            interval,
            self.inner.shutdown.subscribe(),
        ))
    }

    /// Run one eviction pass: drop handles idle beyond the threshold (never
    /// below `min_idle`), test a few idle handles, then top up to `min_idle`.
    pub async fn evict(&self) -> EvictionRun {
        let mut run = EvictionRun::default();
        if self.is_closed() {
            return run;
        }

        let threshold = self.inner.config.min_evictable_idle_time();
        let expired = {
            let mut idle = self.inner.lock_idle();
            let mut budget = idle.len().saturating_sub(self.inner.config.min_idle);
            let mut kept = VecDeque::with_capacity(idle.len());
            let mut expired = Vec::new();
            for entry in idle.drain(..) {
                if budget > 0 && entry.idle_since.elapsed() >= threshold {
                    budget -= 1;
                    expired.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *idle = kept;
            expired
        };
        run.evicted = expired.len();
        for entry in expired {
            self.inner.destroy(entry.id, entry.conn, "idle time exceeded");
        }

        if self.inner.config.test_while_idle {
            run.failed_validation = self.test_idle().await;
        }

        run.created = self.ensure_min_idle().await;
        PoolMetrics::set_idle(self.inner.idle_len());
        run
    }

    /// Validate up to `num_tests_per_eviction_run` of the least recently used
    /// idle handles. Returns how many were destroyed.
    async fn test_idle(&self) -> usize {
        let lifo = self.inner.config.lifo;
        let mut batch = Vec::new();
        {
            let mut idle = self.inner.lock_idle();
            while batch.len() < self.inner.config.num_tests_per_eviction_run {
                let Ok(permit) = self.inner.permits.clone().try_acquire_owned() else {
                    break;
                };
                let next = if lifo { idle.pop_back() } else { idle.pop_front() };
                let Some(entry) = next else {
                    break;
                };
                batch.push((entry, permit));
            }
        }

        if batch.is_empty() {
            return 0;
        }

        let factory = &self.inner.factory;
        let results = join_all(batch.iter_mut().map(|(entry, _)| factory.validate(&mut entry.conn))).await;

        let mut failed = 0;
        for ((entry, permit), valid) in batch.into_iter().zip(results) {
            if valid {
                self.inner.return_tested(entry);
            } else {
                failed += 1;
                self.inner.destroy(entry.id, entry.conn, "failed validation while idle");
            }
            drop(permit);
        }
        failed
    }

    /// Create connections until the idle set holds `min_idle`, bounded by free permits.
    async fn ensure_min_idle(&self) -> usize {
        let mut created = 0;
        while !self.is_closed() && self.inner.idle_len() < self.inner.config.min_idle {
            let Ok(permit) = self.inner.permits.clone().try_acquire_owned() else {
                break;
            };
            match self.inner.create().await {
                Ok((id, conn)) => {
                    self.inner.put_back(id, conn, false);
                    created += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create idle connection");
                    break;
                }
            }
            drop(permit);
        }
        created
    }

    /// Drain and terminate every handle. Idempotent; pending and later
    /// acquires fail with [`PoolError::Closed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.permits.close();
        let _ = self.inner.shutdown.send(());

        let drained: Vec<_> = self.inner.lock_idle().drain(..).collect();
        let count = drained.len();
        for entry in drained {
            self.inner.destroy(entry.id, entry.conn, "pool closed");
        }

        PoolMetrics::set_idle(0);
        tracing::info!(closed_idle = count, "Cluster connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let max_total = self.inner.config.max_total;
        PoolStats {
            live: self.inner.live.load(Ordering::Acquire),
            idle: self.inner.idle_len(),
            leased: max_total.saturating_sub(self.inner.permits.available_permits()),
            max_total,
        }
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleEntry<F::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn idle_len(&self) -> usize {
        self.lock_idle().len()
    }

    fn pop_idle(&self) -> Option<IdleEntry<F::Connection>> {
        let entry = self.lock_idle().pop_front();
        if entry.is_some() {
            PoolMetrics::set_idle(self.idle_len());
        }
        entry
    }

    async fn create(&self) -> Result<(u64, F::Connection), PoolError> {
        let mut conn = self.factory.create().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to create cluster connection");
            e
        })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        PoolMetrics::record_created();

        if self.config.test_on_create && !self.factory.validate(&mut conn).await {
            self.destroy(id, conn, "failed validation on create");
            return Err(PoolError::ConnectFailed(format!(
                "connection {} failed validation",
                id
            )));
        }

        tracing::debug!(connection_id = id, live = live, "Created cluster connection");
        Ok((id, conn))
    }

    fn put_back(&self, id: u64, conn: F::Connection, broken: bool) {
        if broken {
            self.destroy(id, conn, "invalidated");
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            self.destroy(id, conn, "pool closed");
            return;
        }

        let mut idle = self.lock_idle();
        if idle.len() >= self.config.max_idle {
            drop(idle);
            self.destroy(id, conn, "max idle reached");
            return;
        }

        let entry = IdleEntry {
            id,
            conn,
            idle_since: Instant::now(),
        };
        if self.config.lifo {
            idle.push_front(entry);
        } else {
            idle.push_back(entry);
        }
        PoolMetrics::set_idle(idle.len());
    }

    /// Put a handle that passed an idle test back at the most recently used
    /// end, without resetting its idle clock, so the next run tests others.
    fn return_tested(&self, entry: IdleEntry<F::Connection>) {
        if self.closed.load(Ordering::Acquire) {
            self.destroy(entry.id, entry.conn, "pool closed");
            return;
        }
        let mut idle = self.lock_idle();
        if self.config.lifo {
            idle.push_front(entry);
        } else {
            idle.push_back(entry);
        }
    }

    fn destroy(&self, id: u64, conn: F::Connection, reason: &'static str) {
        drop(conn);
        let live = self.live.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        PoolMetrics::record_destroyed();
        tracing::debug!(connection_id = id, live = live, reason = reason, "Destroyed cluster connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::MemoryCluster;
    use std::time::Duration;
    use tokio_test::assert_ready_ok;

    fn test_config(max_total: usize) -> PoolConfig {
        PoolConfig {
            max_total,
            max_idle: max_total,
            max_wait_ms: 100,
            time_between_eviction_runs_ms: -1,
            test_while_idle: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let cluster = MemoryCluster::new();
        let pool = ClusterPool::new(cluster.clone(), test_config(2));

        let first = pool.acquire().await.unwrap();
        let first_id = first.id();
        pool.release(first).await;

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(cluster.connections_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_acquire_resumes_on_release() {
        let pool = ClusterPool::new(MemoryCluster::new(), test_config(1));

        let held = pool.acquire().await.unwrap();
        let mut waiting = tokio_test::task::spawn(pool.acquire());
        assert!(waiting.poll().is_pending());

        drop(held);
        assert!(waiting.is_woken());
        let conn = assert_ready_ok!(waiting.poll());
        assert_eq!(pool.stats().live, 1);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = ClusterPool::new(MemoryCluster::new(), test_config(1));

        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::Exhausted)));
    }

    #[tokio::test]
    async fn test_fail_fast_when_not_blocking() {
        let config = PoolConfig {
            block_when_exhausted: false,
            ..test_config(1)
        };
        let pool = ClusterPool::new(MemoryCluster::new(), config);

        let _held = pool.acquire().await.unwrap();
        assert!(matches!(pool.acquire().await, Err(PoolError::Exhausted)));
    }

    #[tokio::test]
    async fn test_invalidated_connection_is_not_reused() {
        let cluster = MemoryCluster::new();
        let pool = ClusterPool::new(cluster.clone(), test_config(1));

        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        pool.invalidate(conn);

        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.idle, 0);

        // Replacement is created lazily
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), id);
        assert_eq!(cluster.connections_created(), 2);
    }

    #[tokio::test]
    async fn test_max_idle_discards_surplus() {
        let config = PoolConfig {
            max_idle: 1,
            ..test_config(3)
        };
        let pool = ClusterPool::new(MemoryCluster::new(), config);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.live, 1);
    }

    #[tokio::test]
    async fn test_borrow_validation_replaces_dead_connection() {
        let cluster = MemoryCluster::new();
        let config = PoolConfig {
            test_on_borrow: true,
            ..test_config(1)
        };
        let pool = ClusterPool::new(cluster.clone(), config);

        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        drop(conn);

        cluster.fail_pings(1);
        let conn = pool.acquire().await.unwrap();
        assert_ne!(conn.id(), id);
    }

    #[tokio::test]
    async fn test_return_validation_discards_dead_connection() {
        let cluster = MemoryCluster::new();
        let config = PoolConfig {
            test_on_return: true,
            ..test_config(1)
        };
        let pool = ClusterPool::new(cluster.clone(), config);

        let conn = pool.acquire().await.unwrap();
        cluster.fail_pings(1);
        pool.release(conn).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_respects_min_idle() {
        let config = PoolConfig {
            min_idle: 1,
            min_evictable_idle_time_ms: 1_000,
            ..test_config(3)
        };
        let pool = ClusterPool::new(MemoryCluster::new(), config);

        let held: Vec<_> = vec![
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        drop(held);
        assert_eq!(pool.stats().idle, 3);

        tokio::time::advance(Duration::from_secs(2)).await;
        let run = pool.evict().await;
        assert_eq!(run.evicted, 2);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test]
    async fn test_eviction_tops_up_min_idle() {
        let config = PoolConfig {
            min_idle: 2,
            ..test_config(4)
        };
        let pool = ClusterPool::new(MemoryCluster::new(), config);

        let run = pool.evict().await;
        assert_eq!(run.created, 2);
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_idle_validation_drops_dead_connections() {
        let cluster = MemoryCluster::new();
        let config = PoolConfig {
            test_while_idle: true,
            ..test_config(2)
        };
        let pool = ClusterPool::new(cluster.clone(), config);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);

        cluster.fail_pings(2);
        let run = pool.evict().await;
        assert_eq!(run.failed_validation, 2);
        assert_eq!(pool.stats().live, 0);
    }

    #[tokio::test]
    async fn test_idle_validation_rotates_through_oldest_handles() {
        for lifo in [true, false] {
            let cluster = MemoryCluster::new();
            let config = PoolConfig {
                lifo,
                test_while_idle: true,
                test_on_borrow: false,
                test_on_return: false,
                num_tests_per_eviction_run: 1,
                min_idle: 0,
                ..test_config(3)
            };
            let pool = ClusterPool::new(cluster.clone(), config);

            let a = pool.acquire().await.unwrap();
            let b = pool.acquire().await.unwrap();
            let c = pool.acquire().await.unwrap();
            let ids = [a.id(), b.id(), c.id()];
            pool.release(a).await;
            pool.release(b).await;
            pool.release(c).await;

            // First run tests the oldest handle and keeps it
            assert_eq!(pool.evict().await.failed_validation, 0);

            // Second run must move on to the next oldest one
            cluster.fail_pings(1);
            assert_eq!(pool.evict().await.failed_validation, 1, "lifo = {}", lifo);

            let mut remaining = Vec::new();
            for _ in 0..2 {
                remaining.push(pool.acquire().await.unwrap());
            }
            let mut remaining: Vec<u64> = remaining.iter().map(|conn| conn.id()).collect();
            remaining.sort_unstable();
            assert_eq!(remaining, vec![ids[0], ids[2]], "lifo = {}", lifo);
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_acquire() {
        let pool = ClusterPool::new(MemoryCluster::new(), test_config(2));
        let conn = pool.acquire().await.unwrap();
        drop(conn);

        pool.close();
        pool.close();

        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn test_connection_leased_during_close_is_destroyed() {
        let pool = ClusterPool::new(MemoryCluster::new(), test_config(2));
        let conn = pool.acquire().await.unwrap();

        pool.close();
        drop(conn);

        assert_eq!(pool.stats().live, 0);
    }
}
