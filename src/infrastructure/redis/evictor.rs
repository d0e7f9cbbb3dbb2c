use std::sync::Weak;
use std::time::Duration;

use tokio::sync::broadcast;

use super::pool::{ClusterPool, ConnectionFactory, PoolInner};

/// Background task running the pool's eviction pass on a timer.
///
/// Holds only a weak reference so an abandoned pool is not kept alive.
pub struct EvictionTask<F: ConnectionFactory> {
    pool: Weak<PoolInner<F>>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl<F: ConnectionFactory> EvictionTask<F> {
    pub(crate) fn new(
        pool: Weak<PoolInner<F>>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            pool,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Connection evictor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Connection evictor received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    let Some(inner) = self.pool.upgrade() else {
                        break;
                    };
                    let pool = ClusterPool::from_inner(inner);
                    let run = pool.evict().await;

                    if run.evicted > 0 || run.failed_validation > 0 || run.created > 0 {
                        tracing::debug!(
                            evicted = run.evicted,
                            failed_validation = run.failed_validation,
                            created = run.created,
                            idle = pool.stats().idle,
                            "Eviction run completed"
                        );
                    }
                }
            }
        }

        tracing::info!("Connection evictor stopped");
    }
}
