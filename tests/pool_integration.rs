//! Connection pool integration tests

use std::time::Duration;

use cluster_session_store::config::PoolConfig;
use cluster_session_store::redis::{ClusterCommands, ClusterPool, MemoryCluster, PoolError};

fn single_connection_pool(max_wait_ms: i64) -> ClusterPool<MemoryCluster> {
    let config = PoolConfig {
        max_total: 1,
        max_idle: 1,
        max_wait_ms,
        ..Default::default()
    };
    ClusterPool::new(MemoryCluster::new(), config)
}

#[tokio::test(start_paused = true)]
async fn test_single_connection_blocks_then_exhausts() {
    let pool = single_connection_pool(500);

    // A is held; a concurrent acquire waits for it
    let a = pool.acquire().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|conn| conn.id()) })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    let a_id = a.id();
    pool.release(a).await;
    let b_id = waiter.await.unwrap().unwrap();
    assert_eq!(b_id, a_id);

    // Hold the only connection past the wait timeout
    let _held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.err().expect("pool should be exhausted");
    assert!(matches!(err, PoolError::Exhausted));
}

#[tokio::test]
async fn test_concurrent_leases_never_exceed_max_total() {
    let config = PoolConfig {
        max_total: 3,
        max_idle: 3,
        ..Default::default()
    };
    let cluster = MemoryCluster::new();
    let pool = ClusterPool::new(cluster.clone(), config);

    let handles: Vec<_> = (0..24)
        .map(|i| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut conn = pool.acquire().await.unwrap();
                assert!(pool.stats().leased <= 3);
                conn.set(&format!("key-{}", i), b"v").await.unwrap();
                tokio::task::yield_now().await;
                pool.release(conn).await;
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    assert!(cluster.connections_created() <= 3);
    assert!(pool.stats().live <= 3);
    assert_eq!(pool.stats().leased, 0);
}

#[tokio::test]
async fn test_invalidated_connection_is_replaced_lazily() {
    let cluster = MemoryCluster::new();
    let pool = ClusterPool::new(cluster.clone(), PoolConfig::default());

    let conn = pool.acquire().await.unwrap();
    let first = conn.id();
    pool.invalidate(conn);
    assert_eq!(pool.stats().live, 0);
    assert_eq!(cluster.connections_created(), 1);

    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id(), first);
    assert_eq!(cluster.connections_created(), 2);
}
