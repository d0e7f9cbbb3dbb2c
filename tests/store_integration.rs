//! Session store integration tests
//!
//! Drive the store end to end against the in-process cluster; no live
//! Redis Cluster is needed.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;

use cluster_session_store::config::{PoolConfig, SessionConfig};
use cluster_session_store::error::SessionError;
use cluster_session_store::redis::{ClusterPool, MemoryCluster};
use cluster_session_store::session::{RequestContext, SaveOutcome, Session, SessionStore};

fn create_store(cluster: &MemoryCluster) -> SessionStore<MemoryCluster> {
    let pool = ClusterPool::new(cluster.clone(), PoolConfig::default());
    SessionStore::new(pool, &SessionConfig::default()).unwrap()
}

#[tokio::test]
async fn test_session_lifecycle_scenario() {
    let cluster = MemoryCluster::new();
    let store = create_store(&cluster);
    let mut ctx = RequestContext::new();

    // Empty store: nothing found, context cleared
    assert!(store.find_session(&mut ctx, "abc").await.unwrap().is_none());
    assert!(ctx.session().is_none());

    // Requested id is honored when no node route is configured
    let session = store
        .create_session(&mut ctx, Some("abc"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.id(), "abc");
    assert!(session.is_new());
    assert!(session.is_valid());

    // Reservation plus the forced first write
    assert_eq!(cluster.write_count(), 2);
    assert_eq!(cluster.ttl_seconds("abc"), Some(1800));

    // One mutation, one write
    ctx.session_mut()
        .unwrap()
        .set_attribute("user", "alice")
        .unwrap();
    assert_eq!(store.save(&mut ctx, false).await.unwrap(), SaveOutcome::Written);
    assert_eq!(cluster.write_count(), 3);

    // Unchanged: no write, TTL still refreshed
    let expires = cluster.expire_count();
    assert_eq!(store.save(&mut ctx, false).await.unwrap(), SaveOutcome::Unchanged);
    assert_eq!(cluster.write_count(), 3);
    assert_eq!(cluster.expire_count(), expires + 1);
    assert_eq!(cluster.ttl_seconds("abc"), Some(1800));

    // Removed: a later lookup finds nothing
    let session = ctx.take_session().unwrap();
    store.remove(&session).await.unwrap();

    let mut next = RequestContext::new();
    assert!(store.find_session(&mut next, "abc").await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_creation_yields_distinct_ids() {
    let cluster = MemoryCluster::new();
    let store = Arc::new(create_store(&cluster));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut ctx = RequestContext::new();
                let session = store.create_session(&mut ctx, None).await.unwrap().unwrap();
                session.id().to_string()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 32);

    for id in &ids {
        let mut ctx = RequestContext::new();
        let session = store.find_session(&mut ctx, id).await.unwrap().unwrap();
        assert!(session.is_valid());
        assert_eq!(session.attributes().len(), 0);
    }
}

#[tokio::test]
async fn test_taken_requested_id_falls_back_to_generated() {
    let cluster = MemoryCluster::new();
    let store = create_store(&cluster);

    let mut first = RequestContext::new();
    store.create_session(&mut first, Some("abc")).await.unwrap();

    let mut second = RequestContext::new();
    assert!(store
        .create_session(&mut second, Some("abc"))
        .await
        .unwrap()
        .is_none());

    let session = store.create_session(&mut second, None).await.unwrap().unwrap();
    assert_ne!(session.id(), "abc");
}

#[tokio::test]
async fn test_request_cycle_persists_changes_across_contexts() {
    let cluster = MemoryCluster::new();
    let store = create_store(&cluster);

    // Request 1: create and fill
    let mut ctx = RequestContext::new();
    let id = {
        let session = store.create_session(&mut ctx, None).await.unwrap().unwrap();
        session.set_attribute("cart", json!({"items": [1, 2]})).unwrap();
        session.id().to_string()
    };
    store.after_request(ctx).await;

    // Request 2: read only, nothing written
    let writes = cluster.write_count();
    let mut ctx = RequestContext::new();
    let session = store.find_session(&mut ctx, &id).await.unwrap().unwrap();
    assert!(!session.is_new());
    assert_eq!(
        session.attribute_value("cart"),
        Some(&json!({"items": [1, 2]}))
    );
    store.after_request(ctx).await;
    assert_eq!(cluster.write_count(), writes);

    // Request 3: invalidate
    let mut ctx = RequestContext::new();
    store
        .find_session(&mut ctx, &id)
        .await
        .unwrap()
        .unwrap()
        .invalidate();
    store.after_request(ctx).await;
    assert!(!cluster.contains_key(&id));
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_is_not_found() {
    let cluster = MemoryCluster::new();
    let config = SessionConfig {
        max_inactive_interval_seconds: 60,
        ..Default::default()
    };
    let pool = ClusterPool::new(cluster.clone(), PoolConfig::default());
    let store = SessionStore::new(pool, &config).unwrap();

    let mut ctx = RequestContext::new();
    store.create_session(&mut ctx, Some("abc")).await.unwrap();

    tokio::time::advance(std::time::Duration::from_secs(61)).await;

    let mut next = RequestContext::new();
    assert!(store.find_session(&mut next, "abc").await.unwrap().is_none());
}

#[tokio::test]
async fn test_remove_nonexistent_key_succeeds() {
    let cluster = MemoryCluster::new();
    let store = create_store(&cluster);

    assert!(store.remove(&Session::new("ghost", 60)).await.is_ok());
    assert_eq!(cluster.delete_count(), 1);
}

#[tokio::test]
async fn test_exhausted_pool_surfaces_to_store_caller() {
    let cluster = MemoryCluster::new();
    let pool_config = PoolConfig {
        max_total: 1,
        block_when_exhausted: false,
        ..Default::default()
    };
    let pool = ClusterPool::new(cluster.clone(), pool_config);
    let store = SessionStore::new(pool.clone(), &SessionConfig::default()).unwrap();

    let _held = pool.acquire().await.unwrap();
    let mut ctx = RequestContext::new();
    assert!(matches!(
        store.create_session(&mut ctx, None).await,
        Err(SessionError::PoolExhausted)
    ));
}
