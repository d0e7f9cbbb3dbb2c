use rand::Rng;

use crate::redis::{ClusterCommands, CommandError};

use super::serializer::StoredPayload;

/// Random bytes per generated id.
const SESSION_ID_BYTES: usize = 16;

/// Issues session ids that are unique across the whole cluster.
///
/// An id is claimed by writing a reservation under it with `SET NX EX`; the
/// first writer wins, so no extra coordination is needed between instances.
/// The reservation carries a TTL so an id whose first write never lands is
/// released again.
#[derive(Debug, Clone, Default)]
pub struct SessionIdAllocator {
    node_route: Option<String>,
}

impl SessionIdAllocator {
    pub fn new(node_route: Option<String>) -> Self {
        Self {
            node_route: node_route.filter(|route| !route.is_empty()),
        }
    }

    pub fn node_route(&self) -> Option<&str> {
        self.node_route.as_deref()
    }

    /// A random candidate id without affinity suffix.
    pub fn generate(&self) -> String {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        rand::rng().fill(&mut bytes);
        hex::encode_upper(bytes)
    }

    /// Append `.{node_route}` unless the id already carries it.
    pub fn with_route(&self, id: &str) -> String {
        match &self.node_route {
            Some(route) => {
                let suffix = format!(".{}", route);
                if id.ends_with(&suffix) {
                    id.to_string()
                } else {
                    format!("{}{}", id, suffix)
                }
            }
            None => id.to_string(),
        }
    }

    /// Claim an id in the store.
    ///
    /// With a requested id a single attempt is made and `None` means the id
    /// is taken. Without one, candidates are generated until a claim succeeds.
    /// The reservation expires after `ttl_seconds`.
    pub async fn reserve<C>(
        &self,
        conn: &mut C,
        requested: Option<&str>,
        ttl_seconds: i64,
    ) -> Result<Option<String>, CommandError>
    where
        C: ClusterCommands + ?Sized,
    {
        let placeholder = StoredPayload::Reservation.encode();

        if let Some(requested) = requested {
            let id = self.with_route(requested);
            if conn.set_nx_ex(&id, &placeholder, ttl_seconds).await? {
                return Ok(Some(id));
            }
            tracing::debug!(session_id = %id, "Requested session id already taken");
            return Ok(None);
        }

        loop {
            let id = self.with_route(&self.generate());
            if conn.set_nx_ex(&id, &placeholder, ttl_seconds).await? {
                return Ok(Some(id));
            }
            tracing::debug!(session_id = %id, "Generated session id collided, retrying");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::{ConnectionFactory, MemoryCluster};

    #[test]
    fn test_generated_ids_are_hex() {
        let allocator = SessionIdAllocator::default();
        let id = allocator.generate();
        assert_eq!(id.len(), SESSION_ID_BYTES * 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_ne!(allocator.generate(), id);
    }

    #[test]
    fn test_route_suffix_applied_once() {
        let allocator = SessionIdAllocator::new(Some("web1".to_string()));
        assert_eq!(allocator.with_route("abc"), "abc.web1");
        assert_eq!(allocator.with_route("abc.web1"), "abc.web1");
        assert_eq!(allocator.with_route("abc.web2"), "abc.web2.web1");

        let allocator = SessionIdAllocator::new(Some(String::new()));
        assert_eq!(allocator.node_route(), None);
        assert_eq!(allocator.with_route("abc"), "abc");
    }

    #[tokio::test]
    async fn test_requested_id_single_attempt() {
        let cluster = MemoryCluster::new();
        let mut conn = cluster.create().await.unwrap();
        let allocator = SessionIdAllocator::default();

        let first = allocator.reserve(&mut conn, Some("abc"), 60).await.unwrap();
        assert_eq!(first.as_deref(), Some("abc"));
        assert_eq!(
            cluster.raw("abc"),
            Some(StoredPayload::Reservation.encode())
        );
        assert_eq!(cluster.ttl_seconds("abc"), Some(60));

        let second = allocator.reserve(&mut conn, Some("abc"), 60).await.unwrap();
        assert_eq!(second, None);
        assert_eq!(cluster.write_count(), 1);
    }

    #[tokio::test]
    async fn test_generated_reservation_carries_route() {
        let cluster = MemoryCluster::new();
        let mut conn = cluster.create().await.unwrap();
        let allocator = SessionIdAllocator::new(Some("web1".to_string()));

        let id = allocator.reserve(&mut conn, None, 60).await.unwrap().unwrap();
        assert!(id.ends_with(".web1"));
        assert!(cluster.contains_key(&id));
    }

    #[tokio::test]
    async fn test_reserve_propagates_cluster_failure() {
        let cluster = MemoryCluster::new();
        let mut conn = cluster.create().await.unwrap();
        cluster.fail_commands(1);

        let err = SessionIdAllocator::default()
            .reserve(&mut conn, None, 60)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
