//! Cluster-backed session store.
//!
//! Composes the connection pool, the serializer and the per-request context:
//! - `find_session`: context cache, then the cluster
//! - `create_session`: reserve an id with `SET NX EX`, then force a first write
//! - `save`: write only when something changed, always refresh the TTL
//! - `remove` / `after_request`: end-of-request persistence
//!
//! Expiration is left to the cluster's key TTL; there is no local sweep.

use std::collections::BTreeSet;
use std::sync::Arc;

use config::ConfigError;
use serde::Serialize;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::metrics::SessionMetrics;
use crate::redis::{ClusterCommands, ClusterPool, CommandError, ConnectionFactory, PooledConnection};

use super::context::RequestContext;
use super::id::SessionIdAllocator;
use super::model::Session;
use super::policy::SessionPersistPolicy;
use super::serializer::{SerializationMetadata, SessionSerializer, StoredPayload};

/// Result of a successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The session was serialized and written
    Written,
    /// Nothing changed; only the TTL was refreshed
    Unchanged,
}

pub struct SessionStore<F: ConnectionFactory> {
    pool: ClusterPool<F>,
    serializer: Arc<dyn SessionSerializer>,
    allocator: SessionIdAllocator,
    policies: BTreeSet<SessionPersistPolicy>,
    max_inactive_interval: i64,
}

/// Longest TTL handed to `EXPIRE` (about 68 years).
const MAX_TTL_SECONDS: i64 = i32::MAX as i64;

fn no_session() -> SessionError {
    SessionError::Store("no session bound to the request".to_string())
}

impl<F: ConnectionFactory> SessionStore<F> {
    pub fn new(pool: ClusterPool<F>, config: &SessionConfig) -> Result<Self, ConfigError> {
        if config.max_inactive_interval_seconds <= 0 {
            return Err(ConfigError::Message(
                "session.max_inactive_interval_seconds must be positive".to_string(),
            ));
        }
        if config.max_inactive_interval_seconds > MAX_TTL_SECONDS {
            return Err(ConfigError::Message(format!(
                "session.max_inactive_interval_seconds must not exceed {}",
                MAX_TTL_SECONDS
            )));
        }

        Ok(Self {
            pool,
            serializer: config.serializer.build(),
            allocator: SessionIdAllocator::new(config.node_route.clone()),
            policies: config.policies()?,
            max_inactive_interval: config.max_inactive_interval_seconds,
        })
    }

    pub fn pool(&self) -> &ClusterPool<F> {
        &self.pool
    }

    pub fn serializer_name(&self) -> &'static str {
        self.serializer.name()
    }

    pub fn max_inactive_interval(&self) -> i64 {
        self.max_inactive_interval
    }

    pub fn policies(&self) -> &BTreeSet<SessionPersistPolicy> {
        &self.policies
    }

    pub fn save_on_change(&self) -> bool {
        self.policies.contains(&SessionPersistPolicy::SaveOnChange)
    }

    pub fn always_save_after_request(&self) -> bool {
        self.policies
            .contains(&SessionPersistPolicy::AlwaysSaveAfterRequest)
    }

    /// Look a session up, first in the request context, then in the cluster.
    ///
    /// An empty id or a missing key clears the context and yields `None`. A
    /// key holding a reservation or undecodable bytes is reported as
    /// [`SessionError::CorruptSession`] and the context is cleared.
    pub async fn find_session<'c>(
        &self,
        ctx: &'c mut RequestContext,
        id: &str,
    ) -> Result<Option<&'c mut Session>, SessionError> {
        if id.is_empty() {
            ctx.clear();
            return Ok(None);
        }

        if ctx.session_id() == Some(id) {
            return Ok(ctx.session_mut());
        }

        let data = match self.load_data(id).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                tracing::trace!(session_id = %id, "Session not found in cluster");
                ctx.clear();
                return Ok(None);
            }
            Err(e) => {
                ctx.clear();
                return Err(e);
            }
        };

        match self.decode(id, &data) {
            Ok((session, metadata)) => {
                SessionMetrics::record_loaded();
                if tracing::enabled!(tracing::Level::TRACE) {
                    let names: Vec<&str> = session.attribute_names().collect();
                    tracing::trace!(
                        session_id = %id,
                        attributes = ?names,
                        fingerprint = %metadata.hash_hex(),
                        "Loaded session"
                    );
                }
                Ok(Some(ctx.bind(session, metadata, true)))
            }
            Err(e) => {
                SessionMetrics::record_corrupt();
                tracing::warn!(session_id = %id, error = %e, "Discarding unreadable session");
                ctx.clear();
                Err(e)
            }
        }
    }

    /// Create a session under `requested`, or under a fresh id when `None`.
    ///
    /// Returns `Ok(None)` when the requested id is already taken; the caller
    /// may retry without one. The new session is written immediately. If
    /// that write fails the context is cleared and the reservation expires
    /// after the store's max inactive interval.
    pub async fn create_session<'c>(
        &self,
        ctx: &'c mut RequestContext,
        requested: Option<&str>,
    ) -> Result<Option<&'c mut Session>, SessionError> {
        let mut conn = self.pool.acquire().await?;

        let result = self.allocator
            .reserve(&mut *conn, requested, self.max_inactive_interval)
            .await;
        let reserved = match Self::observe(&mut conn, result) {
            Ok(reserved) => reserved,
            Err(e) => {
                self.pool.release(conn).await;
                ctx.clear();
                return Err(e.into());
            }
        };

        let Some(id) = reserved else {
            self.pool.release(conn).await;
            ctx.clear();
            return Ok(None);
        };

        // Reserved but not yet written: the first save must replace the placeholder.
        ctx.bind(
            Session::new(id.clone(), self.max_inactive_interval),
            SerializationMetadata::default(),
            false,
        );

        let saved = self.save_on(&mut conn, ctx, true).await;
        self.pool.release(conn).await;

        match saved {
            Ok(_) => {
                SessionMetrics::record_created();
                tracing::debug!(session_id = %id, "Created session");
                Ok(ctx.session_mut())
            }
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Error saving newly created session");
                ctx.clear();
                Err(e)
            }
        }
    }

    /// Persist the request's session.
    ///
    /// The write is skipped unless `force` is set, the session is dirty, it
    /// is not known to be persisted, or its fingerprint changed. The TTL is
    /// refreshed either way.
    pub async fn save(
        &self,
        ctx: &mut RequestContext,
        force: bool,
    ) -> Result<SaveOutcome, SessionError> {
        if ctx.session.is_none() {
            return Err(no_session());
        }

        let mut conn = self.pool.acquire().await?;
        let result = self.save_on(&mut conn, ctx, force).await;
        self.pool.release(conn).await;
        result
    }

    async fn save_on(
        &self,
        conn: &mut PooledConnection<F>,
        ctx: &mut RequestContext,
        force: bool,
    ) -> Result<SaveOutcome, SessionError> {
        let persisted = ctx.persisted;
        let session = ctx.session.as_mut().ok_or_else(no_session)?;
        let id = session.id().to_string();
        let ttl = match session.max_inactive_interval() {
            seconds if seconds > 0 => seconds,
            _ => self.max_inactive_interval,
        };
        if ttl > MAX_TTL_SECONDS {
            return Err(Self::persist_failed(
                &id,
                CommandError::Failed(format!("max inactive interval {}s is out of range", ttl)),
            ));
        }

        let mut fingerprint = None;
        let must_write = if force || session.is_dirty() || !persisted {
            true
        } else {
            let current = self.serializer.fingerprint(session)?;
            let changed = ctx
                .metadata
                .as_ref()
                .map_or(true, |known| known.attributes_hash != current);
            fingerprint = Some(current);
            changed
        };

        let outcome = if must_write {
            tracing::trace!(session_id = %id, force = force, "Save was determined to be necessary");

            let hash = match fingerprint {
                Some(hash) => hash,
                None => self.serializer.fingerprint(session)?,
            };
            let metadata = SerializationMetadata::new(hash);
            let bytes = self.serializer.serialize(session, &metadata)?;
            let payload = StoredPayload::Session(bytes).encode();

            let result = conn.set(&id, &payload).await;
            Self::observe(conn, result).map_err(|e| Self::persist_failed(&id, e))?;

            session.reset_dirty();
            ctx.metadata = Some(metadata);
            ctx.persisted = true;
            SessionMetrics::record_written();
            SaveOutcome::Written
        } else {
            tracing::trace!(session_id = %id, "Save was determined to be unnecessary");
            SessionMetrics::record_skipped();
            SaveOutcome::Unchanged
        };

        tracing::trace!(session_id = %id, ttl_seconds = ttl, "Refreshing session expiry");
        let result = conn.expire(&id, ttl).await;
        Self::observe(conn, result).map_err(|e| Self::persist_failed(&id, e))?;
        SessionMetrics::record_ttl_refresh();

        Ok(outcome)
    }

    /// Delete a session. An already absent key is not an error.
    pub async fn remove(&self, session: &Session) -> Result<(), SessionError> {
        tracing::trace!(session_id = %session.id(), "Removing session");

        let mut conn = self.pool.acquire().await?;
        let result = conn.del(session.id()).await;
        let result = Self::observe(&mut conn, result);
        self.pool.release(conn).await;

        if result? {
            SessionMetrics::record_removed();
        }
        Ok(())
    }

    /// End-of-request hook: save a valid session or remove an invalidated
    /// one. Failures are logged, never returned; the context is consumed so
    /// nothing carries over to the next request.
    pub async fn after_request(&self, mut ctx: RequestContext) {
        let Some(session) = ctx.session() else {
            return;
        };
        let id = session.id().to_string();

        if session.is_valid() {
            tracing::trace!(session_id = %id, "Request with session completed, saving session");
            if let Err(e) = self.save(&mut ctx, self.always_save_after_request()).await {
                tracing::error!(session_id = %id, error = %e, "Error storing session");
            }
        } else if let Some(session) = ctx.take_session() {
            tracing::trace!(session_id = %id, "Session has been invalidated, removing");
            if let Err(e) = self.remove(&session).await {
                tracing::error!(session_id = %id, error = %e, "Error removing session");
            }
        }
    }

    /// Set an attribute on the request's session, saving at once under
    /// `SAVE_ON_CHANGE`.
    pub async fn set_attribute<T: Serialize>(
        &self,
        ctx: &mut RequestContext,
        name: &str,
        value: T,
    ) -> Result<(), SessionError> {
        let session = ctx.session.as_mut().ok_or_else(no_session)?;
        session.set_attribute(name, value)?;
        self.save_if_changed(ctx).await
    }

    pub async fn remove_attribute(
        &self,
        ctx: &mut RequestContext,
        name: &str,
    ) -> Result<Option<serde_json::Value>, SessionError> {
        let session = ctx.session.as_mut().ok_or_else(no_session)?;
        let removed = session.remove_attribute(name);
        self.save_if_changed(ctx).await?;
        Ok(removed)
    }

    async fn save_if_changed(&self, ctx: &mut RequestContext) -> Result<(), SessionError> {
        let dirty = ctx.session().is_some_and(Session::is_dirty);
        if self.save_on_change() && dirty {
            self.save(ctx, self.always_save_after_request()).await?;
        }
        Ok(())
    }

    /// Every key in the cluster. Administrative; scans all shards.
    pub async fn keys(&self) -> Result<Vec<String>, SessionError> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.keys("*").await;
        let result = Self::observe(&mut conn, result);
        self.pool.release(conn).await;
        Ok(result?)
    }

    pub fn close(&self) {
        self.pool.close();
    }

    async fn load_data(&self, id: &str) -> Result<Option<Vec<u8>>, SessionError> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.get(id).await;
        let result = Self::observe(&mut conn, result);
        self.pool.release(conn).await;
        Ok(result?)
    }

    fn decode(
        &self,
        id: &str,
        data: &[u8],
    ) -> Result<(Session, SerializationMetadata), SessionError> {
        let bytes = match StoredPayload::decode(data) {
            Ok(StoredPayload::Session(bytes)) => bytes,
            Ok(StoredPayload::Reservation) => {
                return Err(SessionError::corrupt(
                    id,
                    "key holds a reservation, session content was never written",
                ));
            }
            Err(reason) => return Err(SessionError::corrupt(id, reason)),
        };

        let mut session = Session::empty(id);
        let mut metadata = SerializationMetadata::default();
        self.serializer
            .deserialize_into(&bytes, &mut session, &mut metadata)
            .map_err(|e| SessionError::corrupt(id, e.to_string()))?;

        session.set_new(false);
        session.max_inactive_interval = self.max_inactive_interval;
        session.access();
        session.set_valid(true);
        session.reset_dirty();
        Ok((session, metadata))
    }

    /// Flag the connection for disposal when the cluster became unreachable.
    fn observe<T>(
        conn: &mut PooledConnection<F>,
        result: Result<T, CommandError>,
    ) -> Result<T, CommandError> {
        if let Err(e) = &result {
            if e.is_unavailable() {
                tracing::warn!(
                    connection_id = conn.id(),
                    error = %e,
                    "Invalidating cluster connection"
                );
                conn.mark_broken();
            }
        }
        result
    }

    fn persist_failed(id: &str, err: CommandError) -> SessionError {
        SessionMetrics::record_persist_failure();
        tracing::error!(session_id = %id, error = %err, "Failed to persist session");
        SessionError::persist(id, err)
    }
}
