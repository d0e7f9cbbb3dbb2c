//! Start/stop lifecycle of the session store and the request-completion hook.

use std::sync::{Arc, PoisonError, RwLock};

use crate::config::Settings;
use crate::error::LifecycleError;
use crate::redis::{ClusterPool, ConnectionFactory};
use crate::session::SessionStore;

/// Slot through which the request pipeline reaches the running store.
///
/// The session middleware reads it on every request; the manager binds the
/// store on start and unbinds it on stop. Only one store can be bound.
pub struct RequestHook<F: ConnectionFactory> {
    store: RwLock<Option<Arc<SessionStore<F>>>>,
}

impl<F: ConnectionFactory> RequestHook<F> {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(None),
        }
    }

    pub fn attach(&self, store: Arc<SessionStore<F>>) -> Result<(), LifecycleError> {
        let mut slot = self.store.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(LifecycleError::HookUnavailable(
                "request hook is already bound to a session store".to_string(),
            ));
        }
        *slot = Some(store);
        Ok(())
    }

    pub fn detach(&self) -> Option<Arc<SessionStore<F>>> {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The bound store, if the manager is running.
    pub fn store(&self) -> Option<Arc<SessionStore<F>>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_attached(&self) -> bool {
        self.store().is_some()
    }
}

impl<F: ConnectionFactory> Default for RequestHook<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the store between `start` and `stop`.
pub struct SessionManager<F: ConnectionFactory + Clone> {
    settings: Settings,
    factory: F,
    hook: Option<Arc<RequestHook<F>>>,
    store: Option<Arc<SessionStore<F>>>,
}

impl<F: ConnectionFactory + Clone> SessionManager<F> {
    pub fn new(settings: Settings, factory: F) -> Self {
        Self {
            settings,
            factory,
            hook: None,
            store: None,
        }
    }

    /// Build the pool and store and bind them to `hook`.
    ///
    /// Fails with [`LifecycleError::HookUnavailable`] when no hook is given or
    /// the hook is bound elsewhere: without it sessions would never be saved.
    /// Must run inside a tokio runtime (the evictor is spawned here).
    pub fn start(
        &mut self,
        hook: Option<Arc<RequestHook<F>>>,
    ) -> Result<Arc<SessionStore<F>>, LifecycleError> {
        if self.store.is_some() {
            return Err(LifecycleError::AlreadyStarted);
        }

        let hook = hook.ok_or_else(|| {
            LifecycleError::HookUnavailable(
                "no request completion hook supplied, sessions would never be persisted"
                    .to_string(),
            )
        })?;

        self.settings.validate()?;

        let session_config = &self.settings.session;
        let pool = ClusterPool::new(self.factory.clone(), self.settings.pool.clone());
        let store = Arc::new(SessionStore::new(pool.clone(), session_config)?);

        if let Err(e) = hook.attach(store.clone()) {
            pool.close();
            return Err(e);
        }

        tracing::info!(serializer = store.serializer_name(), "Using session serializer");
        tracing::info!(
            "Will expire sessions after {} seconds",
            store.max_inactive_interval()
        );
        let policies: Vec<String> = store.policies().iter().map(|p| p.to_string()).collect();
        tracing::info!(
            policies = %policies.join(","),
            node_route = ?session_config.node_route,
            max_total = self.settings.pool.max_total,
            "Session manager started"
        );

        if pool.spawn_evictor() {
            tracing::debug!("Idle connection evictor running");
        }

        self.hook = Some(hook);
        self.store = Some(store.clone());
        Ok(store)
    }

    /// Unbind the store and close the pool. Idempotent.
    pub fn stop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };

        if let Some(hook) = self.hook.take() {
            hook.detach();
        }
        store.close();
        tracing::info!("Session manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&Arc<SessionStore<F>>> {
        self.store.as_ref()
    }
}

impl<F: ConnectionFactory + Clone> Drop for SessionManager<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterBackend;
    use crate::redis::MemoryCluster;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.cluster.backend = ClusterBackend::Memory;
        settings
    }

    #[tokio::test]
    async fn test_start_requires_hook() {
        let mut manager = SessionManager::new(settings(), MemoryCluster::new());
        let err = manager.start(None).err().expect("start without a hook must fail");
        assert!(matches!(err, LifecycleError::HookUnavailable(_)));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_start_binds_store_and_stop_unbinds() {
        let hook = Arc::new(RequestHook::new());
        let mut manager = SessionManager::new(settings(), MemoryCluster::new());

        let store = manager.start(Some(hook.clone())).unwrap();
        assert!(hook.is_attached());
        assert!(manager.is_running());

        manager.stop();
        assert!(!hook.is_attached());
        assert!(store.pool().is_closed());

        // Idempotent
        manager.stop();
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let hook = Arc::new(RequestHook::new());
        let mut manager = SessionManager::new(settings(), MemoryCluster::new());
        manager.start(Some(hook.clone())).unwrap();

        assert!(matches!(
            manager.start(Some(hook)),
            Err(LifecycleError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_hook_bound_elsewhere_fails_start() {
        let hook = Arc::new(RequestHook::new());
        let mut first = SessionManager::new(settings(), MemoryCluster::new());
        first.start(Some(hook.clone())).unwrap();

        let mut second = SessionManager::new(settings(), MemoryCluster::new());
        assert!(matches!(
            second.start(Some(hook)),
            Err(LifecycleError::HookUnavailable(_))
        ));
        assert!(!second.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let hook = Arc::new(RequestHook::new());
        let mut manager = SessionManager::new(settings(), MemoryCluster::new());

        manager.start(Some(hook.clone())).unwrap();
        manager.stop();
        assert!(manager.start(Some(hook.clone())).is_ok());
        assert!(hook.is_attached());
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_start() {
        let mut settings = settings();
        settings.session.persist_policies = "SAVE_SOMETIMES".to_string();

        let mut manager = SessionManager::new(settings, MemoryCluster::new());
        let err = manager
            .start(Some(Arc::new(RequestHook::new())))
            .err()
            .expect("start with invalid settings must fail");
        assert!(matches!(err, LifecycleError::Config(_)));
    }
}
