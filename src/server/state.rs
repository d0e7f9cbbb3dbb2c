use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::error::{AppError, SessionError};
use crate::redis::ConnectionFactory;
use crate::session::SessionStore;

use super::RequestHook;

pub struct AppState<F: ConnectionFactory> {
    pub settings: Arc<Settings>,
    pub hook: Arc<RequestHook<F>>,
    pub start_time: Instant,
}

impl<F: ConnectionFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            hook: self.hook.clone(),
            start_time: self.start_time,
        }
    }
}

impl<F: ConnectionFactory> AppState<F> {
    pub fn new(settings: Settings, hook: Arc<RequestHook<F>>) -> Self {
        Self {
            settings: Arc::new(settings),
            hook,
            start_time: Instant::now(),
        }
    }

    /// The running store, or a store error when the manager is stopped.
    pub fn store(&self) -> Result<Arc<SessionStore<F>>, AppError> {
        self.hook
            .store()
            .ok_or_else(|| SessionError::Store("session store is not running".to_string()).into())
    }
}
