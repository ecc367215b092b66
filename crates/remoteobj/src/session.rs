//! Session-scoped table of exposed targets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::HandleConfig;
use crate::error::RemoteError;
use crate::handle::RemoteHandle;
use crate::target::{FunctionTable, Target};

/// Exposes each target at most once; later exposures return the same handle.
pub struct Session {
    config: HandleConfig,
    functions: FunctionTable,
    handles: Mutex<HashMap<usize, RemoteHandle>>,
}

fn identity(target: &Arc<dyn Target>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

impl Session {
    pub fn new(config: HandleConfig) -> Self {
        Self {
            config,
            functions: FunctionTable::default(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Functions handed to every handle this session exposes.
    pub fn with_functions(mut self, functions: FunctionTable) -> Self {
        self.functions = functions;
        self
    }

    fn table(&self) -> MutexGuard<'_, HashMap<usize, RemoteHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The owner handle for `target`, exposing it first if needed.
    pub fn expose(&self, target: &Arc<dyn Target>) -> Result<RemoteHandle, RemoteError> {
        let mut table = self.table();
        if let Some(handle) = table.get(&identity(target)) {
            return Ok(handle.root());
        }
        let handle = RemoteHandle::expose_with(
            Arc::clone(target),
            self.config.clone(),
            self.functions.clone(),
        )?;
        tracing::debug!(handle = %handle.id(), target = target.type_name(), "Session exposed target");
        table.insert(identity(target), handle.clone());
        Ok(handle)
    }

    pub fn contains(&self, target: &Arc<dyn Target>) -> bool {
        self.table().contains_key(&identity(target))
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Stop every exposed handle and forget them. Returns the first stop
    /// failure, after trying them all.
    pub async fn close(&self) -> Result<(), RemoteError> {
        let handles: Vec<RemoteHandle> = self.table().drain().map(|(_, handle)| handle).collect();
        tracing::info!(count = handles.len(), "Closing session");

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.stop().await {
                tracing::warn!(handle = %handle.id(), error = %e, "Failed to stop handle");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("functions", &self.functions)
            .field("exposed", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::SharedMap;
    use serde_json::json;

    #[tokio::test]
    async fn exposing_twice_returns_the_same_handle() {
        let session = Session::new(HandleConfig::new());
        let target: Arc<dyn Target> = Arc::new(SharedMap::default());
        let other: Arc<dyn Target> = Arc::new(SharedMap::default());

        let first = session.expose(&target).unwrap();
        let second = session.expose(&Arc::clone(&target)).unwrap();
        assert_eq!(first.id(), second.id());
        assert!(session.contains(&target));
        assert!(!session.contains(&other));

        let third = session.expose(&other).unwrap();
        assert_ne!(first.id(), third.id());
        assert_eq!(session.len(), 2);
    }

    #[tokio::test]
    async fn close_stops_and_forgets_handles() {
        let session = Session::new(HandleConfig::new());
        let target: Arc<dyn Target> = Arc::new(SharedMap::from_value(json!({"x": 1})));
        let handle = session.expose(&target).unwrap();
        handle.start().await.unwrap();
        assert!(handle.is_listening());

        session.close().await.unwrap();
        assert!(!handle.is_listening());
        assert!(session.is_empty());
        assert!(!session.contains(&target));
    }
}
