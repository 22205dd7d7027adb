//! Named session registry
//!
//! Holds the sessions created through the `Onramp` convenience entry points,
//! so they can be reused by name and shut down together. Sessions that
//! applications construct themselves never appear here.

use onramp_core::{Closer, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Map from endpoint name to a shared session
pub struct SessionRegistry<S> {
    sessions: RwLock<HashMap<String, Arc<S>>>,
}

impl<S: Closer> SessionRegistry<S> {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Existing session for `name`, or the one `make` builds.
    ///
    /// `make` only runs when no session is registered, and at most one
    /// caller's result is kept.
    pub async fn get_or_create<F>(&self, name: &str, make: F) -> Arc<S>
    where
        F: FnOnce() -> S,
    {
        if let Some(session) = self.sessions.read().await.get(name) {
            return session.clone();
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(name = %name, "Registering session");
                Arc::new(make())
            })
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<S>> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close the session registered as `name`. The entry stays registered;
    /// unknown names are ignored.
    pub async fn close_one(&self, name: &str) -> Result<()> {
        match self.get(name).await {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    /// Close every registered session, logging failures
    pub async fn close_all(&self) {
        let sessions: Vec<(String, Arc<S>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(name, session)| (name.clone(), session.clone()))
            .collect();

        for (name, session) in sessions {
            debug!(name = %name, "Closing registered session");
            if let Err(e) = session.close().await {
                warn!(name = %name, error = %e, "Failed to close session");
            }
        }
    }
}

impl<S: Closer> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
