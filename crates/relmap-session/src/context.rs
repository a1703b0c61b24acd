//! Request-scoped registry of named sessions.
//!
//! A request (or task) that talks to several databases keeps one session per
//! context name. Lookups are safe from any number of threads; each session is
//! wrapped in an async mutex so only one task drives it at a time.

use crate::{Session, SessionFactory};
use asupersync::sync::Mutex;
use relmap_core::{Error, Executor, Result};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Shared handle to a registered session.
pub type SessionHandle<E> = Arc<Mutex<Session<E>>>;

type AnyHandle = Arc<dyn Any + Send + Sync>;

/// Named sessions for one request context.
#[derive(Default)]
pub struct RequestContext {
    sessions: RwLock<HashMap<String, AnyHandle>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its configured name, replacing any session
    /// previously registered under that name.
    pub fn register<E: Executor + 'static>(&self, session: Session<E>) -> SessionHandle<E> {
        let name = session.name().to_string();
        let handle: SessionHandle<E> = Arc::new(Mutex::new(session));
        let erased: AnyHandle = handle.clone();
        let replaced = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), erased)
            .is_some();
        tracing::debug!(context = %name, replaced, "Registered session");
        handle
    }

    /// The session registered under `name`, if it uses executor type `E`.
    pub fn get<E: Executor + 'static>(&self, name: &str) -> Option<SessionHandle<E>> {
        let erased = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()?;
        erased.downcast::<Mutex<Session<E>>>().ok()
    }

    /// The session registered under the factory's name, forking and
    /// registering a new one on first use.
    ///
    /// Fails if the name is taken by a session over a different executor type.
    pub fn get_or_fork<E: Executor + Clone + 'static>(
        &self,
        factory: &SessionFactory<E>,
    ) -> Result<SessionHandle<E>> {
        let name = factory.name();
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let erased = sessions
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(context = %name, "Forking session for context");
                let handle: AnyHandle = Arc::new(Mutex::new(factory.fork()));
                handle
            })
            .clone();
        erased.downcast::<Mutex<Session<E>>>().map_err(|_| {
            Error::Custom(format!(
                "context '{name}' is registered with a different executor type"
            ))
        })
    }

    /// Drop the session registered under `name`.
    pub fn remove(&self, name: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Registered context names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("sessions", &self.names())
            .finish()
    }
}
