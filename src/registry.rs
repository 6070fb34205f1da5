//! Session Registry — live sessions keyed by peer
//!
//! Inbound upgrade handlers and fan-out workers share one registry. It is
//! constructed at startup, passed around by `Arc`, and torn down with
//! [`SessionRegistry::close_all`] at shutdown.
//!
//! A session found closed on lookup is evicted before anything is returned,
//! so one dead peer never poisons its key. The registry never dials out:
//! replacing a dead session takes a fresh transport from the caller.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::Result;
use crate::session::{Role, Session};
use crate::transport::Transport;

/// Registry of live sessions keyed by peer key (hostname)
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    role: Role,
}

impl SessionRegistry {
    /// Registry for inbound (upgrade-server) sessions.
    pub fn new() -> Self {
        Self::with_role(Role::Server)
    }

    /// Registry whose created sessions take `role`.
    pub fn with_role(role: Role) -> Self {
        Self {
            sessions: DashMap::new(),
            role,
        }
    }

    /// Return the live session for `key`, or build one from the supplied
    /// transport and register it.
    ///
    /// The supplier only runs when no live session exists. Concurrent callers
    /// for the same key all receive the same `Arc`. The supplier runs while
    /// the key's shard is locked and must not touch the registry.
    pub fn get_or_create<F>(&self, key: &str, supplier: F) -> Result<Arc<Session>>
    where
        F: FnOnce() -> Result<Transport>,
    {
        match self.sessions.entry(key.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => Ok(entry.get().clone()),
            Entry::Occupied(mut entry) => {
                info!("[registry] replacing closed session for {}", key);
                let session = Arc::new(Session::new(key, supplier()?, self.role));
                let stale = entry.insert(session.clone());
                stale.close();
                Ok(session)
            }
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(key, supplier()?, self.role));
                entry.insert(session.clone());
                info!("[registry] registered session for {}", key);
                Ok(session)
            }
        }
    }

    /// Register an already-built session, replacing (and closing) any
    /// existing one for its key.
    pub fn insert(&self, session: Arc<Session>) {
        let key = session.key().to_string();
        if let Some(previous) = self.sessions.insert(key.clone(), session) {
            previous.close();
            debug!("[registry] replaced session for {}", key);
        }
    }

    /// Live session for `key`. A closed entry is evicted and `None` returned.
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(key).map(|r| r.value().clone())?;
        if session.is_closed() {
            self.evict(key, &session);
            return None;
        }
        Some(session)
    }

    /// Remove `session` if it is still the one registered for `key`.
    pub fn evict(&self, key: &str, session: &Arc<Session>) {
        if self
            .sessions
            .remove_if(key, |_, current| Arc::ptr_eq(current, session))
            .is_some()
        {
            info!("[registry] evicted session for {}", key);
        }
    }

    /// Remove and close the session for `key`
    pub fn remove(&self, key: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(key)?;
        session.close();
        Some(session)
    }

    /// Drop every closed entry; returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_closed());
        before.saturating_sub(self.sessions.len())
    }

    /// Keys of all registered sessions
    pub fn keys(&self) -> Vec<String> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close all sessions (for cleanup on shutdown)
    pub fn close_all(&self) {
        let keys = self.keys();
        for key in keys {
            if let Some((_, session)) = self.sessions.remove(&key) {
                session.close();
            }
        }
        info!("[registry] all sessions closed");
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
