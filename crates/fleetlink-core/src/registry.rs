//! Session registry: identity to live session.
//!
//! Bidirectional mapping (IMEI -> handle and session id -> handle) with an
//! atomic test-and-set bind. At most one session per identity at any
//! instant; an established session stays authoritative until it leaves on
//! its own, so a conflicting bind tells the caller to close the incoming
//! socket. `unbind` is stale-safe: a late teardown cannot evict a newer
//! binding for the same identity.
//!
//! Critical sections are pointer moves only; nothing here touches a
//! socket.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use thiserror::Error;

use crate::handle::SessionHandle;

/// Another session already holds this identity.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("identity is already bound to another session")]
pub struct BindConflict;

#[derive(Default)]
struct Inner {
    by_imei: HashMap<String, Arc<SessionHandle>>,
    by_id: HashMap<u64, Arc<SessionHandle>>,
}

/// Shared registry of authenticated sessions.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `imei` to `session`, atomically. On [`BindConflict`] the
    /// caller must close the incoming session; the registry is untouched.
    pub fn bind(&self, imei: &str, session: &Arc<SessionHandle>) -> Result<(), BindConflict> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if inner.by_imei.contains_key(imei) {
            return Err(BindConflict);
        }

        session.bind_imei(imei);
        inner.by_imei.insert(imei.to_string(), Arc::clone(session));
        inner.by_id.insert(session.id(), Arc::clone(session));
        Ok(())
    }

    /// Remove the binding for `imei`, but only if `session` is still the
    /// occupant. A stale unbind (the identity has since re-bound to a new
    /// session) is a no-op.
    pub fn unbind(&self, imei: &str, session: &SessionHandle) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let occupant = inner.by_imei.get(imei).is_some_and(|h| h.id() == session.id());
        if occupant {
            inner.by_imei.remove(imei);
            inner.by_id.remove(&session.id());
        }
    }

    /// Session currently bound to `imei`. The dispatcher's only read path.
    #[must_use]
    pub fn lookup(&self, imei: &str) -> Option<Arc<SessionHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).by_imei.get(imei).cloned()
    }

    /// Session by id.
    #[must_use]
    pub fn lookup_id(&self, session_id: u64) -> Option<Arc<SessionHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).by_id.get(&session_id).cloned()
    }

    /// Number of bound sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).by_imei.len()
    }

    /// Whether no session is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").field("len", &self.len()).finish()
    }
}
