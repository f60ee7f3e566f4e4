//! Forward registry (§4.3, §9): the concurrent `subdomain -> opener` map,
//! with a back-reference `connection -> subdomains` map for O(1) teardown.
//! Both maps live under one mutex; contention is rare (SSH events) or O(1)
//! per access (HTTP requests only clone the opener out).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::RegistryError;
use crate::ssh::opener::SharedOpener;

/// Opaque handle identifying one SSH connection for registry bookkeeping.
/// Generated once per accepted connection; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

impl ConnId {
    pub fn new() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct State {
    redirects: HashMap<String, SharedOpener>,
    owners: HashMap<ConnId, HashSet<String>>,
}

/// Process-wide subdomain registry. Cheap to clone (wraps an `Arc`).
#[derive(Clone, Default)]
pub struct ForwardRegistry {
    state: Arc<Mutex<State>>,
}

impl ForwardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(
        &self,
        conn: ConnId,
        subdomain: String,
        opener: SharedOpener,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock().unwrap();
        if state.redirects.contains_key(&subdomain) {
            return Err(RegistryError::AlreadyBound);
        }
        state.redirects.insert(subdomain.clone(), opener);
        state.owners.entry(conn).or_default().insert(subdomain);
        Ok(())
    }

    /// Idempotent: removing an absent subdomain is a no-op.
    pub fn unbind(&self, conn: ConnId, subdomain: &str) {
        let mut state = self.state.lock().unwrap();
        state.redirects.remove(subdomain);
        if let Some(owned) = state.owners.get_mut(&conn) {
            owned.remove(subdomain);
        }
    }

    /// Only the opener is cloned out under the lock; the lock is released
    /// before any I/O happens against it.
    pub fn resolve(&self, subdomain: &str) -> Result<SharedOpener, RegistryError> {
        let state = self.state.lock().unwrap();
        state
            .redirects
            .get(subdomain)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    /// Removes every subdomain owned by `conn`. Returns `NotFound` only if
    /// `conn` had no entries at all.
    pub fn shutdown(&self, conn: ConnId) -> Result<(), RegistryError> {
        let mut state = self.state.lock().unwrap();
        let Some(owned) = state.owners.remove(&conn) else {
            return Err(RegistryError::NotFound);
        };
        for subdomain in owned {
            state.redirects.remove(&subdomain);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ForwardInfo;
    use crate::ssh::opener::{ChannelOpener, OpenedChannel};
    use crate::error::OpenerError;
    use async_trait::async_trait;

    struct NullOpener;

    #[async_trait]
    impl ChannelOpener for NullOpener {
        async fn open(&self, _origin: &str) -> Result<OpenedChannel, OpenerError> {
            Err(OpenerError::ConnectionGone)
        }

        fn info(&self) -> &ForwardInfo {
            unreachable!("not exercised by registry tests")
        }
    }

    fn opener() -> SharedOpener {
        Arc::new(NullOpener)
    }

    #[test]
    fn bind_resolve_unbind() {
        let registry = ForwardRegistry::new();
        let conn = ConnId::new();
        registry.bind(conn, "sub".into(), opener()).unwrap();
        assert!(registry.resolve("sub").is_ok());
        registry.unbind(conn, "sub");
        assert_eq!(registry.resolve("sub").unwrap_err(), RegistryError::NotFound);
    }

    #[test]
    fn second_bind_of_same_subdomain_fails_and_keeps_first() {
        let registry = ForwardRegistry::new();
        let conn = ConnId::new();
        registry.bind(conn, "sub".into(), opener()).unwrap();
        let err = registry.bind(conn, "sub".into(), opener()).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyBound);
        assert!(registry.resolve("sub").is_ok());
    }

    #[test]
    fn unbind_is_idempotent() {
        let registry = ForwardRegistry::new();
        let conn = ConnId::new();
        registry.bind(conn, "sub".into(), opener()).unwrap();
        registry.unbind(conn, "sub");
        registry.unbind(conn, "sub");
        assert_eq!(registry.resolve("sub").unwrap_err(), RegistryError::NotFound);
    }

    #[test]
    fn shutdown_revokes_every_owned_subdomain() {
        let registry = ForwardRegistry::new();
        let conn = ConnId::new();
        registry.bind(conn, "a".into(), opener()).unwrap();
        registry.bind(conn, "b".into(), opener()).unwrap();
        registry.shutdown(conn).unwrap();
        assert_eq!(registry.resolve("a").unwrap_err(), RegistryError::NotFound);
        assert_eq!(registry.resolve("b").unwrap_err(), RegistryError::NotFound);
    }

    #[test]
    fn shutdown_of_unknown_connection_is_not_found() {
        let registry = ForwardRegistry::new();
        assert_eq!(registry.shutdown(ConnId::new()).unwrap_err(), RegistryError::NotFound);
    }

    #[test]
    fn different_connections_do_not_interfere() {
        let registry = ForwardRegistry::new();
        let a = ConnId::new();
        let b = ConnId::new();
        registry.bind(a, "sub-a".into(), opener()).unwrap();
        registry.bind(b, "sub-b".into(), opener()).unwrap();
        registry.shutdown(a).unwrap();
        assert_eq!(registry.resolve("sub-a").unwrap_err(), RegistryError::NotFound);
        assert!(registry.resolve("sub-b").is_ok());
    }
}
