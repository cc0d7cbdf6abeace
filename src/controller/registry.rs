use super::session::{Session, SessionError};
use super::{ControllerState, SessionId, SessionSink};
use crate::config::SessionConfig;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

#[derive(Default)]
struct Inner {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    last_id: AtomicU64,
}

/// Live sessions keyed by identity.
///
/// Cheap to clone; every clone refers to the same collection. The lock is
/// only held for map operations, never while calling into a session.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

/// Handle kept by sessions so they can remove themselves without keeping
/// the registry alive
#[derive(Clone)]
pub(crate) struct WeakRegistry {
    inner: Weak<Inner>,
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<Registry> {
        self.inner.upgrade().map(|inner| Registry { inner })
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Next identity; identities start at 1 and are never handed out twice
    pub(crate) fn next_id(&self) -> SessionId {
        SessionId(self.inner.last_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn register(&self, session: Arc<Session>) -> SessionId {
        let id = session.id();
        let previous = self.write_sessions().insert(id, session);
        debug_assert!(previous.is_none(), "session {} registered twice", id);
        id
    }

    pub fn find(&self, id: SessionId) -> Option<Arc<Session>> {
        self.read_sessions().get(&id).cloned()
    }

    pub(crate) fn unregister(&self, id: SessionId) -> Option<Arc<Session>> {
        self.write_sessions().remove(&id)
    }

    /// Start a session on an opened controller
    pub fn start_session(
        &self,
        transport: Box<dyn Transport>,
        sink: Arc<dyn SessionSink>,
        config: SessionConfig,
    ) -> Result<SessionId, SessionError> {
        Session::start(self, transport, sink, config)
    }

    /// No-op for unknown or stopping sessions
    pub fn set_vibration(&self, id: SessionId, small_motor: u8, big_motor: u8) {
        if let Some(session) = self.find(id) {
            session.set_vibration(small_motor, big_motor);
        }
    }

    /// Idempotent; the stop notification follows asynchronously
    pub fn stop_session(&self, id: SessionId) {
        if let Some(session) = self.find(id) {
            session.stop();
        }
    }

    pub fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = self.read_sessions().values().cloned().collect();
        for session in sessions {
            session.stop();
        }
    }

    pub fn state(&self, id: SessionId) -> Option<ControllerState> {
        self.find(id).map(|session| session.state())
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.read_sessions().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_sessions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn write_sessions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::ChannelSink;
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::collections::HashSet;
    use std::thread;

    fn idle_session(registry: &Registry) -> Arc<Session> {
        let (transport, _handle) = MockTransport::new();
        let (sink, _events) = ChannelSink::new();
        Arc::new(Session::new(
            registry.next_id(),
            Box::new(transport),
            sink,
            SessionConfig::default(),
        ))
    }

    #[test]
    fn register_then_find() {
        let registry = Registry::new();
        let session = idle_session(&registry);
        let id = registry.register(Arc::clone(&session));

        let found = registry.find(id).expect("registered session");
        assert!(Arc::ptr_eq(&found, &session));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(id).is_some());
        assert!(registry.find(id).is_none());
        assert!(registry.unregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn identities_are_not_reused() {
        let registry = Registry::new();
        let first = registry.register(idle_session(&registry));
        registry.unregister(first);
        let second = registry.register(idle_session(&registry));
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let registry = Registry::new();
        registry.set_vibration(SessionId(42), 1, 2);
        registry.stop_session(SessionId(42));
        assert_eq!(registry.state(SessionId(42)), None);
    }

    #[test]
    fn concurrent_registration() {
        let registry = Registry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    (0..25)
                        .map(|_| registry.register(idle_session(&registry)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("registering thread") {
                assert!(all.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(registry.len(), 200);

        for id in registry.ids() {
            assert!(registry.find(id).is_some());
            registry.unregister(id);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn dropped_registry_does_not_upgrade() {
        let registry = Registry::new();
        let weak = registry.downgrade();
        assert!(weak.upgrade().is_some());
        drop(registry);
        assert!(weak.upgrade().is_none());
    }
}
