use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::PeerSession;
use crate::identity::PeerId;

/// Owns every live session. Sessions refer back to it only by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
}

impl SessionRegistry {
    /// Returns the session already registered under the same id, if any,
    /// instead of replacing it.
    pub fn insert(&self, session: Arc<PeerSession>) -> Arc<PeerSession> {
        let mut sessions = self.sessions.write();
        Arc::clone(
            sessions
                .entry(session.id().to_string())
                .or_insert(session),
        )
    }

    pub fn get(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn by_remote(&self, remote: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions
            .read()
            .values()
            .find(|session| session.remote().as_ref() == Some(remote))
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.write().remove(id)
    }

    /// Removes `session` only if it is still the registered instance.
    pub fn remove_exact(&self, session: &Arc<PeerSession>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.id());
                true
            }
            _ => false,
        }
    }

    pub fn all(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast;

    use super::*;
    use crate::config::PeerConfig;
    use crate::identity::{LocalIdentity, PeerProfile};
    use crate::racer::Role;
    use crate::session::SessionContext;

    #[test]
    fn racing_inserts_under_one_id_keep_a_single_session() {
        let (events, _) = broadcast::channel(16);
        let context = Arc::new(SessionContext::new(
            PeerConfig::default(),
            Arc::new(LocalIdentity::generate(PeerProfile::default())),
            events,
        ));
        let registry = SessionRegistry::default();
        let winners = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let context = Arc::clone(&context);
                    let registry = &registry;
                    scope.spawn(move || {
                        let session = PeerSession::new("shared", Role::Initiator, None, context);
                        Arc::ptr_eq(&registry.insert(Arc::clone(&session)), &session)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("insert thread"))
                .filter(|won| *won)
                .count()
        });
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
