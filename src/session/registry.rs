use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::store::models::Id;

/// Live connections keyed by (user id, session id), so administrative
/// shell commands can terminate them.
///
/// Each entry is a cancellation token; cancelling it unblocks both pump
/// directions of the session it belongs to.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<(Id, Id), CancellationToken>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back the token its pumps watch.
    pub fn add(&self, user_id: Id, session_id: Id) -> CancellationToken {
        let token = CancellationToken::new();
        self.connections.insert((user_id, session_id), token.clone());
        token
    }

    pub fn del(&self, user_id: Id, session_id: Id) {
        self.connections.remove(&(user_id, session_id));
    }

    pub fn lookup(&self, user_id: Id, session_id: Id) -> Option<CancellationToken> {
        self.connections
            .get(&(user_id, session_id))
            .map(|t| t.value().clone())
    }

    pub fn list_for_user(&self, user_id: Id) -> Vec<Id> {
        let mut ids: Vec<Id> = self
            .connections
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| e.key().1)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Cancel a connection by session id alone (the admin shell does not
    /// know the owner). Returns false when no such connection is live.
    pub fn disconnect(&self, session_id: Id) -> bool {
        for entry in self.connections.iter() {
            if entry.key().1 == session_id {
                entry.value().cancel();
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_lookup_del() {
        let registry = ConnectionRegistry::new();
        let token = registry.add(3, 10);
        assert!(registry.lookup(3, 10).is_some());
        assert!(registry.lookup(3, 11).is_none());

        registry.del(3, 10);
        assert!(registry.lookup(3, 10).is_none());
        // The handed-out token outlives deregistration.
        assert!(!token.is_cancelled());
    }

    #[test]
    fn list_for_user_is_scoped() {
        let registry = ConnectionRegistry::new();
        registry.add(3, 10);
        registry.add(3, 12);
        registry.add(4, 11);
        assert_eq!(registry.list_for_user(3), vec![10, 12]);
        assert_eq!(registry.list_for_user(5), Vec::<Id>::new());
    }

    #[test]
    fn disconnect_cancels_token() {
        let registry = ConnectionRegistry::new();
        let token = registry.add(3, 10);
        assert!(registry.disconnect(10));
        assert!(token.is_cancelled());
        assert!(!registry.disconnect(99));
    }
}
