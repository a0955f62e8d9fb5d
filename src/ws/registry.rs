//! The connection registry: which user is connected, through which handle.

use crate::error::RelayError;
use crate::protocol::{ChatId, ServerEvent, UserId};
use crate::ws::types::{ConnectionEntry, ConnectionHandle, ConnectionId, RelayState, SharedState};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Maps user ids to their live connection.
///
/// At most one handle exists per user; registering again replaces the
/// previous handle. Clones share the same underlying state.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    state: SharedState,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(RelayState::default())),
            send_timeout,
        }
    }

    pub(crate) fn state(&self) -> &SharedState {
        &self.state
    }

    /// Inserts or replaces the user's slot and returns the evicted handle, if
    /// any. Listener references held by the previous connection carry over to
    /// the new one.
    pub async fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let user_id = handle.user_id().to_string();
        let mut state = self.state.write().await;

        let (chats, evicted) = match state.connections.remove(&user_id) {
            Some(previous) => (previous.chats, Some(previous.handle)),
            None => (HashSet::new(), None),
        };
        state
            .connections
            .insert(user_id, ConnectionEntry { handle, chats });

        evicted
    }

    /// Removes the user's slot, whichever connection holds it. Returns the
    /// conversations the slot held listener references on; the caller owns
    /// releasing them.
    pub(crate) async fn deregister(&self, user_id: &str) -> Option<HashSet<ChatId>> {
        let mut state = self.state.write().await;
        state.connections.remove(user_id).map(|entry| entry.chats)
    }

    /// Removes the user's slot only if it still belongs to `conn_id`.
    ///
    /// A connection that was replaced must not tear down its successor on the
    /// way out.
    pub async fn release(&self, user_id: &str, conn_id: ConnectionId) -> Option<HashSet<ChatId>> {
        let mut state = self.state.write().await;
        match state.connections.get(user_id) {
            Some(entry) if entry.handle.conn_id() == conn_id => {
                state.connections.remove(user_id).map(|entry| entry.chats)
            }
            _ => None,
        }
    }

    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        let state = self.state.read().await;
        state.connections.get(user_id).map(|e| e.handle.clone())
    }

    /// Delivers one event to one user.
    ///
    /// Fails with [`RelayError::NotConnected`] if the user has no live handle.
    /// A write failure is returned as is and not retried.
    pub async fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> Result<(), RelayError> {
        let handle = self
            .lookup(user_id)
            .await
            .ok_or_else(|| RelayError::NotConnected(user_id.to_string()))?;
        let frame = event.encode()?;
        self.deliver(&handle, &frame).await
    }

    /// Writes a frame to a handle, bounded by the send timeout.
    pub(crate) async fn deliver(
        &self,
        handle: &ConnectionHandle,
        frame: &str,
    ) -> Result<(), RelayError> {
        match tokio::time::timeout(self.send_timeout, handle.send_text(frame)).await {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::SendTimeout(handle.user_id().to_string())),
        }
    }

    /// Sends a close frame, bounded by the send timeout. Failures are logged;
    /// a peer that is already gone needs no close.
    pub(crate) async fn close(&self, handle: &ConnectionHandle, code: u16, reason: &str) {
        match tokio::time::timeout(self.send_timeout, handle.close(code, reason)).await {
            Ok(Ok(())) => debug!(conn_id = %handle.conn_id(), code, "Sent close frame."),
            Ok(Err(e)) => debug!(conn_id = %handle.conn_id(), "Close frame not sent: {}", e),
            Err(_) => warn!(conn_id = %handle.conn_id(), "Timed out sending close frame."),
        }
    }

    /// Handles of the connected users among `users`, minus `exclude`.
    pub(crate) async fn handles_for(
        &self,
        users: &[UserId],
        exclude: Option<&str>,
    ) -> Vec<ConnectionHandle> {
        let state = self.state.read().await;
        users
            .iter()
            .filter(|user| Some(user.as_str()) != exclude)
            .filter_map(|user| state.connections.get(user))
            .map(|entry| entry.handle.clone())
            .collect()
    }

    pub async fn connected_users(&self) -> Vec<UserId> {
        let state = self.state.read().await;
        let mut users: Vec<UserId> = state.connections.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn connected_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Empties the registry, returning every handle so the caller can close them.
    pub(crate) async fn drain(&self) -> Vec<ConnectionHandle> {
        let mut state = self.state.write().await;
        let handles: Vec<ConnectionHandle> =
            state.connections.drain().map(|(_, e)| e.handle).collect();
        info!(count = handles.len(), "Registry drained.");
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestPeer, init_tracing};

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn lookup_returns_registered_handle_until_deregistered() {
        init_tracing();
        let registry = registry();
        let (alice, _peer) = TestPeer::handle("alice");

        assert!(registry.register(alice.clone()).await.is_none());
        let found = registry.lookup("alice").await.unwrap();
        assert_eq!(found.conn_id(), alice.conn_id());

        assert!(registry.deregister("alice").await.is_some());
        assert!(registry.lookup("alice").await.is_none());
        // Absent is not an error.
        assert!(registry.deregister("alice").await.is_none());
    }

    #[tokio::test]
    async fn second_registration_replaces_the_first() {
        init_tracing();
        let registry = registry();
        let (first, _p1) = TestPeer::handle("alice");
        let (second, _p2) = TestPeer::handle("alice");

        registry.register(first.clone()).await;
        let evicted = registry.register(second.clone()).await.unwrap();
        assert_eq!(evicted.conn_id(), first.conn_id());
        assert_eq!(registry.connected_count().await, 1);
        assert_eq!(
            registry.lookup("alice").await.unwrap().conn_id(),
            second.conn_id()
        );

        // The evicted connection leaving must not remove its successor.
        assert!(registry.release("alice", first.conn_id()).await.is_none());
        assert!(registry.lookup("alice").await.is_some());
        assert!(registry.release("alice", second.conn_id()).await.is_some());
        assert!(registry.lookup("alice").await.is_none());
    }

    #[tokio::test]
    async fn send_to_unknown_user_is_not_connected() {
        init_tracing();
        let registry = registry();
        let err = registry
            .send_to_user("ghost", &ServerEvent::error("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotConnected(u) if u == "ghost"));
    }

    #[tokio::test]
    async fn sequential_sends_arrive_in_order() {
        init_tracing();
        let registry = registry();
        let (bob, mut peer) = TestPeer::handle("bob");
        registry.register(bob).await;

        for i in 0..20 {
            registry
                .send_to_user("bob", &ServerEvent::Pong(serde_json::json!({ "seq": i })))
                .await
                .unwrap();
        }

        for i in 0..20 {
            let env = peer.next_envelope().await;
            assert_eq!(env.kind, "pong");
            assert_eq!(env.data["seq"], i);
        }
    }

    #[tokio::test]
    async fn write_failure_is_surfaced() {
        init_tracing();
        let registry = registry();
        let (bob, peer) = TestPeer::handle("bob");
        registry.register(bob).await;
        drop(peer);

        let err = registry
            .send_to_user("bob", &ServerEvent::error("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Send(_)));
    }

    #[tokio::test]
    async fn send_updates_last_activity() {
        init_tracing();
        let registry = registry();
        let (bob, mut peer) = TestPeer::handle("bob");
        let before = bob.last_activity();
        registry.register(bob.clone()).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        registry
            .send_to_user("bob", &ServerEvent::error("x"))
            .await
            .unwrap();
        peer.next_envelope().await;
        assert!(bob.last_activity() > before);
    }

    #[tokio::test]
    async fn connected_users_are_sorted() {
        init_tracing();
        let registry = registry();
        let (b, _pb) = TestPeer::handle("bob");
        let (a, _pa) = TestPeer::handle("alice");
        registry.register(b).await;
        registry.register(a).await;

        assert_eq!(
            registry.connected_users().await,
            vec!["alice".to_string(), "bob".to_string()]
        );
        assert_eq!(registry.drain().await.len(), 2);
        assert_eq!(registry.connected_count().await, 0);
    }
}
