//! The `RelayService`: connection lifecycle, and the entry point every other
//! write path uses to reach live connections.

use crate::auth::TokenValidator;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::protocol::{ChatSummary, ServerEvent, UserId};
use crate::store::ChatStore;
use crate::ws::fanout::FanOut;
use crate::ws::listener::ListenerManager;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::types::{CLOSE_GOING_AWAY, CLOSE_IDLE, CLOSE_REPLACED, ConnectionHandle};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Owns the registry, the fan-out engine and the listener manager, and runs
/// one read loop per connection.
///
/// Generic over the [`ChatStore`] so the same relay runs against Redis in
/// production and an in-memory store in tests.
pub struct RelayService<S: ChatStore> {
    store: Arc<S>,
    registry: ConnectionRegistry,
    fanout: Arc<FanOut<S>>,
    listeners: Arc<ListenerManager<S>>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl<S: ChatStore> RelayService<S> {
    pub fn new(store: Arc<S>, config: &RelayConfig) -> Arc<Self> {
        let registry = ConnectionRegistry::new(config.send_timeout);
        let fanout = Arc::new(FanOut::new(
            registry.clone(),
            Arc::clone(&store),
            config.lookup_timeout,
        ));
        let listeners =
            ListenerManager::new(Arc::clone(&store), Arc::clone(&fanout), config.listener_backoff);

        Arc::new(Self {
            store,
            registry,
            fanout,
            listeners,
            idle_timeout: config.idle_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn fanout(&self) -> &FanOut<S> {
        &self.fanout
    }

    pub fn listeners(&self) -> &Arc<ListenerManager<S>> {
        &self.listeners
    }

    /// Entry point for an upgraded socket.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, user_id: UserId) {
        let (sink, stream) = socket.split();
        self.serve_connection(user_id, sink, stream).await;
    }

    /// Registers the connection, then runs its read loop until it ends.
    pub async fn serve_connection<Si, St>(self: &Arc<Self>, user_id: UserId, sink: Si, stream: St)
    where
        Si: Sink<Message, Error = axum::Error> + Send + 'static,
        St: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
    {
        let handle = self.connect(user_id, sink).await;
        self.run(handle, stream).await;
    }

    /// Creates and registers a handle for a freshly authenticated connection.
    ///
    /// A previous connection of the same user is closed with
    /// [`CLOSE_REPLACED`]. Listener references are then taken for every
    /// conversation the user belongs to; a failed lookup is logged and the
    /// connection proceeds without them.
    #[instrument(skip(self, sink))]
    pub async fn connect<Si>(self: &Arc<Self>, user_id: UserId, sink: Si) -> ConnectionHandle
    where
        Si: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        let handle = ConnectionHandle::new(user_id, sink);

        if let Some(evicted) = self.registry.register(handle.clone()).await {
            info!(evicted = %evicted.conn_id(), "Replacing existing connection.");
            self.registry
                .close(&evicted, CLOSE_REPLACED, "replaced by a newer connection")
                .await;
        }

        self.attach_conversations(&handle).await;
        info!(conn_id = %handle.conn_id(), "Client connected.");
        handle
    }

    async fn attach_conversations(self: &Arc<Self>, handle: &ConnectionHandle) {
        let chats = match self.store.user_chats(handle.user_id()).await {
            Ok(chats) => chats,
            Err(e) => {
                warn!("Failed to load the user's conversations: {}", e);
                return;
            }
        };

        for chat_id in &chats {
            self.listeners
                .acquire(handle.user_id(), handle.conn_id(), chat_id)
                .await;
        }
        debug!(count = chats.len(), "Attached conversations.");
    }

    /// The read loop. Returns once the peer closes, the socket errors, the
    /// idle timeout fires or the service shuts down; the connection is
    /// deregistered on the way out.
    #[instrument(skip_all, fields(user_id = %handle.user_id(), conn_id = %handle.conn_id()))]
    pub async fn run<St>(&self, handle: ConnectionHandle, mut stream: St)
    where
        St: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
    {
        debug!("Starting message receiver loop for client.");
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = tokio::time::timeout(self.idle_timeout, stream.next()) => next,
            };

            let message = match next {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => {
                    debug!("Socket read failed: {}", e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    info!("Closing idle connection.");
                    self.registry.close(&handle, CLOSE_IDLE, "idle timeout").await;
                    break;
                }
            };

            handle.touch();
            match message {
                Message::Text(text) => self.dispatch_frame(&handle, text.as_str()).await,
                Message::Close(_) => {
                    debug!("Received close frame from client.");
                    break;
                }
                _ => {}
            }
        }

        self.disconnect(&handle).await;
    }

    /// Deregisters the handle if it still owns the user's slot and releases
    /// its listener references.
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        match self.registry.release(handle.user_id(), handle.conn_id()).await {
            Some(chats) => {
                self.listeners.release_interest(chats).await;
                info!("Client disconnected.");
            }
            None => debug!("Connection was already replaced or removed."),
        }
    }

    /// Removes a user's connection from the registry, whichever connection
    /// holds the slot, and releases its listener references. The socket is
    /// left open; its read loop finds the slot gone when it ends.
    pub async fn deregister(&self, user_id: &str) -> bool {
        match self.registry.deregister(user_id).await {
            Some(chats) => {
                self.listeners.release_interest(chats).await;
                info!(user_id, "Connection deregistered.");
                true
            }
            None => false,
        }
    }

    /// Announces a conversation created outside the relay.
    ///
    /// Runs as its own task: connected participants other than `exclude` get
    /// `chat_created`, and every connected participant takes a listener
    /// reference on the new conversation. Await the returned [`Notification`]
    /// for the delivered count, or drop it to let the task run detached.
    pub fn notify_chat_created(self: &Arc<Self>, chat: ChatSummary, exclude: Option<UserId>) -> Notification {
        let service = Arc::clone(self);
        Notification {
            task: tokio::spawn(async move { service.announce_chat(chat, exclude).await }),
        }
    }

    #[instrument(skip(self, chat), fields(chat_id = %chat.chat_id))]
    async fn announce_chat(
        self: Arc<Self>,
        chat: ChatSummary,
        exclude: Option<UserId>,
    ) -> Result<usize, RelayError> {
        let chat_id = chat.chat_id.clone();
        let participants = chat.participants.clone();
        let event = ServerEvent::ChatCreated(chat);

        let delivered = self
            .fanout
            .broadcast_to_conversation(&chat_id, &event, exclude.as_deref())
            .await?;

        for user_id in &participants {
            if let Some(handle) = self.registry.lookup(user_id).await {
                self.listeners
                    .acquire(user_id, handle.conn_id(), &chat_id)
                    .await;
            }
        }

        info!(delivered, "Announced new conversation.");
        Ok(delivered)
    }

    pub async fn broadcast_to_conversation(
        &self,
        chat_id: &str,
        event: &ServerEvent,
        exclude: Option<&str>,
    ) -> Result<usize, RelayError> {
        self.fanout
            .broadcast_to_conversation(chat_id, event, exclude)
            .await
    }

    pub async fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> Result<(), RelayError> {
        self.registry.send_to_user(user_id, event).await
    }

    /// Stops every listener and closes every connection.
    pub async fn shutdown(&self) {
        info!("Shutting down relay.");
        self.listeners.stop_all().await;
        for handle in self.registry.drain().await {
            self.registry
                .close(&handle, CLOSE_GOING_AWAY, "server shutting down")
                .await;
        }
        // Read loops end last so none of them deregisters ahead of the drain.
        self.shutdown.cancel();
    }
}

impl<S: ChatStore> std::fmt::Debug for RelayService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayService")
            .field("registry", &self.registry)
            .field("listeners", &self.listeners)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// Credentials are resolved by the store the relay runs against.
#[async_trait]
impl<S> TokenValidator for RelayService<S>
where
    S: ChatStore + TokenValidator<User = UserId>,
{
    type User = UserId;
    type Error = S::Error;

    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
        self.store.validate_token(token).await
    }
}

/// Handle on a running chat-created announcement.
///
/// Resolves to the number of participants the event reached. Dropping it
/// does not cancel the announcement.
#[derive(Debug)]
pub struct Notification {
    task: JoinHandle<Result<usize, RelayError>>,
}

impl Future for Notification {
    type Output = Result<usize, RelayError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(RelayError::Task(e.to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{TestClient, init_tracing, test_config, wait_until};

    fn relay() -> (Arc<MemoryStore>, Arc<RelayService<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new());
        let service = RelayService::new(Arc::clone(&store), &test_config());
        (store, service)
    }

    #[tokio::test]
    async fn live_message_reaches_other_participant_once() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);

        let mut alice = TestClient::connect(&relay, "alice").await;
        let mut bob = TestClient::connect(&relay, "bob").await;
        alice.drain().await;
        bob.drain().await;

        alice
            .send(serde_json::json!({
                "type": "send_message",
                "data": { "chat_id": chat.chat_id, "text": "hi" }
            }))
            .await;

        let ack = alice.next_envelope().await;
        assert_eq!(ack.kind, "message_sent");
        assert_eq!(ack.data["chat_id"], chat.chat_id.as_str());

        let delivered = bob.next_envelope().await;
        assert_eq!(delivered.kind, "new_message");
        assert_eq!(delivered.data["text"], "hi");
        assert_eq!(delivered.data["sender_id"], "alice");
        assert_eq!(delivered.data["id"], ack.data["message_id"]);

        // Neither the direct path nor the listener echo it back to alice, and
        // bob gets it once.
        alice.assert_silent().await;
        bob.assert_silent().await;
        assert_eq!(store.messages(&chat.chat_id).len(), 2);
    }

    #[tokio::test]
    async fn delivered_message_is_not_replayed_after_reconnect() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);

        let mut alice = TestClient::connect(&relay, "alice").await;
        let mut bob = TestClient::connect(&relay, "bob").await;
        alice.drain().await;
        bob.drain().await;

        alice
            .send(serde_json::json!({
                "type": "send_message",
                "data": { "chat_id": chat.chat_id, "text": "hi" }
            }))
            .await;
        assert_eq!(bob.next_envelope().await.data["text"], "hi");

        alice.hang_up();
        bob.hang_up();
        wait_until(|| alice.is_finished() && bob.is_finished()).await;
        assert!(relay.listeners().active_listeners().await.is_empty());

        // The new watch replays "hi" as the latest message; bob already has it.
        let mut bob = TestClient::connect(&relay, "bob").await;
        wait_until(|| store.subscription_count() >= 2).await;
        bob.assert_silent().await;

        store.append_message(&chat.chat_id, "alice", "welcome back").await.unwrap();
        assert_eq!(bob.next_envelope().await.data["text"], "welcome back");
    }

    #[tokio::test]
    async fn typing_start_and_stop_arrive_in_order() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);

        let mut alice = TestClient::connect(&relay, "alice").await;
        let mut bob = TestClient::connect(&relay, "bob").await;
        alice.drain().await;
        bob.drain().await;

        for is_typing in [true, false] {
            alice
                .send(serde_json::json!({
                    "type": "typing",
                    "chat_id": chat.chat_id,
                    "data": { "is_typing": is_typing }
                }))
                .await;
        }

        let started = bob.next_envelope().await;
        let stopped = bob.next_envelope().await;
        assert_eq!(started.kind, "user_typing");
        assert_eq!(started.data["is_typing"], true);
        assert_eq!(stopped.kind, "user_typing");
        assert_eq!(stopped.data["is_typing"], false);
        bob.assert_silent().await;
    }

    #[tokio::test]
    async fn non_participant_gets_local_error_only() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);

        let mut alice = TestClient::connect(&relay, "alice").await;
        let mut carol = TestClient::connect(&relay, "carol").await;
        alice.drain().await;

        carol
            .send(serde_json::json!({
                "type": "send_message",
                "data": { "chat_id": chat.chat_id, "text": "let me in" }
            }))
            .await;

        let err = carol.next_envelope().await;
        assert_eq!(err.kind, "error");
        assert_eq!(err.data["error"], "Not a chat participant");
        alice.assert_silent().await;
        assert_eq!(store.messages(&chat.chat_id).len(), 1);
    }

    #[tokio::test]
    async fn validation_and_store_failures_are_reported() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);
        let mut alice = TestClient::connect(&relay, "alice").await;
        alice.drain().await;

        alice
            .send(serde_json::json!({ "type": "send_message", "data": { "chat_id": chat.chat_id } }))
            .await;
        assert_eq!(
            alice.next_envelope().await.data["error"],
            "chat_id and text are required"
        );

        alice.send_raw("{not json").await;
        assert_eq!(alice.next_envelope().await.data["error"], "Invalid message format");

        store.fail_writes(true);
        alice
            .send(serde_json::json!({
                "type": "send_message",
                "data": { "chat_id": chat.chat_id, "text": "lost" }
            }))
            .await;
        assert_eq!(alice.next_envelope().await.data["error"], "Failed to send message");

        // Unknown types are ignored silently.
        alice.send(serde_json::json!({ "type": "dance", "data": {} })).await;
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn typing_fans_out_to_everyone_but_the_typist() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Team", "group", "alice", &["bob", "carol"]);

        let mut alice = TestClient::connect(&relay, "alice").await;
        let mut bob = TestClient::connect(&relay, "bob").await;
        let mut carol = TestClient::connect(&relay, "carol").await;
        for client in [&mut alice, &mut bob, &mut carol] {
            client.drain().await;
        }

        alice
            .send(serde_json::json!({
                "type": "typing",
                "chat_id": chat.chat_id,
                "data": { "is_typing": true }
            }))
            .await;

        for client in [&mut bob, &mut carol] {
            let env = client.next_envelope().await;
            assert_eq!(env.kind, "user_typing");
            assert_eq!(env.user_id.as_deref(), Some("alice"));
            assert_eq!(env.data["is_typing"], true);
        }
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn read_receipt_is_recorded_without_broadcast() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);
        let message = store
            .append_message(&chat.chat_id, "alice", "hello")
            .await
            .unwrap();

        let mut alice = TestClient::connect(&relay, "alice").await;
        let mut bob = TestClient::connect(&relay, "bob").await;
        alice.drain().await;
        bob.drain().await;

        bob.send(serde_json::json!({
            "type": "message_read",
            "data": { "chat_id": chat.chat_id, "message_id": message.id }
        }))
        .await;

        wait_until(|| store.read_by(&chat.chat_id, &message.id).len() == 2).await;
        alice.assert_silent().await;
        bob.assert_silent().await;
    }

    #[tokio::test]
    async fn ping_echoes_payload() {
        init_tracing();
        let (_store, relay) = relay();
        let mut alice = TestClient::connect(&relay, "alice").await;

        alice
            .send(serde_json::json!({ "type": "ping", "data": { "nonce": 42 } }))
            .await;
        let pong = alice.next_envelope().await;
        assert_eq!(pong.kind, "pong");
        assert_eq!(pong.data["nonce"], 42);
    }

    #[tokio::test]
    async fn out_of_band_commit_reaches_connected_participants() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);

        let mut alice = TestClient::connect(&relay, "alice").await;
        let mut bob = TestClient::connect(&relay, "bob").await;
        alice.drain().await;
        bob.drain().await;

        // Written straight to the store; no connection sent it.
        store
            .append_message(&chat.chat_id, "alice", "from the api")
            .await
            .unwrap();

        let env = bob.next_envelope().await;
        assert_eq!(env.kind, "new_message");
        assert_eq!(env.data["text"], "from the api");
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn chat_created_notification_and_listener_attach() {
        init_tracing();
        let (store, relay) = relay();
        let mut alice = TestClient::connect(&relay, "alice").await;
        let mut bob = TestClient::connect(&relay, "bob").await;

        let chat = store.create_chat("Fresh", "private", "alice", &["bob"]);
        let delivered = relay
            .notify_chat_created(chat.clone(), Some("alice".to_string()))
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let created = bob.next_envelope().await;
        assert_eq!(created.kind, "chat_created");
        assert_eq!(created.data["name"], "Fresh");
        assert_eq!(relay.listeners().interest(&chat.chat_id).await, Some(2));

        alice.drain().await;
        bob.drain().await;
        store
            .append_message(&chat.chat_id, "alice", "first!")
            .await
            .unwrap();
        assert_eq!(bob.next_envelope().await.data["text"], "first!");
    }

    #[tokio::test]
    async fn chat_created_for_unknown_conversation_fails() {
        init_tracing();
        let (_store, relay) = relay();
        let ghost = ChatSummary {
            chat_id: "ghost".into(),
            name: "Ghost".into(),
            kind: "group".into(),
            participants: vec!["alice".into()],
            created_by: "alice".into(),
            created_at: chrono::Utc::now(),
        };

        let outcome = relay.notify_chat_created(ghost, None).await;
        assert!(matches!(outcome, Err(RelayError::ConversationNotFound { .. })));
    }

    #[tokio::test]
    async fn reconnect_closes_old_connection_and_keeps_slot() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);

        let mut first = TestClient::connect(&relay, "bob").await;
        let mut second = TestClient::connect(&relay, "bob").await;
        first.expect_close(CLOSE_REPLACED).await;
        first.hang_up();

        // The old connection leaving must not unregister the new one or drop
        // its listener reference.
        wait_until(|| first.is_finished()).await;
        assert!(relay.registry().lookup("bob").await.is_some());
        assert_eq!(relay.listeners().interest(&chat.chat_id).await, Some(1));

        second.drain().await;
        store.append_message(&chat.chat_id, "alice", "still here?").await.unwrap();
        assert_eq!(second.next_envelope().await.data["text"], "still here?");
    }

    #[tokio::test]
    async fn disconnect_releases_listeners() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);

        let alice = TestClient::connect(&relay, "alice").await;
        let bob = TestClient::connect(&relay, "bob").await;
        assert_eq!(relay.listeners().interest(&chat.chat_id).await, Some(2));

        alice.hang_up();
        wait_until(|| alice.is_finished()).await;
        assert_eq!(relay.listeners().interest(&chat.chat_id).await, Some(1));
        assert_eq!(relay.registry().connected_users().await, vec!["bob".to_string()]);

        bob.hang_up();
        wait_until(|| bob.is_finished()).await;
        assert!(relay.listeners().active_listeners().await.is_empty());
        assert_eq!(relay.registry().connected_count().await, 0);
    }

    #[tokio::test]
    async fn deregister_releases_listener_references() {
        init_tracing();
        let (store, relay) = relay();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);

        let alice = TestClient::connect(&relay, "alice").await;
        assert_eq!(relay.listeners().interest(&chat.chat_id).await, Some(1));

        assert!(relay.deregister("alice").await);
        assert!(relay.registry().lookup("alice").await.is_none());
        assert!(relay.listeners().active_listeners().await.is_empty());
        assert!(!relay.deregister("alice").await);

        // The read loop's own exit finds nothing left to release.
        alice.hang_up();
        wait_until(|| alice.is_finished()).await;
        assert!(relay.listeners().active_listeners().await.is_empty());
    }

    #[tokio::test]
    async fn idle_connection_is_closed() {
        init_tracing();
        let store = Arc::new(MemoryStore::new());
        let config = RelayConfig {
            idle_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let relay = RelayService::new(Arc::clone(&store), &config);

        let mut alice = TestClient::connect(&relay, "alice").await;
        alice.expect_close(CLOSE_IDLE).await;
        wait_until(|| alice.is_finished()).await;
        assert_eq!(relay.registry().connected_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        init_tracing();
        let (store, relay) = relay();
        store.create_chat("Pair", "private", "alice", &["bob"]);
        let mut alice = TestClient::connect(&relay, "alice").await;
        alice.drain().await;

        relay.shutdown().await;
        alice.expect_close(CLOSE_GOING_AWAY).await;
        wait_until(|| alice.is_finished()).await;
        assert!(relay.listeners().active_listeners().await.is_empty());
        assert_eq!(relay.registry().connected_count().await, 0);
    }

    #[tokio::test]
    async fn send_to_user_reaches_only_that_user() {
        init_tracing();
        let (_store, relay) = relay();
        let mut alice = TestClient::connect(&relay, "alice").await;
        let mut bob = TestClient::connect(&relay, "bob").await;

        relay
            .send_to_user("bob", &ServerEvent::error("direct"))
            .await
            .unwrap();
        assert_eq!(bob.next_envelope().await.data["error"], "direct");
        alice.assert_silent().await;
        assert!(matches!(
            relay.send_to_user("carol", &ServerEvent::error("x")).await,
            Err(RelayError::NotConnected(_))
        ));
    }
}
