//! Per-conversation change listeners.
//!
//! A listener bridges the store's commit stream for one conversation to the
//! fan-out engine. At most one runs per conversation. Connections take a
//! reference on the listeners of the conversations they belong to, and the
//! last reference to go cancels the watch.

use crate::protocol::{ChatId, ChatMessage, ServerEvent};
use crate::store::ChatStore;
use crate::ws::fanout::FanOut;
use crate::ws::types::{ConnectionId, ListenerEntry, SharedState};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub struct ListenerManager<S: ChatStore> {
    state: SharedState,
    store: Arc<S>,
    fanout: Arc<FanOut<S>>,
    backoff: Duration,
}

impl<S: ChatStore> ListenerManager<S> {
    /// `backoff` is how long a watch waits before resubscribing after its
    /// subscription failed or ended.
    pub fn new(store: Arc<S>, fanout: Arc<FanOut<S>>, backoff: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::clone(fanout.registry().state()),
            store,
            fanout,
            backoff,
        })
    }

    /// Starts watching a conversation unless a watch already exists.
    ///
    /// Returns `true` if this call started the watch. A listener started this
    /// way holds no connection reference; it runs until the last connection
    /// that later acquired it releases it, or until [`stop_all`](Self::stop_all).
    pub async fn ensure_listener(self: &Arc<Self>, chat_id: &str) -> bool {
        let (generation, token) = {
            let mut state = self.state.write().await;
            if state.listeners.contains_key(chat_id) {
                return false;
            }
            let entry = ListenerEntry::new(0);
            let started = (entry.generation, entry.token.clone());
            state.listeners.insert(chat_id.to_string(), entry);
            started
        };

        self.spawn_watch(chat_id.to_string(), generation, token);
        true
    }

    /// Records that connection `conn_id` of `user_id` wants live updates for
    /// `chat_id`, starting the listener if needed.
    ///
    /// Returns `false` without effect when the connection is no longer the
    /// registered one for the user, or already holds a reference.
    pub async fn acquire(self: &Arc<Self>, user_id: &str, conn_id: ConnectionId, chat_id: &str) -> bool {
        let started = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;

            let Some(connection) = state.connections.get_mut(user_id) else {
                return false;
            };
            if connection.handle.conn_id() != conn_id || !connection.chats.insert(chat_id.to_string())
            {
                return false;
            }

            match state.listeners.get_mut(chat_id) {
                Some(entry) => {
                    entry.interest += 1;
                    None
                }
                None => {
                    let entry = ListenerEntry::new(1);
                    let started = (entry.generation, entry.token.clone());
                    state.listeners.insert(chat_id.to_string(), entry);
                    Some(started)
                }
            }
        };

        if let Some((generation, token)) = started {
            self.spawn_watch(chat_id.to_string(), generation, token);
        }
        true
    }

    /// Drops one reference on each listed conversation's listener, cancelling
    /// listeners whose count reaches zero.
    pub async fn release_interest<I>(&self, chats: I)
    where
        I: IntoIterator<Item = ChatId>,
    {
        let mut state = self.state.write().await;
        for chat_id in chats {
            let Some(entry) = state.listeners.get_mut(&chat_id) else {
                continue;
            };
            entry.interest = entry.interest.saturating_sub(1);
            if entry.interest == 0 {
                if let Some(entry) = state.listeners.remove(&chat_id) {
                    entry.token.cancel();
                    debug!(%chat_id, "Last reference released; listener cancelled.");
                }
            }
        }
    }

    /// Claims a message for delivery by the direct send path.
    ///
    /// Returns `false` if it was already delivered live, by a listener or by
    /// an earlier direct send.
    pub(crate) async fn claim_direct(&self, chat_id: &str, message_id: &str) -> bool {
        let mut state = self.state.write().await;
        state.delivered.claim(chat_id, message_id)
    }

    /// Like [`claim_direct`](Self::claim_direct), but only while `generation`
    /// is still the conversation's current watch.
    async fn claim_for_listener(&self, chat_id: &str, generation: Uuid, message_id: &str) -> bool {
        let mut state = self.state.write().await;
        let current = state
            .listeners
            .get(chat_id)
            .is_some_and(|entry| entry.generation == generation);
        current && state.delivered.claim(chat_id, message_id)
    }

    fn spawn_watch(self: &Arc<Self>, chat_id: ChatId, generation: Uuid, token: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.watch(chat_id, generation, token).await;
        });
    }

    #[instrument(skip(self, generation, token), fields(generation = %generation))]
    async fn watch(&self, chat_id: ChatId, generation: Uuid, token: CancellationToken) {
        info!("Listener started.");

        'watch: loop {
            let subscribed = tokio::select! {
                _ = token.cancelled() => break 'watch,
                result = self.store.subscribe_latest_message(&chat_id) => result,
            };

            match subscribed {
                Ok(mut stream) => loop {
                    let next = tokio::select! {
                        _ = token.cancelled() => break 'watch,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(message)) => self.relay_commit(&chat_id, generation, message).await,
                        Some(Err(e)) => {
                            warn!("Subscription error: {}. Resubscribing in {:?}.", e, self.backoff);
                            break;
                        }
                        None => {
                            warn!("Subscription ended. Resubscribing in {:?}.", self.backoff);
                            break;
                        }
                    }
                },
                Err(e) => {
                    warn!("Failed to subscribe: {}. Retrying in {:?}.", e, self.backoff);
                }
            }

            tokio::select! {
                _ = token.cancelled() => break 'watch,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        self.remove_entry(&chat_id, generation).await;
        info!("Listener stopped.");
    }

    async fn relay_commit(&self, chat_id: &str, generation: Uuid, message: ChatMessage) {
        if !self.claim_for_listener(chat_id, generation, &message.id).await {
            debug!(message_id = %message.id, "Commit already delivered; skipping.");
            return;
        }

        let sender = message.sender_id.clone();
        let event = ServerEvent::NewMessage(message);
        match self
            .fanout
            .broadcast_to_conversation(chat_id, &event, Some(&sender))
            .await
        {
            Ok(delivered) => debug!(delivered, "Relayed commit."),
            Err(e) => warn!("Failed to relay commit: {}", e),
        }
    }

    /// Removes the listener entry only if it still belongs to `generation`.
    async fn remove_entry(&self, chat_id: &str, generation: Uuid) {
        let mut state = self.state.write().await;
        if state
            .listeners
            .get(chat_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            state.listeners.remove(chat_id);
        }
    }

    /// Cancels every listener and clears the map. Returns how many were
    /// running.
    pub async fn stop_all(&self) -> usize {
        let mut state = self.state.write().await;
        let count = state.listeners.len();
        for (_, entry) in state.listeners.drain() {
            entry.token.cancel();
        }
        info!(count, "All listeners stopped.");
        count
    }

    pub async fn active_listeners(&self) -> Vec<ChatId> {
        let state = self.state.read().await;
        let mut chats: Vec<ChatId> = state.listeners.keys().cloned().collect();
        chats.sort();
        chats
    }

    /// Number of connections holding a reference on the conversation's
    /// listener, or `None` if it is not watched.
    pub async fn interest(&self, chat_id: &str) -> Option<usize> {
        let state = self.state.read().await;
        state.listeners.get(chat_id).map(|entry| entry.interest)
    }
}

impl<S: ChatStore> std::fmt::Debug for ListenerManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerManager")
            .field("backoff", &self.backoff)
            .finish()
    }
}
