//! Delivers one event to every connected participant of a conversation.

use crate::coalescing::CoalescingService;
use crate::error::RelayError;
use crate::protocol::{ChatId, ServerEvent, UserId};
use crate::store::ChatStore;
use crate::ws::registry::ConnectionRegistry;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Resolves participants through the store and writes to their handles.
pub struct FanOut<S: ChatStore> {
    registry: ConnectionRegistry,
    store: Arc<S>,
    lookups: CoalescingService<ChatId, Vec<UserId>>,
}

impl<S: ChatStore> FanOut<S> {
    pub fn new(registry: ConnectionRegistry, store: Arc<S>, lookup_timeout: Duration) -> Self {
        Self {
            registry,
            store,
            lookups: CoalescingService::with_timeout(lookup_timeout),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Current participants of a conversation. Concurrent calls for the same
    /// conversation share one store lookup.
    pub async fn participants(&self, chat_id: &str) -> Result<Arc<Vec<UserId>>, RelayError> {
        let store = Arc::clone(&self.store);
        let key = chat_id.to_string();
        self.lookups
            .execute(key.clone(), move || async move { store.participants(&key).await })
            .await
            .map_err(|source| RelayError::ConversationNotFound {
                chat_id: chat_id.to_string(),
                source,
            })
    }

    /// Fails with [`RelayError::AccessDenied`] unless `user_id` is a listed
    /// participant of the conversation.
    pub async fn ensure_participant(&self, chat_id: &str, user_id: &str) -> Result<(), RelayError> {
        let participants = self.participants(chat_id).await?;
        if participants.iter().any(|p| p == user_id) {
            Ok(())
        } else {
            Err(RelayError::AccessDenied {
                user_id: user_id.to_string(),
                chat_id: chat_id.to_string(),
            })
        }
    }

    /// Sends `event` to every connected participant except `exclude` and
    /// returns how many deliveries succeeded.
    ///
    /// A failed delivery is logged and skipped; it never fails the broadcast.
    /// Only an unresolvable participant list does.
    #[instrument(level = "debug", skip(self, event), fields(kind = event.kind()))]
    pub async fn broadcast_to_conversation(
        &self,
        chat_id: &str,
        event: &ServerEvent,
        exclude: Option<&str>,
    ) -> Result<usize, RelayError> {
        let participants = self.participants(chat_id).await?;
        let frame = event.encode()?;

        // Handles are collected under the read lock; the writes happen after it
        // is released.
        let recipients = self.registry.handles_for(&participants, exclude).await;
        if recipients.is_empty() {
            debug!("No connected recipients.");
            return Ok(0);
        }

        let mut sends = Vec::with_capacity(recipients.len());
        for handle in &recipients {
            sends.push(self.registry.deliver(handle, &frame));
        }
        let outcomes = join_all(sends).await;

        let mut delivered = 0;
        for (handle, outcome) in recipients.iter().zip(outcomes) {
            match outcome {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    user_id = %handle.user_id(),
                    conn_id = %handle.conn_id(),
                    "Failed to deliver event: {}",
                    e
                ),
            }
        }

        debug!(delivered, recipients = recipients.len(), "Broadcast complete.");
        Ok(delivered)
    }
}

impl<S: ChatStore> std::fmt::Debug for FanOut<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut")
            .field("registry", &self.registry)
            .field("lookups", &self.lookups)
            .finish()
    }
}
