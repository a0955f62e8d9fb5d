//! An in-process [`ChatStore`] used for tests and single-node local runs.

use crate::auth::{AuthError, TokenValidator};
use crate::error::StoreError;
use crate::protocol::{ChatId, ChatMessage, ChatSummary, UserId};
use crate::store::{ChatStore, MessageStream, SYSTEM_SENDER};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const COMMIT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct StoredMessage {
    message: ChatMessage,
    read_by: HashSet<UserId>,
}

#[derive(Debug)]
struct ChatRecord {
    summary: ChatSummary,
    messages: Vec<StoredMessage>,
}

/// Conversations, messages and tokens held in memory.
///
/// Commits are published on one `broadcast` channel per conversation, which
/// backs [`ChatStore::subscribe_latest_message`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    chats: DashMap<ChatId, ChatRecord>,
    commits: DashMap<ChatId, broadcast::Sender<ChatMessage>>,
    tokens: DashMap<String, UserId>,
    subscriptions: AtomicUsize,
    failing_subscriptions: AtomicUsize,
    failing_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a conversation and commits its `system` welcome message.
    ///
    /// This is the out-of-band creation path: nothing on the relay is told
    /// about it except through the store's commit stream.
    pub fn create_chat(
        &self,
        name: &str,
        kind: &str,
        created_by: &str,
        participants: &[&str],
    ) -> ChatSummary {
        let mut members: Vec<UserId> = Vec::with_capacity(participants.len() + 1);
        for user in std::iter::once(&created_by).chain(participants) {
            if !members.iter().any(|m| m == user) {
                members.push(user.to_string());
            }
        }

        let summary = ChatSummary {
            chat_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            participants: members,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        };

        self.chats.insert(
            summary.chat_id.clone(),
            ChatRecord {
                summary: summary.clone(),
                messages: Vec::new(),
            },
        );

        if let Err(e) = self.commit(
            &summary.chat_id,
            SYSTEM_SENDER,
            &format!("Chat '{}' created", name),
        ) {
            debug!(chat_id = %summary.chat_id, "Welcome message not written: {}", e);
        }

        summary
    }

    /// Stores a credential that resolves to `user_id`.
    pub fn insert_token(&self, token: impl Into<String>, user_id: impl Into<UserId>) {
        self.tokens.insert(token.into(), user_id.into());
    }

    /// Issues a fresh random credential for `user_id`.
    pub fn issue_token(&self, user_id: &str) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.insert_token(token.clone(), user_id);
        token
    }

    /// All committed messages of a conversation, oldest first.
    pub fn messages(&self, chat_id: &str) -> Vec<ChatMessage> {
        self.chats
            .get(chat_id)
            .map(|c| c.messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Users who have read a message.
    pub fn read_by(&self, chat_id: &str, message_id: &str) -> Vec<UserId> {
        let Some(chat) = self.chats.get(chat_id) else {
            return Vec::new();
        };
        let mut readers: Vec<UserId> = chat
            .messages
            .iter()
            .find(|m| m.message.id == message_id)
            .map(|m| m.read_by.iter().cloned().collect())
            .unwrap_or_default();
        readers.sort();
        readers
    }

    /// Number of `subscribe_latest_message` calls served so far.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Makes the next `n` subscription attempts fail with a transient error.
    pub fn fail_next_subscriptions(&self, n: usize) {
        self.failing_subscriptions.store(n, Ordering::SeqCst);
    }

    /// Makes appends fail until switched back off.
    pub fn fail_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    /// Ends every open subscription on a conversation, as a dropped
    /// connection to a remote store would.
    pub fn interrupt_subscriptions(&self, chat_id: &str) {
        self.commits.remove(chat_id);
    }

    fn commit_sender(&self, chat_id: &str) -> broadcast::Sender<ChatMessage> {
        self.commits
            .entry(chat_id.to_string())
            .or_insert_with(|| broadcast::channel(COMMIT_CHANNEL_CAPACITY).0)
            .value()
            .clone()
    }

    fn take_subscription_failure(&self) -> bool {
        self.failing_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn commit(&self, chat_id: &str, sender_id: &str, text: &str) -> Result<ChatMessage, StoreError> {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        };

        let mut chat = self
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;
        chat.messages.push(StoredMessage {
            message: message.clone(),
            read_by: HashSet::from([sender_id.to_string()]),
        });

        // Published while the record is still locked so notification order
        // matches commit order. No receivers is not an error.
        let _ = self.commit_sender(chat_id).send(message.clone());
        drop(chat);

        Ok(message)
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn participants(&self, chat_id: &str) -> Result<Vec<UserId>, StoreError> {
        self.chats
            .get(chat_id)
            .map(|c| c.summary.participants.clone())
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))
    }

    async fn user_chats(&self, user_id: &str) -> Result<Vec<ChatId>, StoreError> {
        Ok(self
            .chats
            .iter()
            .filter(|c| c.summary.participants.iter().any(|p| p == user_id))
            .map(|c| c.key().clone())
            .collect())
    }

    async fn append_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<ChatMessage, StoreError> {
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write(format!("append to {} rejected", chat_id)));
        }
        self.commit(chat_id, sender_id, text)
    }

    async fn subscribe_latest_message(&self, chat_id: &str) -> Result<MessageStream, StoreError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        if self.take_subscription_failure() {
            return Err(StoreError::Transient(format!(
                "subscription to {} refused",
                chat_id
            )));
        }

        // Subscribe before reading the latest record so no commit falls in
        // between; a commit seen twice is filtered downstream by message id.
        let rx = self.commit_sender(chat_id).subscribe();
        let latest = self
            .chats
            .get(chat_id)
            .and_then(|c| c.messages.last().map(|m| m.message.clone()));

        let live = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(message) => Some((Ok(message), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                    Err(StoreError::Transient(format!(
                        "subscriber lagged by {} commits",
                        skipped
                    ))),
                    rx,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(stream::iter(latest.map(Ok)).chain(live).boxed())
    }

    async fn record_read(
        &self,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        let mut chat = self
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::NotFound(format!("chat {}", chat_id)))?;
        let message = chat
            .messages
            .iter_mut()
            .find(|m| m.message.id == message_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {}", message_id)))?;
        message.read_by.insert(user_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl TokenValidator for MemoryStore {
    type User = UserId;
    type Error = AuthError;

    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
        self.tokens
            .get(token)
            .map(|user| user.value().clone())
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn create_chat_writes_welcome_message() {
        let store = MemoryStore::new();
        let chat = store.create_chat("Team", "group", "alice", &["bob", "alice"]);

        assert_eq!(chat.participants, vec!["alice".to_string(), "bob".to_string()]);
        let messages = store.messages(&chat.chat_id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_id, SYSTEM_SENDER);
        assert_eq!(messages[0].text, "Chat 'Team' created");
    }

    #[tokio::test]
    async fn subscription_replays_latest_then_streams_commits() {
        let store = MemoryStore::new();
        let chat = store.create_chat("Team", "group", "alice", &["bob"]);

        let mut stream = store.subscribe_latest_message(&chat.chat_id).await.unwrap();
        let replayed = stream.next().await.unwrap().unwrap();
        assert_eq!(replayed.sender_id, SYSTEM_SENDER);

        let sent = store.append_message(&chat.chat_id, "bob", "yo").await.unwrap();
        let live = timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(live, sent);
    }

    #[tokio::test]
    async fn interrupted_subscription_ends_stream() {
        let store = MemoryStore::new();
        let chat = store.create_chat("Team", "group", "alice", &["bob"]);
        let mut stream = store.subscribe_latest_message(&chat.chat_id).await.unwrap();
        let _ = stream.next().await;

        store.interrupt_subscriptions(&chat.chat_id);
        let end = timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_counted() {
        let store = MemoryStore::new();
        store.fail_next_subscriptions(1);

        assert!(matches!(
            store.subscribe_latest_message("c1").await,
            Err(StoreError::Transient(_))
        ));
        assert!(store.subscribe_latest_message("c1").await.is_ok());
        assert_eq!(store.subscription_count(), 2);
    }

    #[tokio::test]
    async fn lookups_and_read_receipts() {
        let store = MemoryStore::new();
        let chat = store.create_chat("Pair", "private", "alice", &["bob"]);
        store.create_chat("Other", "private", "carol", &["dave"]);

        assert_eq!(store.user_chats("bob").await.unwrap(), vec![chat.chat_id.clone()]);
        assert!(matches!(
            store.participants("missing").await,
            Err(StoreError::NotFound(_))
        ));

        let msg = store.append_message(&chat.chat_id, "alice", "hi").await.unwrap();
        store.record_read(&chat.chat_id, &msg.id, "bob").await.unwrap();
        assert_eq!(
            store.read_by(&chat.chat_id, &msg.id),
            vec!["alice".to_string(), "bob".to_string()]
        );
        assert!(matches!(
            store.record_read(&chat.chat_id, "nope", "bob").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tokens_resolve_to_users() {
        let store = MemoryStore::new();
        let token = store.issue_token("alice");

        assert_eq!(store.validate_token(&token).await.unwrap(), "alice");
        assert!(store.validate_token("forged").await.is_err());
    }
}
