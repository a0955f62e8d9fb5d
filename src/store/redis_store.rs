//! A [`ChatStore`] on Redis.
//!
//! Layout:
//! - `chat:{id}:summary` string, the conversation as JSON
//! - `chat:{id}:participants` set of user ids
//! - `user:{id}:chats` set of conversation ids
//! - `chat:{id}:messages` list of messages as JSON, oldest first
//! - `chat:{id}:message_ids` set of message ids
//! - `chat:{id}:message:{mid}:read_by` set of user ids
//! - `auth:token:{token}` string, the user id a credential resolves to
//!
//! Every append is published on `chat:{id}:commits` inside the same
//! `MULTI`, which is what subscriptions listen to.

use crate::auth::{AuthError, TokenValidator};
use crate::error::StoreError;
use crate::protocol::{ChatId, ChatMessage, ChatSummary, UserId};
use crate::store::{ChatStore, MessageStream, SYSTEM_SENDER};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

fn summary_key(chat_id: &str) -> String {
    format!("chat:{}:summary", chat_id)
}

fn participants_key(chat_id: &str) -> String {
    format!("chat:{}:participants", chat_id)
}

fn user_chats_key(user_id: &str) -> String {
    format!("user:{}:chats", user_id)
}

fn messages_key(chat_id: &str) -> String {
    format!("chat:{}:messages", chat_id)
}

fn message_ids_key(chat_id: &str) -> String {
    format!("chat:{}:message_ids", chat_id)
}

fn read_by_key(chat_id: &str, message_id: &str) -> String {
    format!("chat:{}:message:{}:read_by", chat_id, message_id)
}

fn token_key(token: &str) -> String {
    format!("auth:token:{}", token)
}

fn commits_channel(chat_id: &str) -> String {
    format!("chat:{}:commits", chat_id)
}

fn transient(e: redis::RedisError) -> StoreError {
    StoreError::Transient(e.to_string())
}

fn write_failed(e: redis::RedisError) -> StoreError {
    StoreError::Write(e.to_string())
}

/// Decodes a stored message, dropping records that do not parse so one bad
/// entry cannot wedge a subscription.
fn decode_message(raw: &str) -> Option<ChatMessage> {
    match serde_json::from_str(raw) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Skipping malformed message record: {}", e);
            None
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Opens a multiplexed connection for commands. Subscriptions open their
    /// own pub/sub connection each.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(transient)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(transient)?;
        info!("Connected to Redis.");
        Ok(Self { client, conn })
    }

    /// Creates a conversation and commits its `system` welcome message.
    pub async fn create_chat(
        &self,
        name: &str,
        kind: &str,
        created_by: &str,
        participants: &[&str],
    ) -> Result<ChatSummary, StoreError> {
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
        let encoded =
            serde_json::to_string(&summary).map_err(|e| StoreError::Malformed(e.to_string()))?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(summary_key(&summary.chat_id), encoded)
            .ignore()
            .sadd(participants_key(&summary.chat_id), &summary.participants)
            .ignore();
        for member in &summary.participants {
            pipe.sadd(user_chats_key(member), &summary.chat_id).ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(write_failed)?;

        self.append_message(
            &summary.chat_id,
            SYSTEM_SENDER,
            &format!("Chat '{}' created", name),
        )
        .await?;

        Ok(summary)
    }

    /// Stores a credential that resolves to `user_id`.
    pub async fn insert_token(&self, token: &str, user_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(token_key(token), user_id)
            .await
            .map_err(write_failed)
    }

    /// Issues a fresh random credential for `user_id`.
    pub async fn issue_token(&self, user_id: &str) -> Result<String, StoreError> {
        let token = Uuid::new_v4().simple().to_string();
        self.insert_token(&token, user_id).await?;
        Ok(token)
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl ChatStore for RedisStore {
    async fn participants(&self, chat_id: &str) -> Result<Vec<UserId>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<UserId> = conn
            .smembers(participants_key(chat_id))
            .await
            .map_err(transient)?;
        if members.is_empty() {
            return Err(StoreError::NotFound(format!("chat {}", chat_id)));
        }
        Ok(members)
    }

    async fn user_chats(&self, user_id: &str) -> Result<Vec<ChatId>, StoreError> {
        let mut conn = self.conn.clone();
        conn.smembers(user_chats_key(user_id))
            .await
            .map_err(transient)
    }

    async fn append_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<ChatMessage, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(participants_key(chat_id))
            .await
            .map_err(transient)?;
        if !exists {
            return Err(StoreError::NotFound(format!("chat {}", chat_id)));
        }

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        let encoded =
            serde_json::to_string(&message).map_err(|e| StoreError::Malformed(e.to_string()))?;

        redis::pipe()
            .atomic()
            .rpush(messages_key(chat_id), &encoded)
            .ignore()
            .sadd(message_ids_key(chat_id), &message.id)
            .ignore()
            .sadd(read_by_key(chat_id, &message.id), sender_id)
            .ignore()
            .publish(commits_channel(chat_id), &encoded)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(write_failed)?;

        Ok(message)
    }

    async fn subscribe_latest_message(&self, chat_id: &str) -> Result<MessageStream, StoreError> {
        // Subscribe before reading the latest record so no commit falls in
        // between.
        let mut pubsub = self.client.get_async_pubsub().await.map_err(transient)?;
        pubsub
            .subscribe(commits_channel(chat_id))
            .await
            .map_err(transient)?;

        let mut conn = self.conn.clone();
        let latest: Option<String> = conn
            .lindex(messages_key(chat_id), -1)
            .await
            .map_err(transient)?;
        let latest = latest.as_deref().and_then(decode_message);

        let live = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => decode_message(&payload).map(Ok),
                Err(e) => Some(Err(StoreError::Malformed(e.to_string()))),
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
        let mut conn = self.conn.clone();
        let known: bool = conn
            .sismember(message_ids_key(chat_id), message_id)
            .await
            .map_err(transient)?;
        if !known {
            return Err(StoreError::NotFound(format!("message {}", message_id)));
        }
        conn.sadd::<_, _, ()>(read_by_key(chat_id, message_id), user_id)
            .await
            .map_err(write_failed)
    }
}

#[async_trait]
impl TokenValidator for RedisStore {
    type User = UserId;
    type Error = AuthError;

    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
        let mut conn = self.conn.clone();
        let user: Option<UserId> = conn.get(token_key(token)).await.map_err(transient)?;
        user.ok_or(AuthError::InvalidToken)
    }
}
