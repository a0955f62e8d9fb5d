//! The persisted-store collaborator consumed by the relay core.
//!
//! The relay never owns persisted state. Everything it needs from the
//! conversation store goes through [`ChatStore`]; token verification goes
//! through [`TokenValidator`](crate::auth::TokenValidator), which the shipped
//! stores also implement.

use crate::error::StoreError;
use crate::protocol::{ChatId, ChatMessage, UserId};
use async_trait::async_trait;
use futures::stream::BoxStream;

mod memory;
#[cfg(feature = "redis-store")]
mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;

/// Sender id used for messages written by the store itself, such as the
/// welcome message of a freshly created conversation.
pub const SYSTEM_SENDER: &str = "system";

/// A stream of committed messages for one conversation.
///
/// An `Err` item is a transient hiccup; the stream ending means the
/// subscription was lost. Either way the subscriber is expected to back off
/// and subscribe again.
pub type MessageStream = BoxStream<'static, Result<ChatMessage, StoreError>>;

/// Conversation store operations the relay depends on.
#[async_trait]
pub trait ChatStore: Send + Sync + 'static {
    /// Current participant set of a conversation.
    ///
    /// Fails with [`StoreError::NotFound`] if the conversation does not exist.
    async fn participants(&self, chat_id: &str) -> Result<Vec<UserId>, StoreError>;

    /// Every conversation the user currently participates in.
    async fn user_chats(&self, user_id: &str) -> Result<Vec<ChatId>, StoreError>;

    /// Appends a message and returns the committed record, including the id
    /// the store assigned to it.
    async fn append_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<ChatMessage, StoreError>;

    /// Subscribes to the conversation's message commits.
    ///
    /// The stream first yields the latest already-committed message (if any),
    /// then every newly committed message in commit order.
    async fn subscribe_latest_message(&self, chat_id: &str) -> Result<MessageStream, StoreError>;

    /// Records that `user_id` has read `message_id`.
    async fn record_read(
        &self,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
    ) -> Result<(), StoreError>;
}
