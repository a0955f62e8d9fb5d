//! # Axum Chat Relay
//!
//! A real-time chat relay for Axum. Clients hold one WebSocket each; messages,
//! typing indicators and conversation announcements reach every other
//! connected participant of a conversation without polling.
//!
//! ## Core pieces
//!
//! - **Connection registry**: one live handle per user, replaced on reconnect.
//! - **Fan-out engine**: resolves a conversation's participants through the
//!   store and delivers to each connected one, skipping failures.
//! - **Change listeners**: one watch per conversation with interested
//!   connections, bridging store commits (including ones written by other
//!   services) to live connections exactly once.
//! - **Lifecycle controller**: authenticates the upgrade, runs the read loop and
//!   dispatches inbound events.
//!
//! The persisted store and credential checks sit behind the [`ChatStore`] and
//! [`TokenValidator`] traits. [`MemoryStore`] and (with the `redis-store`
//! feature) `RedisStore` ship with the crate.
//!
//! [`ChatStore`]: store::ChatStore
//! [`TokenValidator`]: auth::TokenValidator
//! [`MemoryStore`]: store::MemoryStore

pub mod auth;
pub mod coalescing;
pub mod config;
pub mod error;
pub mod protocol;
pub mod store;
pub mod ws;

/// Public prelude for convenience.
///
/// `use axum_chat_relay::prelude::*;`
pub mod prelude {
    pub use crate::auth::{TokenValidator, WsAuth};
    pub use crate::config::{RelayConfig, StoreBackend};
    pub use crate::error::{RelayError, StoreError};
    pub use crate::protocol::{ChatMessage, ChatSummary, ClientEvent, Envelope, ServerEvent};
    pub use crate::store::{ChatStore, MemoryStore};
    #[cfg(feature = "redis-store")]
    pub use crate::store::RedisStore;
    pub use crate::ws::{
        service::{Notification, RelayService},
        upgrade::router,
    };
}
