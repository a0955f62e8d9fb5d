//! Connection handles and the shared state behind the registry and the
//! listener manager.

use crate::error::RelayError;
use crate::protocol::{ChatId, MessageId, ServerEvent, UserId};
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use futures_util::{Sink, SinkExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A unique identifier for a single WebSocket connection.
pub type ConnectionId = Uuid;

/// The write half of a connection, type-erased so the registry does not care
/// whether it is an Axum socket or an in-memory channel.
pub type BoxedSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// The write half behind a mutex: one writer at a time per socket, which is
/// what keeps events to a single recipient in issuance order.
pub type WsSink = Arc<Mutex<BoxedSink>>;

/// Close code sent to a connection evicted by a newer one for the same user.
pub const CLOSE_REPLACED: u16 = 4000;
/// Close code sent when a connection stays silent past the idle timeout.
pub const CLOSE_IDLE: u16 = 4001;
/// Close code sent on server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// A live, authenticated connection.
///
/// Cheap to clone; clones share the same sink and activity clock.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn_id: ConnectionId,
    user_id: UserId,
    sink: WsSink,
    opened_at: Instant,
    last_activity_ms: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn new<S>(user_id: impl Into<UserId>, sink: S) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        Self {
            conn_id: ConnectionId::new_v4(),
            user_id: user_id.into(),
            sink: Arc::new(Mutex::new(Box::pin(sink))),
            opened_at: Instant::now(),
            last_activity_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn last_activity(&self) -> Instant {
        self.opened_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    pub fn touch(&self) {
        let elapsed = self.opened_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Writes an already-encoded text frame.
    pub async fn send_text(&self, frame: &str) -> Result<(), axum::Error> {
        self.touch();
        self.sink
            .lock()
            .await
            .send(Message::Text(Utf8Bytes::from(frame)))
            .await
    }

    /// Encodes and writes one event.
    pub async fn send(&self, event: &ServerEvent) -> Result<(), RelayError> {
        let frame = event.encode()?;
        self.send_text(&frame).await?;
        Ok(())
    }

    /// Sends a close frame. The peer's close reply ends its read loop.
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), axum::Error> {
        let frame = CloseFrame {
            code,
            reason: Utf8Bytes::from(reason),
        };
        self.sink.lock().await.send(Message::Close(Some(frame))).await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("conn_id", &self.conn_id)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// A registry slot: the handle plus the conversations whose listeners this
/// connection holds a reference on.
pub(crate) struct ConnectionEntry {
    pub(crate) handle: ConnectionHandle,
    pub(crate) chats: HashSet<ChatId>,
}

const DELIVERY_LOG_CAPACITY: usize = 256;

/// Bounded record of message ids already delivered live for one conversation.
#[derive(Debug, Default)]
pub(crate) struct DeliveryLog {
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

impl DeliveryLog {
    /// Returns `true` the first time an id is claimed.
    pub(crate) fn claim(&mut self, message_id: &str) -> bool {
        if self.seen.contains(message_id) {
            return false;
        }
        if self.order.len() == DELIVERY_LOG_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(message_id.to_string());
        self.seen.insert(message_id.to_string());
        true
    }
}

const DELIVERY_LEDGER_CONVERSATIONS: usize = 1024;

/// Delivery logs for the most recently active conversations.
///
/// Outlives the listeners: a conversation whose watch was cancelled and later
/// restarted still remembers what it already delivered, so the restarted
/// watch's replay of the latest message is not sent again.
#[derive(Debug)]
pub(crate) struct DeliveryLedger {
    logs: HashMap<ChatId, DeliveryLog>,
    recency: VecDeque<ChatId>,
    capacity: usize,
}

impl DeliveryLedger {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            logs: HashMap::new(),
            recency: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `true` the first time `message_id` is claimed for `chat_id`.
    /// The least recently claimed conversation is forgotten when full.
    pub(crate) fn claim(&mut self, chat_id: &str, message_id: &str) -> bool {
        match self.recency.iter().position(|c| c == chat_id) {
            Some(pos) => {
                if let Some(chat) = self.recency.remove(pos) {
                    self.recency.push_back(chat);
                }
            }
            None => {
                if self.recency.len() == self.capacity {
                    if let Some(oldest) = self.recency.pop_front() {
                        self.logs.remove(&oldest);
                    }
                }
                self.recency.push_back(chat_id.to_string());
            }
        }
        self.logs
            .entry(chat_id.to_string())
            .or_default()
            .claim(message_id)
    }

    pub(crate) fn conversations(&self) -> usize {
        self.logs.len()
    }
}

impl Default for DeliveryLedger {
    fn default() -> Self {
        Self::new(DELIVERY_LEDGER_CONVERSATIONS)
    }
}

/// One watched conversation.
pub(crate) struct ListenerEntry {
    /// Distinguishes this watch from a later one on the same conversation.
    pub(crate) generation: Uuid,
    pub(crate) token: CancellationToken,
    /// Connections currently holding a reference.
    pub(crate) interest: usize,
}

impl ListenerEntry {
    pub(crate) fn new(interest: usize) -> Self {
        Self {
            generation: Uuid::new_v4(),
            token: CancellationToken::new(),
            interest,
        }
    }
}

/// Connections, listeners and delivery logs, guarded together.
///
/// Both maps live behind the same lock so that "does this conversation need a
/// listener" is always answered against the same snapshot as "who is
/// connected". The lock is only ever held for map access, never across a
/// socket write or a store call.
#[derive(Default)]
pub(crate) struct RelayState {
    pub(crate) connections: HashMap<UserId, ConnectionEntry>,
    pub(crate) listeners: HashMap<ChatId, ListenerEntry>,
    pub(crate) delivered: DeliveryLedger,
}

pub(crate) type SharedState = Arc<RwLock<RelayState>>;

impl fmt::Debug for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayState")
            .field("connections_count", &self.connections.len())
            .field("listeners_count", &self.listeners.len())
            .field("logged_conversations", &self.delivered.conversations())
            .finish()
    }
}
