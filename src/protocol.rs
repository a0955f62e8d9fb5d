//! Wire protocol: the JSON envelope exchanged over a live connection and the
//! strongly-typed events decoded from and encoded into it.
//!
//! Every frame is one JSON object of the shape
//! `{"type": "...", "chat_id": "...", "user_id": "...", "data": {...}}` where
//! `chat_id` and `user_id` are optional. Inbound frames are decoded once into a
//! [`ClientEvent`]; outbound events are built as [`ServerEvent`]s and encoded
//! on the way out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

/// Stable user identifier issued by the auth collaborator.
pub type UserId = String;

/// Conversation identifier.
pub type ChatId = String;

/// Message identifier assigned by the store on append.
pub type MessageId = String;

/// A committed message as stored and as delivered in `new_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// A conversation as announced in `chat_created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub participants: Vec<UserId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// The raw wire unit, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub data: Value,
}

/// Why an inbound frame could not be turned into a [`ClientEvent`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unrecognized event type `{0}`")]
    UnknownType(String),

    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    SendMessage { chat_id: ChatId, text: String },
    Typing { chat_id: ChatId, is_typing: bool },
    MessageRead { chat_id: ChatId, message_id: MessageId },
    /// Keepalive; the payload is echoed back verbatim in `pong`.
    Ping(Value),
}

#[derive(Deserialize)]
struct SendMessagePayload {
    chat_id: Option<ChatId>,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct TypingPayload {
    chat_id: Option<ChatId>,
    is_typing: bool,
}

#[derive(Deserialize)]
struct MessageReadPayload {
    chat_id: Option<ChatId>,
    message_id: MessageId,
}

fn payload<T: DeserializeOwned>(kind: &'static str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::InvalidPayload { kind, source })
}

impl ClientEvent {
    /// Decodes a text frame.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(frame).map_err(DecodeError::Malformed)?;
        Self::from_envelope(envelope)
    }

    /// Classifies an envelope by its type tag. A `chat_id` inside `data` wins
    /// over one carried on the envelope itself.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, DecodeError> {
        let Envelope {
            kind,
            chat_id: outer_chat_id,
            data,
            ..
        } = envelope;

        match kind.as_str() {
            "send_message" => {
                let p: SendMessagePayload = payload("send_message", data)?;
                Ok(ClientEvent::SendMessage {
                    chat_id: p.chat_id.or(outer_chat_id).unwrap_or_default(),
                    text: p.text,
                })
            }
            "typing" => {
                let p: TypingPayload = payload("typing", data)?;
                Ok(ClientEvent::Typing {
                    chat_id: p.chat_id.or(outer_chat_id).unwrap_or_default(),
                    is_typing: p.is_typing,
                })
            }
            "message_read" => {
                let p: MessageReadPayload = payload("message_read", data)?;
                Ok(ClientEvent::MessageRead {
                    chat_id: p.chat_id.or(outer_chat_id).unwrap_or_default(),
                    message_id: p.message_id,
                })
            }
            "ping" => Ok(ClientEvent::Ping(data)),
            _ => Err(DecodeError::UnknownType(kind)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::MessageRead { .. } => "message_read",
            ClientEvent::Ping(_) => "ping",
        }
    }
}

/// Events the relay emits.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Acknowledges a `send_message` to its sender.
    MessageSent { message_id: MessageId, chat_id: ChatId },
    NewMessage(ChatMessage),
    ChatCreated(ChatSummary),
    UserTyping {
        user_id: UserId,
        chat_id: ChatId,
        is_typing: bool,
    },
    Pong(Value),
    Error { error: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            error: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::ChatCreated(_) => "chat_created",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::Pong(_) => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let (chat_id, user_id, data) = match self {
            ServerEvent::MessageSent {
                message_id,
                chat_id,
            } => (
                None,
                None,
                json!({ "message_id": message_id, "chat_id": chat_id }),
            ),
            ServerEvent::NewMessage(message) => (
                Some(message.chat_id.clone()),
                None,
                serde_json::to_value(message)?,
            ),
            ServerEvent::ChatCreated(chat) => {
                (Some(chat.chat_id.clone()), None, serde_json::to_value(chat)?)
            }
            ServerEvent::UserTyping {
                user_id,
                chat_id,
                is_typing,
            } => (
                Some(chat_id.clone()),
                Some(user_id.clone()),
                json!({ "user_id": user_id, "chat_id": chat_id, "is_typing": is_typing }),
            ),
            ServerEvent::Pong(data) => (None, None, data.clone()),
            ServerEvent::Error { error } => (None, None, json!({ "error": error })),
        };

        Ok(Envelope {
            kind: self.kind().to_string(),
            chat_id,
            user_id,
            data,
        })
    }

    /// Serializes the event into a text frame body.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_envelope()?)
    }
}
