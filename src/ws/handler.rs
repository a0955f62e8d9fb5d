//! Per-event handlers run by a connection's read loop.
//!
//! Each inbound frame is decoded once into a [`ClientEvent`] and routed to the
//! handler for its type. Validation and authorization failures never leave
//! the acting connection: they become a local `error` envelope.

use crate::error::RelayError;
use crate::protocol::{ChatId, ClientEvent, DecodeError, MessageId, ServerEvent};
use crate::store::ChatStore;
use crate::ws::service::RelayService;
use crate::ws::types::ConnectionHandle;
use serde_json::Value;
use tracing::{debug, instrument, warn};

const INVALID_FORMAT: &str = "Invalid message format";
const MISSING_CHAT_AND_TEXT: &str = "chat_id and text are required";
const MISSING_CHAT: &str = "chat_id is required";
const MISSING_CHAT_AND_MESSAGE: &str = "chat_id and message_id are required";
const NOT_PARTICIPANT: &str = "Not a chat participant";
const SEND_FAILED: &str = "Failed to send message";
const READ_FAILED: &str = "Failed to mark message as read";

/// A handler failure and the text reported back to the actor.
#[derive(Debug)]
struct Rejection {
    error: RelayError,
    reply: &'static str,
}

impl Rejection {
    fn new(error: impl Into<RelayError>, reply: &'static str) -> Self {
        Self {
            error: error.into(),
            reply,
        }
    }

    fn invalid(reply: &'static str) -> Self {
        Self::new(RelayError::Validation(reply.to_string()), reply)
    }
}

type Handled = Result<(), Rejection>;

impl<S: ChatStore> RelayService<S> {
    /// Decodes one text frame and runs the matching handler.
    #[instrument(level = "debug", skip_all, fields(user_id = %handle.user_id()))]
    pub(crate) async fn dispatch_frame(&self, handle: &ConnectionHandle, frame: &str) {
        match ClientEvent::decode(frame) {
            Ok(event) => self.dispatch(handle, event).await,
            Err(DecodeError::UnknownType(kind)) => {
                debug!(%kind, "Ignoring unrecognized event type.");
            }
            Err(e) => {
                warn!("Failed to parse message from client: {}", e);
                self.reply(handle, &ServerEvent::error(INVALID_FORMAT)).await;
            }
        }
    }

    /// Routes a decoded event to its handler.
    pub async fn dispatch(&self, handle: &ConnectionHandle, event: ClientEvent) {
        let kind = event.kind();
        let handled = match event {
            ClientEvent::SendMessage { chat_id, text } => {
                self.on_send_message(handle, chat_id, text).await
            }
            ClientEvent::Typing { chat_id, is_typing } => {
                self.on_typing(handle, chat_id, is_typing).await
            }
            ClientEvent::MessageRead {
                chat_id,
                message_id,
            } => self.on_message_read(handle, chat_id, message_id).await,
            ClientEvent::Ping(payload) => self.on_ping(handle, payload).await,
        };

        if let Err(rejection) = handled {
            debug!(kind, "Rejected: {}", rejection.error);
            self.reply(handle, &ServerEvent::error(rejection.reply)).await;
        }
    }

    async fn on_send_message(
        &self,
        handle: &ConnectionHandle,
        chat_id: ChatId,
        text: String,
    ) -> Handled {
        if chat_id.is_empty() || text.is_empty() {
            return Err(Rejection::invalid(MISSING_CHAT_AND_TEXT));
        }
        let sender = handle.user_id();

        self.fanout()
            .ensure_participant(&chat_id, sender)
            .await
            .map_err(|e| Rejection::new(e, NOT_PARTICIPANT))?;

        let message = self
            .store()
            .append_message(&chat_id, sender, &text)
            .await
            .map_err(|e| Rejection::new(e, SEND_FAILED))?;

        self.reply(
            handle,
            &ServerEvent::MessageSent {
                message_id: message.id.clone(),
                chat_id: chat_id.clone(),
            },
        )
        .await;

        // The conversation's listener may have seen the commit first.
        if !self.listeners().claim_direct(&chat_id, &message.id).await {
            debug!(message_id = %message.id, "Listener already relayed the message.");
            return Ok(());
        }

        let event = ServerEvent::NewMessage(message);
        if let Err(e) = self
            .fanout()
            .broadcast_to_conversation(&chat_id, &event, Some(sender))
            .await
        {
            warn!(%chat_id, "Stored message was not broadcast: {}", e);
        }
        Ok(())
    }

    async fn on_typing(&self, handle: &ConnectionHandle, chat_id: ChatId, is_typing: bool) -> Handled {
        if chat_id.is_empty() {
            return Err(Rejection::invalid(MISSING_CHAT));
        }
        let user_id = handle.user_id();

        self.fanout()
            .ensure_participant(&chat_id, user_id)
            .await
            .map_err(|e| Rejection::new(e, NOT_PARTICIPANT))?;

        let event = ServerEvent::UserTyping {
            user_id: user_id.to_string(),
            chat_id: chat_id.clone(),
            is_typing,
        };
        if let Err(e) = self
            .fanout()
            .broadcast_to_conversation(&chat_id, &event, Some(user_id))
            .await
        {
            warn!(%chat_id, "Typing indicator was not broadcast: {}", e);
        }
        Ok(())
    }

    async fn on_message_read(
        &self,
        handle: &ConnectionHandle,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Handled {
        if chat_id.is_empty() || message_id.is_empty() {
            return Err(Rejection::invalid(MISSING_CHAT_AND_MESSAGE));
        }
        let user_id = handle.user_id();

        self.fanout()
            .ensure_participant(&chat_id, user_id)
            .await
            .map_err(|e| Rejection::new(e, NOT_PARTICIPANT))?;

        self.store()
            .record_read(&chat_id, &message_id, user_id)
            .await
            .map_err(|e| Rejection::new(e, READ_FAILED))
    }

    async fn on_ping(&self, handle: &ConnectionHandle, payload: Value) -> Handled {
        self.reply(handle, &ServerEvent::Pong(payload)).await;
        Ok(())
    }

    /// Sends an event to the acting connection only. Failures are logged; the
    /// read loop notices a dead socket on its own.
    async fn reply(&self, handle: &ConnectionHandle, event: &ServerEvent) {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {} reply: {}", event.kind(), e);
                return;
            }
        };
        if let Err(e) = self.registry().deliver(handle, &frame).await {
            warn!(kind = event.kind(), "Failed to send reply to client: {}", e);
        }
    }
}
