//! Error types shared by the relay core and its store collaborators.

use crate::protocol::{ChatId, UserId};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors returned by a [`ChatStore`](crate::store::ChatStore) implementation.
///
/// `Clone` so that a single failed lookup can be handed to every caller that
/// was coalesced onto it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The conversation or message does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A read or subscription hiccup; callers may retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// An append or update was rejected by the store.
    #[error("store write failed: {0}")]
    Write(String),

    /// A stored record could not be decoded.
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Errors raised by the relay core.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Missing or invalid credential on the handshake.
    #[error("unauthorized")]
    Unauthorized,

    /// The target user has no live connection on this node.
    #[error("user {0} is not connected")]
    NotConnected(UserId),

    /// The participants of the conversation could not be resolved.
    #[error("conversation {chat_id} not found: {source}")]
    ConversationNotFound {
        chat_id: ChatId,
        #[source]
        source: StoreError,
    },

    /// The actor is not a listed participant of the conversation.
    #[error("user {user_id} is not a participant of {chat_id}")]
    AccessDenied { user_id: UserId, chat_id: ChatId },

    /// The inbound request failed validation.
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Writing a frame to the peer failed.
    #[error("failed to send frame: {0}")]
    Send(#[from] axum::Error),

    /// Writing a frame to the peer did not complete in time.
    #[error("send to {0} timed out")]
    SendTimeout(UserId),

    #[error("failed to encode event: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A background notification task panicked or was aborted.
    #[error("notification task failed: {0}")]
    Task(String),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            RelayError::NotConnected(_) | RelayError::ConversationNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::SendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Store(_)
            | RelayError::Send(_)
            | RelayError::Serialization(_)
            | RelayError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Only the status line goes out; details stay in the logs.
impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        self.status_code().into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_map_to_status_codes() {
        assert_eq!(
            RelayError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            RelayError::AccessDenied {
                user_id: "mallory".into(),
                chat_id: "c1".into(),
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            RelayError::from(StoreError::Transient("down".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
