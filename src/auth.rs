//! Handshake authentication for the relay's WebSocket endpoint.
//!
//! The credential is read from the `token` query parameter (browsers cannot
//! set headers on a WebSocket handshake) or, failing that, from an
//! `Authorization: Bearer <token>` header. A missing or rejected credential
//! fails the request with `401 Unauthorized` before any upgrade happens.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use async_trait::async_trait;
//! # use axum::{Router, response::{IntoResponse, Response}, routing::get};
//! # use axum_chat_relay::auth::{TokenValidator, WsAuth};
//! // 1. Whatever resolves tokens for your application.
//! #[derive(Clone)]
//! struct Sessions;
//!
//! // 2. Implement the trait on the router state.
//! #[async_trait]
//! impl TokenValidator for Sessions {
//!     type User = String;
//!     type Error = std::io::Error;
//!
//!     async fn validate_token(&self, token: &str) -> Result<String, Self::Error> {
//!         match token {
//!             "secret-token" => Ok("alice".to_string()),
//!             _ => Err(std::io::Error::new(
//!                 std::io::ErrorKind::PermissionDenied,
//!                 "unknown token",
//!             )),
//!         }
//!     }
//! }
//!
//! // 3. Take `WsAuth` ahead of the upgrade in your handler.
//! async fn whoami(WsAuth(user): WsAuth<String>) -> Response {
//!     user.into_response()
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let app: Router = Router::new()
//!         .route("/whoami", get(whoami))
//!         .with_state(Sessions);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::{HeaderMap, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{RelayError, StoreError};

/// Verifies a credential and resolves it to a user.
///
/// The relay only needs a stable user id back; whatever issued the token
/// (a JWT signer, an identity provider, a session table) stays behind this
/// trait.
#[async_trait]
pub trait TokenValidator {
    /// The user type that is returned upon successful validation.
    type User: Send + Sync + 'static;
    /// The error type returned on validation failure.
    type Error: std::error::Error + Send + Sync + 'static;

    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error>;
}

#[async_trait]
impl<T> TokenValidator for Arc<T>
where
    T: TokenValidator + Send + Sync,
{
    type User = T::User;
    type Error = T::Error;

    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
        (**self).validate_token(token).await
    }
}

/// Why a credential was rejected.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Extractor holding the authenticated user.
///
/// Rejects the request with [`RelayError::Unauthorized`] (`401`) when no
/// credential is present or when the state's [`TokenValidator`] refuses it.
///
/// # Type Parameters
///
/// * `U` - the user the state's validator resolves a token to; for the relay
///   this is the user id.
#[derive(Debug)]
pub struct WsAuth<U>(pub U)
where
    U: Send + Sync + 'static;

#[derive(Deserialize)]
struct WebSocketAuthQuery {
    token: String,
}

impl<S, U> FromRequestParts<S> for WsAuth<U>
where
    S: TokenValidator<User = U> + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    type Rejection = Response;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, <Self as FromRequestParts<S>>::Rejection>> + Send {
        Box::pin(async move {
            let token = match Query::<WebSocketAuthQuery>::from_request_parts(parts, state).await
            {
                Ok(Query(q)) if !q.token.is_empty() => Some(q.token),
                _ => get_token_from_headers(&parts.headers),
            };

            let Some(token) = token else {
                debug!("Handshake rejected: no credential supplied");
                return Err(RelayError::Unauthorized.into_response());
            };

            match state.validate_token(&token).await {
                Ok(user) => Ok(WsAuth(user)),
                Err(e) => {
                    warn!("Handshake rejected: {}", e);
                    Err(RelayError::Unauthorized.into_response())
                }
            }
        })
    }
}

fn get_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|header| header.to_str().ok())
        .and_then(|header_val| header_val.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(|token| token.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::http::Request;

    async fn extract(store: &Arc<MemoryStore>, uri: &str, bearer: Option<&str>) -> Option<String> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        WsAuth::<String>::from_request_parts(&mut parts, store)
            .await
            .ok()
            .map(|WsAuth(user)| user)
    }

    #[tokio::test]
    async fn accepts_query_token() {
        let store = Arc::new(MemoryStore::new());
        store.insert_token("t-alice", "alice");

        assert_eq!(
            extract(&store, "/ws?token=t-alice", None).await.as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn accepts_bearer_header() {
        let store = Arc::new(MemoryStore::new());
        store.insert_token("t-bob", "bob");

        assert_eq!(extract(&store, "/ws", Some("t-bob")).await.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn rejection_is_401() {
        let store = Arc::new(MemoryStore::new());
        let (mut parts, _) = Request::builder()
            .uri("/ws?token=forged")
            .body(())
            .unwrap()
            .into_parts();

        let rejection = WsAuth::<String>::from_request_parts(&mut parts, &store)
            .await
            .unwrap_err();
        assert_eq!(rejection.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_missing_and_invalid_tokens() {
        let store = Arc::new(MemoryStore::new());
        store.insert_token("t-alice", "alice");

        assert!(extract(&store, "/ws", None).await.is_none());
        assert!(extract(&store, "/ws?token=", None).await.is_none());
        assert!(extract(&store, "/ws?token=forged", None).await.is_none());
    }
}
