//! The Axum surface: the authenticated WebSocket upgrade endpoint and a
//! health check.

use crate::auth::{TokenValidator, WsAuth};
use crate::protocol::UserId;
use crate::store::ChatStore;
use crate::ws::service::RelayService;
use axum::{
    Json, Router,
    extract::{State, ws::WebSocketUpgrade},
    response::Response,
    routing::get,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, instrument};

/// Upgrades an authenticated request and hands the socket to the service.
///
/// [`WsAuth`] runs first, so a request without a valid credential is
/// rejected with `401 Unauthorized` before any upgrade is attempted and
/// nothing is registered.
#[instrument(skip_all, fields(user_id = %user_id))]
pub async fn ws_handler<S>(
    State(service): State<Arc<RelayService<S>>>,
    WsAuth(user_id): WsAuth<UserId>,
    ws: WebSocketUpgrade,
) -> Response
where
    S: ChatStore + TokenValidator<User = UserId>,
{
    info!("Upgrading authenticated connection.");
    ws.on_upgrade(move |socket| service.handle_socket(socket, user_id))
}

async fn health<S: ChatStore>(State(service): State<Arc<RelayService<S>>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": service.registry().connected_count().await,
        "listeners": service.listeners().active_listeners().await.len(),
    }))
}

/// Routes `/ws` and `/health` onto the service.
pub fn router<S>(service: Arc<RelayService<S>>) -> Router
where
    S: ChatStore + TokenValidator<User = UserId>,
{
    Router::new()
        .route("/ws", get(ws_handler::<S>))
        .route("/health", get(health::<S>))
        .with_state(service)
}
