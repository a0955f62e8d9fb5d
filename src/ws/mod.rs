//! WebSocket side of the relay.
//!
//! - [`registry`]: who is connected, through which handle.
//! - [`fanout`]: delivering one event to a conversation's connected members.
//! - [`listener`]: bridging store commits to the fan-out engine.
//! - [`service`] and [`handler`]: the per-connection lifecycle and event
//!   handlers.
//! - [`upgrade`]: the Axum endpoint.

pub mod fanout;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod service;
pub mod types;
pub mod upgrade;
