//! Shared hub for agentbus processes.
//!
//! Nodes connect over WebSocket and every event one of them publishes is
//! relayed to all the others. The hub also serves a shared history API that
//! `agentbus::HubLog` appends to and replays from.

pub mod api;
pub mod config;
pub mod hub;

use std::sync::Arc;

use axum::{Router, routing::get};

use agentbus::DurableLog;
pub use config::HubArgs;
pub use hub::{Frame, Hub};

#[derive(Clone)]
pub struct HubState {
    pub hub: Arc<Hub>,
    pub log: Arc<dyn DurableLog>,
    /// Required from every client when set
    pub token: Option<String>,
}

impl HubState {
    pub fn new(hub: Arc<Hub>, log: Arc<dyn DurableLog>, token: Option<String>) -> Self {
        Self { hub, log, token }
    }
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/ws/bus", get(api::bus_websocket))
        .route("/api/events", get(api::recent_events).post(api::append_event))
        .route("/api/health", get(api::health))
        .with_state(state)
}
