//! Hub endpoints
//!
//! - `GET /ws/bus`: WebSocket fan-out between nodes
//! - `POST /api/events`, `GET /api/events`: shared history
//! - `GET /api/health`

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::HubState;
use crate::hub::Hub;
use agentbus::LogError;
use agentbus_protocol::{ClientMessage, Event, RecentQuery, RecentResponse, ServerMessage};

const DEFAULT_RECENT_LIMIT: usize = 100;
const MAX_RECENT_LIMIT: usize = 10_000;
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Log(#[from] LogError),
}

impl ApiError {
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Log(LogError::Timeout(_)) | ApiError::Log(LogError::Unavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Log(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.to_status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// WebSocket connection parameters
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// Identity of the connecting process
    pub node_id: Option<String>,

    /// Optional token for authentication (prefer Authorization header)
    pub token: Option<String>,
}

/// Check the Bearer header, falling back to a query token.
fn authorize(state: &HubState, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    let Some(expected) = state.token.as_deref() else {
        return true;
    };

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "));

    match (bearer, query_token) {
        (Some(t), _) if t == expected => true,
        (Some(_), _) => {
            warn!("invalid Bearer token");
            false
        }
        (None, Some(t)) if t == expected => true,
        (None, Some(_)) => {
            warn!("invalid query token");
            false
        }
        (None, None) => false,
    }
}

/// GET /ws/bus
///
/// ```text
/// ws://localhost:7700/ws/bus?node_id=planner-1&token=...
/// ```
pub async fn bus_websocket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<HubState>,
    Query(params): Query<WsConnectParams>,
) -> Response {
    if !authorize(&state, &headers, params.token.as_deref()) {
        warn!(node_id = ?params.node_id, "unauthorized hub connection");
        return ApiError::Unauthorized.into_response();
    }

    let node_id = params
        .node_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("anonymous-{}", &suffix[..8])
        });

    info!(node_id = %node_id, "node connecting");

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_bus_socket(socket, hub, node_id))
}

async fn send_message(tx: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => tx.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            error!(error = %e, "failed to serialize hub message");
            true
        }
    }
}

async fn handle_bus_socket(socket: WebSocket, hub: Arc<Hub>, node_id: String) {
    let _connection = hub.connect();
    let (mut tx, mut rx) = socket.split();

    // Subscribe before acknowledging so nothing published after the ack is missed
    let mut frames = hub.subscribe();
    let mut closing = hub.closing();

    let ack = ServerMessage::Subscribed {
        node_id: node_id.clone(),
    };
    if !send_message(&mut tx, &ack).await {
        debug!(node_id = %node_id, "node left before subscription ack");
        return;
    }

    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Ok(frame) => {
                        if frame.origin == node_id {
                            continue;
                        }
                        let msg = ServerMessage::Event {
                            origin: frame.origin.clone(),
                            event: (*frame.event).clone(),
                        };
                        if !send_message(&mut tx, &msg).await {
                            debug!(node_id = %node_id, "node disconnected, closing stream");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(
                            node_id = %node_id,
                            lagged_events = n,
                            "node lagged, events were dropped"
                        );
                        let msg = ServerMessage::Error {
                            message: format!("lagged by {} events, replay history to catch up", n),
                        };
                        if !send_message(&mut tx, &msg).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("hub broadcast channel closed");
                        break;
                    }
                }
            }

            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                        Ok(ClientMessage::Publish { origin, event }) => {
                            if origin != node_id {
                                debug!(
                                    node_id = %node_id,
                                    claimed = %origin,
                                    "publish origin differs from connection"
                                );
                            }
                            debug!(
                                node_id = %node_id,
                                kind = %event.kind,
                                id = %event.id,
                                "relaying event"
                            );
                            hub.publish(&node_id, event);
                        }
                        Ok(ClientMessage::Pong) => {
                            debug!(node_id = %node_id, "received pong");
                        }
                        Err(e) => {
                            warn!(node_id = %node_id, error = %e, "invalid message from node");
                            let msg = ServerMessage::Error {
                                message: format!("invalid message: {}", e),
                            };
                            if !send_message(&mut tx, &msg).await {
                                break;
                            }
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(node_id = %node_id, "node sent close frame");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(node_id = %node_id, error = %e, "websocket error");
                        break;
                    }
                    None => break,
                }
            }

            _ = heartbeat_interval.tick() => {
                if !send_message(&mut tx, &ServerMessage::Ping).await {
                    debug!(node_id = %node_id, "failed to send heartbeat, node disconnected");
                    break;
                }
            }

            _ = async { closing.wait_for(|closing| *closing).await.map(|_| ()) } => {
                let _ = tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    info!(node_id = %node_id, "node disconnected");
}

/// POST /api/events
pub async fn append_event(
    State(state): State<HubState>,
    headers: HeaderMap,
    Json(event): Json<Event>,
) -> Result<StatusCode, ApiError> {
    if !authorize(&state, &headers, None) {
        return Err(ApiError::Unauthorized);
    }

    state.log.append(&event).await?;
    debug!(kind = %event.kind, id = %event.id, source = %event.source, "appended event");
    Ok(StatusCode::CREATED)
}

/// GET /api/events?limit=100&kind=task.delegated
pub async fn recent_events(
    State(state): State<HubState>,
    headers: HeaderMap,
    Query(query): Query<RecentQuery>,
) -> Result<Json<RecentResponse>, ApiError> {
    if !authorize(&state, &headers, None) {
        return Err(ApiError::Unauthorized);
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(MAX_RECENT_LIMIT);
    let events = state.log.recent(limit, query.kind.as_deref()).await?;
    Ok(Json(RecentResponse { events }))
}

/// GET /api/health
pub async fn health(State(state): State<HubState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connections(),
        "relayed": state.hub.relayed(),
        "log": state.log.describe(),
    }))
}
