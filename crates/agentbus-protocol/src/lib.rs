//! Shared protocol definitions for agentbus nodes and the hub.

pub mod event_bus;

use serde::{Deserialize, Serialize};

pub use event_bus::{Event, EventKind, Payload, to_payload};

// ============================================================================
// Protocol: Node -> Hub (WebSocket)
// ============================================================================

/// Messages from a node to the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Publish an event to every other connected node
    Publish {
        /// Node id of the publishing process
        origin: String,
        event: Event,
    },
    /// Response to a JSON-level ping
    Pong,
}

// ============================================================================
// Protocol: Hub -> Node (WebSocket)
// ============================================================================

/// Messages from the hub to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection accepted
    Subscribed { node_id: String },

    /// Event published by another node
    Event { origin: String, event: Event },

    /// Error message
    Error { message: String },

    /// Heartbeat ping
    Ping,

    /// Heartbeat pong
    Pong,
}

// ============================================================================
// Protocol: History API (HTTP)
// ============================================================================

/// Query parameters for `GET /api/events`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecentQuery {
    /// Max events to return
    pub limit: Option<usize>,
    /// Only return events of this kind
    pub kind: Option<String>,
}

/// Response body for `GET /api/events`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentResponse {
    /// Events in append order (oldest first)
    pub events: Vec<Event>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_publish() {
        let msg = ClientMessage::Publish {
            origin: "node-a".to_string(),
            event: Event::new(EventKind::TASK_DELEGATED, "planner", Payload::new()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"publish""#));
        assert!(json.contains(r#""origin":"node-a""#));
        assert!(json.contains(r#""kind":"task.delegated""#));
    }

    #[test]
    fn test_deserialize_server_event() {
        let message = r#"
        {
            "type": "event",
            "origin": "node-b",
            "event": {
                "id": "6a1f6c1e-7a55-4c4e-9a59-0f5d2b6a0b11",
                "kind": "task.completed",
                "payload": {"agent": "coder", "result": {"ok": true}},
                "correlation_id": "c9",
                "source": "coder",
                "timestamp": "2024-05-01T10:00:00Z"
            }
        }
        "#;
        let msg: ServerMessage = serde_json::from_str(message).unwrap();
        if let ServerMessage::Event { origin, event } = msg {
            assert_eq!(origin, "node-b");
            assert_eq!(event.correlation_id, "c9");
        } else {
            panic!("Expected Event message");
        }
    }

    #[test]
    fn test_deserialize_ping() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Ping));
    }
}
