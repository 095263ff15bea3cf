//! Event model shared by every agentbus component.
//!
//! An [`Event`] is an immutable record of something that happened. Its `kind`
//! follows the `<namespace>.<action>` convention and its payload is a
//! schema-less JSON object; the typed `*Data` structs below document the keys
//! producers are expected to use for the built-in kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Schema-less event payload (always a JSON object).
pub type Payload = Map<String, Value>;

// ============================================================================
// Event Kind Constants
// ============================================================================

/// Event kind constants following the format: `<namespace>.<action>`
pub struct EventKind;

impl EventKind {
    // Task delegation
    pub const TASK_DELEGATED: &str = "task.delegated";
    pub const TASK_ACCEPTED: &str = "task.accepted";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";

    // Collaboration
    pub const COLLABORATION_REQUESTED: &str = "collaboration.requested";
    pub const COLLABORATION_COMPLETED: &str = "collaboration.completed";
    pub const COLLABORATION_FAILED: &str = "collaboration.failed";

    // Workflow execution
    pub const WORKFLOW_EXECUTION_REQUESTED: &str = "workflow.execution.requested";
    pub const WORKFLOW_EXECUTION_STARTED: &str = "workflow.execution.started";
    pub const WORKFLOW_EXECUTION_COMPLETED: &str = "workflow.execution.completed";
    pub const WORKFLOW_EXECUTION_FAILED: &str = "workflow.execution.failed";

    // Agent lifecycle
    pub const AGENT_REGISTERED: &str = "agent.registered";
    pub const AGENT_STOPPED: &str = "agent.stopped";
    pub const AGENT_ERROR: &str = "agent.error";

    // Requirements
    pub const REQUIREMENT_ANALYZED: &str = "requirement.analyzed";
    pub const USER_STORY_CREATED: &str = "user_story.created";

    // Development
    pub const CODE_GENERATED: &str = "code.generated";
    pub const API_CREATED: &str = "api.created";

    // Quality
    pub const TEST_PASSED: &str = "test.passed";
    pub const TEST_FAILED: &str = "test.failed";
    pub const REVIEW_REQUESTED: &str = "review.requested";
    pub const REVIEW_COMPLETED: &str = "review.completed";
}

// ============================================================================
// Event
// ============================================================================

/// A published event.
///
/// Serialized as one self-describing JSON object, which is also the record
/// format of the file-backed log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: Uuid,

    /// Event kind (semantic type)
    /// Examples: "task.delegated", "workflow.execution.completed"
    pub kind: String,

    /// Event-specific data
    #[serde(default)]
    pub payload: Payload,

    /// Relates request/response events across publish calls
    pub correlation_id: String,

    /// Name of the publishing agent or component
    pub source: String,

    /// Creation time, assigned by the publisher
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new event with a fresh id, correlation id and timestamp.
    pub fn new(kind: impl Into<String>, source: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            correlation_id: Uuid::new_v4().to_string(),
            source: source.into(),
            timestamp: Utc::now(),
        }
    }

    /// Replace the generated correlation id.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Look up a string field of the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Deserialize the payload into one of the typed data structs.
    pub fn data<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }
}

/// Convert a serializable value into an event payload.
///
/// Fails when the value does not serialize to a JSON object.
pub fn to_payload<T: Serialize>(data: &T) -> Result<Payload, serde_json::Error> {
    match serde_json::to_value(data)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "payload must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Task Data Structures
// ============================================================================

/// Data for task.delegated - a unit of work handed to another agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDelegatedData {
    /// Name of the agent expected to perform the task.
    pub target_agent: String,
    /// Human-readable task description.
    pub task: String,
    /// Name of the delegating agent.
    pub delegated_by: String,
}

/// Data for task.accepted - the assignee acknowledged the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAcceptedData {
    pub agent: String,
}

/// Data for task.completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletedData {
    pub agent: String,
    /// Result produced by the assignee (schema is task specific).
    #[serde(default)]
    pub result: Value,
}

/// Data for task.failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailedData {
    pub agent: String,
    pub error: String,
}

// ============================================================================
// Collaboration Data Structures
// ============================================================================

/// Data for collaboration.requested - addressed to one or more agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationRequestedData {
    pub target_agents: Vec<String>,
    pub task: String,
    pub requested_by: String,
}

/// Data for collaboration.completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationCompletedData {
    pub agent: String,
    #[serde(default)]
    pub result: Value,
}

/// Data for collaboration.failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationFailedData {
    pub agent: String,
    pub error: String,
}

// ============================================================================
// Agent Data Structures
// ============================================================================

/// Data for agent.registered - emitted once when a facade initializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegisteredData {
    pub agent: String,
    /// Categories the agent subscribed to.
    #[serde(default)]
    pub categories: Vec<String>,
}

/// Data for agent.stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStoppedData {
    pub agent: String,
}

// ============================================================================
// Tests
// ============================================================================
