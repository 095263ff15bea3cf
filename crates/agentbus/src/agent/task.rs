//! Delegated tasks, reconstructed from correlated events.
//!
//! A task has no record of its own: it is the `task.delegated`,
//! `task.accepted` and `task.completed`/`task.failed` events sharing one
//! correlation id. Payloads are read defensively since any producer may have
//! written them.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use agentbus_protocol::{Event, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Delegated,
    Accepted,
    Completed,
    Failed,
}

impl TaskState {
    fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            EventKind::TASK_DELEGATED => Some(Self::Delegated),
            EventKind::TASK_ACCEPTED => Some(Self::Accepted),
            EventKind::TASK_COMPLETED => Some(Self::Completed),
            EventKind::TASK_FAILED => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Everything the log still knows about one delegated task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHistory {
    pub correlation_id: String,
    pub state: TaskState,
    pub task: Option<String>,
    pub delegated_by: Option<String>,
    /// Target agent, then whichever agent last reported on the task
    pub assignee: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Task events in log order
    pub events: Vec<Event>,
}

impl TaskHistory {
    /// Fold the task events carrying `correlation_id`.
    ///
    /// `events` must be in log order (as returned by replay). The first
    /// terminal event wins; later events are kept in `events` but do not
    /// change the state. Returns `None` when no task event matches, e.g.
    /// after retention evicted them.
    pub fn from_events<I>(correlation_id: &str, events: I) -> Option<Self>
    where
        I: IntoIterator<Item = Event>,
    {
        let mut history: Option<Self> = None;

        for event in events {
            if event.correlation_id != correlation_id {
                continue;
            }
            let Some(next) = TaskState::from_kind(&event.kind) else {
                continue;
            };

            let h = history.get_or_insert_with(|| Self {
                correlation_id: correlation_id.to_string(),
                state: TaskState::Delegated,
                task: None,
                delegated_by: None,
                assignee: None,
                result: None,
                error: None,
                events: Vec::new(),
            });

            match next {
                TaskState::Delegated => {
                    h.task = h.task.take().or_else(|| event.str_field("task").map(String::from));
                    h.delegated_by = h
                        .delegated_by
                        .take()
                        .or_else(|| event.str_field("delegated_by").map(String::from));
                    if h.assignee.is_none() {
                        h.assignee = event.str_field("target_agent").map(String::from);
                    }
                }
                _ if h.state.is_terminal() => {}
                TaskState::Accepted => {
                    if let Some(agent) = event.str_field("agent") {
                        h.assignee = Some(agent.to_string());
                    }
                    h.state = TaskState::Accepted;
                }
                TaskState::Completed => {
                    if let Some(agent) = event.str_field("agent") {
                        h.assignee = Some(agent.to_string());
                    }
                    h.result = event.payload.get("result").cloned();
                    h.state = TaskState::Completed;
                }
                TaskState::Failed => {
                    if let Some(agent) = event.str_field("agent") {
                        h.assignee = Some(agent.to_string());
                    }
                    h.error = event.str_field("error").map(String::from);
                    h.state = TaskState::Failed;
                }
            }

            h.events.push(event);
        }

        history
    }
}

/// A `task.delegated` event addressed to some agent.
#[derive(Debug, Clone)]
pub struct DelegatedTask {
    pub correlation_id: String,
    pub target_agent: String,
    pub task: String,
    pub delegated_by: String,
    pub event: Arc<Event>,
}

impl DelegatedTask {
    /// None when `event` is not a well-formed delegation.
    pub fn from_event(event: Arc<Event>) -> Option<Self> {
        if event.kind != EventKind::TASK_DELEGATED {
            return None;
        }
        let target_agent = event.str_field("target_agent")?.to_string();
        let task = event.str_field("task")?.to_string();
        let delegated_by = event
            .str_field("delegated_by")
            .unwrap_or(&event.source)
            .to_string();

        Some(Self {
            correlation_id: event.correlation_id.clone(),
            target_agent,
            task,
            delegated_by,
            event,
        })
    }
}
