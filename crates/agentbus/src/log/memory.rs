use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DurableLog, tail};
use crate::error::LogError;
use agentbus_protocol::Event;

/// In-memory ring buffer holding the last `capacity` events.
///
/// Used when no log path is configured and in tests; history does not
/// survive a restart.
pub struct MemoryLog {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl MemoryLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn append(&self, event: &Event) -> Result<(), LogError> {
        let mut events = self.events.lock().await;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize, kind: Option<&str>) -> Result<Vec<Event>, LogError> {
        let events = self.events.lock().await;
        Ok(tail(events.iter().cloned(), limit, kind))
    }

    fn describe(&self) -> String {
        format!("memory(capacity={})", self.capacity)
    }
}
