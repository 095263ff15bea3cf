// Durable Log
//
// Bounded, append-only history of published events. The broker appends every
// publish here (best-effort) and serves replay requests from it.

pub mod file;
pub mod memory;
pub mod remote;

pub use file::FileLog;
pub use memory::MemoryLog;
pub use remote::HubLog;

use async_trait::async_trait;

use crate::error::LogError;
use agentbus_protocol::Event;

/// Durable Log trait for persistence
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append an event to the backing store
    async fn append(&self, event: &Event) -> Result<(), LogError>;

    /// Up to `limit` most recently appended events, optionally filtered by
    /// kind, oldest first
    async fn recent(&self, limit: usize, kind: Option<&str>) -> Result<Vec<Event>, LogError>;

    /// True when the store is shared between processes, in which case events
    /// ingested from the network are already persisted by their publisher
    fn is_shared(&self) -> bool {
        false
    }

    /// Short description for diagnostics
    fn describe(&self) -> String;
}

/// Keep the last `limit` events matching `kind`, preserving order.
pub(crate) fn tail<I>(events: I, limit: usize, kind: Option<&str>) -> Vec<Event>
where
    I: DoubleEndedIterator<Item = Event>,
{
    let mut window: Vec<Event> = events
        .rev()
        .filter(|e| kind.is_none_or(|k| e.kind == k))
        .take(limit)
        .collect();
    window.reverse();
    window
}
