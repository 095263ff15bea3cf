use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{broadcast, watch};

use agentbus_protocol::Event;

/// An event on its way to every node except `origin`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: String,
    pub event: Arc<Event>,
}

/// Fan-out point for connected nodes.
///
/// Frames go through a broadcast channel; a connection that falls more than
/// `capacity` frames behind is told it lagged.
pub struct Hub {
    broadcaster: broadcast::Sender<Frame>,
    closing: watch::Sender<bool>,
    connections: AtomicUsize,
    relayed: AtomicU64,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (broadcaster, _) = broadcast::channel(capacity.max(1));
        let (closing, _) = watch::channel(false);
        Self {
            broadcaster,
            closing,
            connections: AtomicUsize::new(0),
            relayed: AtomicU64::new(0),
        }
    }

    /// Relay `event` to every connection. Returns the number of receivers.
    pub fn publish(&self, origin: &str, event: Event) -> usize {
        self.relayed.fetch_add(1, Ordering::Relaxed);
        let frame = Frame {
            origin: origin.to_string(),
            event: Arc::new(event),
        };
        // No receivers is fine
        self.broadcaster.send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.broadcaster.subscribe()
    }

    /// Count a connection for as long as the guard lives.
    pub fn connect(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard { hub: self.clone() }
    }

    /// Ask every open connection to close.
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }
}

pub struct ConnectionGuard {
    hub: Arc<Hub>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.hub.connections.fetch_sub(1, Ordering::Relaxed);
    }
}
