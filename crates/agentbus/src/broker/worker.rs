use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::Registry;
use super::handler::{EventHandler, Matcher};
use crate::error::HandlerError;
use agentbus_protocol::Event;

/// Broker counters, updated lock-free from publishers and workers.
#[derive(Debug, Default)]
pub(crate) struct BrokerStats {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub handler_failures: AtomicU64,
    pub log_failures: AtomicU64,
    pub remote_ingested: AtomicU64,
    pub forward_dropped: AtomicU64,
    pub slow_handlers: AtomicU64,
}

/// Point-in-time copy of the broker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub handler_failures: u64,
    pub log_failures: u64,
    pub remote_ingested: u64,
    pub forward_dropped: u64,
    /// Handlers that outlived their pool slot
    pub slow_handlers: u64,
    pub subscriptions: usize,
}

impl BrokerStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, subscriptions: usize) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            log_failures: self.log_failures.load(Ordering::Relaxed),
            remote_ingested: self.remote_ingested.load(Ordering::Relaxed),
            forward_dropped: self.forward_dropped.load(Ordering::Relaxed),
            slow_handlers: self.slow_handlers.load(Ordering::Relaxed),
            subscriptions,
        }
    }
}

/// Everything a subscription worker needs to run.
pub(crate) struct Worker {
    pub id: u64,
    pub owner: String,
    pub matcher: Matcher,
    pub handler: Arc<dyn EventHandler>,
    pub queue: mpsc::UnboundedReceiver<Arc<Event>>,
    pub cancel: CancellationToken,
    pub permits: Arc<Semaphore>,
    /// How long a handler may hold its pool slot
    pub slot_timeout: Duration,
    pub stats: Arc<BrokerStats>,
    pub registry: Weak<Registry>,
}

impl Worker {
    /// Drain the subscription queue one event at a time.
    ///
    /// Sequential processing keeps each publisher's order. The shared
    /// semaphore bounds how many handlers run at once across the broker; a
    /// handler still running after `slot_timeout` gives its slot back so a
    /// hung handler cannot starve other subscriptions. On exit the worker
    /// removes its own registry entry.
    pub async fn run(mut self) {
        debug!(
            subscription = self.id,
            owner = %self.owner,
            matcher = %self.matcher,
            "subscription worker started"
        );

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.queue.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let Some(outcome) = self.handle(&event, permit).await else {
                debug!(subscription = self.id, kind = %event.kind, "handler cancelled");
                break;
            };

            match outcome {
                Ok(Ok(())) => BrokerStats::incr(&self.stats.delivered),
                Ok(Err(e)) => {
                    BrokerStats::incr(&self.stats.handler_failures);
                    let failure = self.failure(&event, format!("{:#}", e));
                    warn!(error = %failure, "event handler failed");
                }
                Err(panic) => {
                    BrokerStats::incr(&self.stats.handler_failures);
                    let failure = self.failure(&event, panic_message(panic.as_ref()));
                    error!(error = %failure, "event handler panicked");
                }
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            if registry.write().await.remove(&self.id).is_some() {
                debug!(subscription = self.id, owner = %self.owner, "removed stopped subscription");
            }
        }
        debug!(subscription = self.id, owner = %self.owner, "subscription worker stopped");
    }

    /// Run the handler for one event. None when the subscription was
    /// cancelled first.
    async fn handle(
        &self,
        event: &Arc<Event>,
        permit: OwnedSemaphorePermit,
    ) -> Option<Result<anyhow::Result<()>, Box<dyn Any + Send>>> {
        let handling = AssertUnwindSafe(self.handler.handle(event.clone())).catch_unwind();
        tokio::pin!(handling);
        let mut permit = Some(permit);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                outcome = &mut handling => return Some(outcome),
                _ = tokio::time::sleep(self.slot_timeout), if permit.is_some() => {
                    permit = None;
                    BrokerStats::incr(&self.stats.slow_handlers);
                    warn!(
                        subscription = self.id,
                        owner = %self.owner,
                        kind = %event.kind,
                        slot_timeout_ms = self.slot_timeout.as_millis() as u64,
                        "handler still running, releasing its pool slot"
                    );
                }
            }
        }
    }

    fn failure(&self, event: &Event, message: String) -> HandlerError {
        HandlerError {
            subscription: self.id,
            owner: self.owner.clone(),
            kind: event.kind.clone(),
            source_agent: event.source.clone(),
            message,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}
