// Broker Core
//
// In-process publish/subscribe engine. Every publish is appended to the
// durable log (best-effort), optionally forwarded to the hub link, and handed
// to the queue of every matching subscription. Each subscription owns a
// worker task, so a slow or failing handler never holds up the publisher or
// other subscribers.

pub mod handler;
mod worker;

pub use handler::{EventHandler, FnHandler, Matcher, handler_fn};
pub use worker::StatsSnapshot;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::category::CategoryRegistry;
use crate::error::{LogError, PublishError, SubscriptionError};
use crate::log::DurableLog;
use agentbus_protocol::{Event, Payload};
use worker::{BrokerStats, Worker};

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub event_id: Uuid,
    /// Number of subscriptions the event was handed to
    pub matched: usize,
    /// False when the durable log append failed or timed out
    pub persisted: bool,
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Max handlers running at once across all subscriptions
    pub handler_concurrency: usize,
    /// Upper bound for a single durable log append
    pub append_timeout: Duration,
    /// How long one handler call may occupy a concurrency slot before it
    /// keeps running outside the pool
    pub handler_slot_timeout: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            handler_concurrency: 64,
            append_timeout: Duration::from_secs(2),
            handler_slot_timeout: Duration::from_secs(5),
        }
    }
}

pub(crate) struct Subscription {
    matcher: Matcher,
    owner: String,
    queue: mpsc::UnboundedSender<Arc<Event>>,
    cancel: CancellationToken,
}

/// Live subscriptions by id.
pub(crate) type Registry = RwLock<HashMap<u64, Subscription>>;

pub struct Broker {
    categories: Arc<CategoryRegistry>,
    log: Arc<dyn DurableLog>,
    registry: Arc<Registry>,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    append_timeout: Duration,
    slot_timeout: Duration,
    forwarder: OnceLock<mpsc::Sender<Arc<Event>>>,
    stats: Arc<BrokerStats>,
}

impl Broker {
    pub fn new(
        categories: CategoryRegistry,
        log: Arc<dyn DurableLog>,
        options: BrokerOptions,
    ) -> Self {
        info!(
            log = %log.describe(),
            handler_concurrency = options.handler_concurrency,
            categories = ?categories.names().collect::<Vec<_>>(),
            "broker created"
        );

        Self {
            categories: Arc::new(categories),
            log,
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            permits: Arc::new(Semaphore::new(options.handler_concurrency.max(1))),
            shutdown: CancellationToken::new(),
            append_timeout: options.append_timeout,
            slot_timeout: options.handler_slot_timeout,
            forwarder: OnceLock::new(),
            stats: Arc::new(BrokerStats::default()),
        }
    }

    pub fn categories(&self) -> &CategoryRegistry {
        &self.categories
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    /// Publish an event.
    ///
    /// Returns once the event is persisted (or the append failed) and handed
    /// to every matching subscription; handler outcomes never affect the
    /// result.
    pub async fn publish(&self, event: Event) -> Result<PublishReceipt, PublishError> {
        if self.shutdown.is_cancelled() {
            return Err(PublishError::Closed);
        }
        if event.kind.trim().is_empty() {
            return Err(PublishError::EmptyKind);
        }

        let persisted = self.persist(&event).await;
        let event = Arc::new(event);
        BrokerStats::incr(&self.stats.published);

        self.forward(&event);
        let matched = self.dispatch(&event).await;

        debug!(
            kind = %event.kind,
            id = %event.id,
            source = %event.source,
            correlation_id = %event.correlation_id,
            matched,
            persisted,
            "published event"
        );

        Ok(PublishReceipt {
            event_id: event.id,
            matched,
            persisted,
        })
    }

    /// Build and publish an event in one call.
    pub async fn emit(
        &self,
        kind: &str,
        source: &str,
        payload: Payload,
        correlation_id: Option<String>,
    ) -> Result<PublishReceipt, PublishError> {
        let mut event = Event::new(kind, source, payload);
        if let Some(correlation_id) = correlation_id {
            event = event.with_correlation(correlation_id);
        }
        self.publish(event).await
    }

    /// Deliver an event received from another process.
    ///
    /// The event is never forwarded again, and it is only appended locally
    /// when the log is not shared with its publisher.
    pub(crate) async fn ingest_remote(&self, event: Event) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }
        if !self.log.is_shared() {
            self.persist(&event).await;
        }
        BrokerStats::incr(&self.stats.remote_ingested);

        let event = Arc::new(event);
        let matched = self.dispatch(&event).await;
        debug!(
            kind = %event.kind,
            id = %event.id,
            source = %event.source,
            matched,
            "ingested remote event"
        );
        matched
    }

    async fn persist(&self, event: &Event) -> bool {
        let error = match tokio::time::timeout(self.append_timeout, self.log.append(event)).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e,
            Err(_) => LogError::Timeout(self.append_timeout),
        };

        BrokerStats::incr(&self.stats.log_failures);
        warn!(
            kind = %event.kind,
            id = %event.id,
            error = %error,
            "durable log append failed, delivering anyway"
        );
        false
    }

    fn forward(&self, event: &Arc<Event>) {
        let Some(tx) = self.forwarder.get() else {
            return;
        };
        match tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                BrokerStats::incr(&self.stats.forward_dropped);
                warn!(kind = %event.kind, id = %event.id, "hub link buffer full, not forwarded");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(kind = %event.kind, "hub link closed, event not forwarded");
            }
        }
    }

    /// Hand the event to every matching subscription queue.
    async fn dispatch(&self, event: &Arc<Event>) -> usize {
        let mut matched = 0;
        let mut closed = Vec::new();

        {
            let registry = self.registry.read().await;
            for (id, subscription) in registry.iter() {
                if !self.matches(&subscription.matcher, &event.kind) {
                    continue;
                }
                if subscription.queue.send(event.clone()).is_ok() {
                    matched += 1;
                } else {
                    closed.push(*id);
                }
            }
        }

        if !closed.is_empty() {
            let mut registry = self.registry.write().await;
            for id in closed {
                if let Some(subscription) = registry.remove(&id) {
                    debug!(
                        subscription = id,
                        owner = %subscription.owner,
                        "removed closed subscription"
                    );
                }
            }
        }

        matched
    }

    fn matches(&self, matcher: &Matcher, kind: &str) -> bool {
        match matcher {
            Matcher::Kind(k) => k == kind,
            Matcher::Category(category) => self.categories.includes(category, kind),
        }
    }

    /// Subscribe an anonymous handler.
    pub async fn subscribe<H>(
        &self,
        matcher: Matcher,
        handler: H,
    ) -> Result<SubscriptionId, SubscriptionError>
    where
        H: EventHandler + 'static,
    {
        let parent = self.shutdown.clone();
        self.subscribe_shared("anonymous", matcher, Arc::new(handler), &parent)
            .await
    }

    /// Subscribe on behalf of `owner`.
    ///
    /// The worker stops when `parent` is cancelled, which lets a facade tear
    /// down all of its subscriptions at once. A cancelled `parent` is
    /// treated like a shut down broker.
    pub async fn subscribe_shared(
        &self,
        owner: &str,
        matcher: Matcher,
        handler: Arc<dyn EventHandler>,
        parent: &CancellationToken,
    ) -> Result<SubscriptionId, SubscriptionError> {
        if self.shutdown.is_cancelled() || parent.is_cancelled() {
            return Err(SubscriptionError::Closed);
        }
        match &matcher {
            Matcher::Kind(kind) if kind.trim().is_empty() => {
                return Err(SubscriptionError::EmptyKind);
            }
            Matcher::Category(category) if !self.categories.contains(category) => {
                return Err(SubscriptionError::UnknownCategory(category.clone()));
            }
            _ => {}
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = mpsc::unbounded_channel();
        let cancel = parent.child_token();

        let worker = Worker {
            id,
            owner: owner.to_string(),
            matcher: matcher.clone(),
            handler,
            queue: rx,
            cancel: cancel.clone(),
            permits: self.permits.clone(),
            slot_timeout: self.slot_timeout,
            stats: self.stats.clone(),
            registry: Arc::downgrade(&self.registry),
        };

        self.registry.write().await.insert(
            id,
            Subscription {
                matcher: matcher.clone(),
                owner: owner.to_string(),
                queue,
                cancel,
            },
        );
        tokio::spawn(worker.run());

        debug!(subscription = id, owner = %owner, matcher = %matcher, "subscribed");
        Ok(SubscriptionId(id))
    }

    /// Remove a subscription. Returns false if it was already removed.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.registry.write().await.remove(&id.0) {
            Some(subscription) => {
                subscription.cancel.cancel();
                debug!(subscription = id.0, owner = %subscription.owner, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Up to `limit` most recent events from the durable log.
    pub async fn replay(&self, limit: usize, kind: Option<&str>) -> Result<Vec<Event>, LogError> {
        self.log.recent(limit, kind).await
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let subscriptions = self.registry.read().await.len();
        self.stats.snapshot(subscriptions)
    }

    /// Route every local publish to the hub link. Only one link may attach.
    pub(crate) fn attach_forwarder(&self, tx: mpsc::Sender<Arc<Event>>) -> bool {
        self.forwarder.set(tx).is_ok()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop every worker and reject further publishes.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let removed = {
            let mut registry = self.registry.write().await;
            let removed = registry.len();
            registry.clear();
            removed
        };
        info!(subscriptions = removed, "broker shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use agentbus_protocol::to_payload;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    fn broker_with_log(log: Arc<dyn DurableLog>) -> Broker {
        Broker::new(CategoryRegistry::with_defaults(), log, BrokerOptions::default())
    }

    fn broker() -> Broker {
        broker_with_log(Arc::new(MemoryLog::new(1000)))
    }

    fn recorder() -> (impl EventHandler, mpsc::UnboundedReceiver<Arc<Event>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                anyhow::Ok(())
            }
        });
        (handler, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Arc<Event>>) -> Arc<Event> {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<Arc<Event>>) {
        let result = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(result.is_err(), "unexpected delivery: {:?}", result);
    }

    fn numbered(kind: &str, n: u64) -> Event {
        Event::new(kind, "publisher", to_payload(&json!({ "n": n })).unwrap())
    }

    async fn fail(_event: Arc<Event>) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("handler exploded"))
    }

    async fn explode(_event: Arc<Event>) -> anyhow::Result<()> {
        panic!("handler panicked")
    }

    struct FailingLog;

    #[async_trait]
    impl DurableLog for FailingLog {
        async fn append(&self, _event: &Event) -> Result<(), LogError> {
            Err(LogError::Unavailable("disk on fire".to_string()))
        }

        async fn recent(&self, _limit: usize, _kind: Option<&str>) -> Result<Vec<Event>, LogError> {
            Err(LogError::Unavailable("disk on fire".to_string()))
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    struct StalledLog;

    #[async_trait]
    impl DurableLog for StalledLog {
        async fn append(&self, _event: &Event) -> Result<(), LogError> {
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn recent(&self, _limit: usize, _kind: Option<&str>) -> Result<Vec<Event>, LogError> {
            Ok(Vec::new())
        }

        fn describe(&self) -> String {
            "stalled".to_string()
        }
    }

    #[tokio::test]
    async fn test_category_subscriber_and_replay() {
        let broker = broker();
        let (handler, mut rx) = recorder();
        broker
            .subscribe(Matcher::category("workflow"), handler)
            .await
            .unwrap();

        let receipt = broker
            .emit(
                "workflow.execution.requested",
                "operator",
                to_payload(&json!({ "workflow": "deploy" })).unwrap(),
                Some("c1".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(receipt.matched, 1);
        assert!(receipt.persisted);

        let event = next(&mut rx).await;
        assert_eq!(event.correlation_id, "c1");
        assert_eq!(event.str_field("workflow"), Some("deploy"));

        let history = broker
            .replay(10, Some("workflow.execution.requested"))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].correlation_id, "c1");
        assert_eq!(history[0].id, receipt.event_id);
    }

    #[tokio::test]
    async fn test_category_excludes_other_kinds() {
        let broker = broker();
        let (handler, mut rx) = recorder();
        broker
            .subscribe(Matcher::category("workflow"), handler)
            .await
            .unwrap();

        let receipt = broker.publish(numbered("task.delegated", 1)).await.unwrap();
        assert_eq!(receipt.matched, 0);
        broker
            .publish(numbered("workflow.execution.completed", 2))
            .await
            .unwrap();

        assert_eq!(next(&mut rx).await.kind, "workflow.execution.completed");
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_fifo_per_publisher() {
        let broker = broker();
        let (handler, mut rx) = recorder();
        broker
            .subscribe(Matcher::kind("task.delegated"), handler)
            .await
            .unwrap();

        for n in 0..100 {
            broker.publish(numbered("task.delegated", n)).await.unwrap();
        }

        for n in 0..100 {
            let event = next(&mut rx).await;
            assert_eq!(event.payload["n"], json!(n));
        }
    }

    #[tokio::test]
    async fn test_failing_handlers_are_isolated() {
        let broker = broker();
        broker
            .subscribe(Matcher::kind("task.delegated"), handler_fn(fail))
            .await
            .unwrap();
        broker
            .subscribe(Matcher::kind("task.delegated"), handler_fn(explode))
            .await
            .unwrap();
        let (handler, mut rx) = recorder();
        broker
            .subscribe(Matcher::kind("task.delegated"), handler)
            .await
            .unwrap();

        let receipt = broker.publish(numbered("task.delegated", 1)).await.unwrap();
        assert_eq!(receipt.matched, 3);
        assert_eq!(next(&mut rx).await.payload["n"], json!(1));

        // Panicking worker keeps running for later events.
        broker.publish(numbered("task.delegated", 2)).await.unwrap();
        assert_eq!(next(&mut rx).await.payload["n"], json!(2));

        tokio::time::timeout(WAIT, async {
            while broker.stats().await.handler_failures < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler failures were not counted");
    }

    #[tokio::test]
    async fn test_hung_handler_does_not_block_others() {
        let broker = broker();
        broker
            .subscribe(
                Matcher::kind("task.delegated"),
                handler_fn(|_event| async {
                    std::future::pending::<()>().await;
                    anyhow::Ok(())
                }),
            )
            .await
            .unwrap();
        let (handler, mut rx) = recorder();
        broker
            .subscribe(Matcher::kind("task.delegated"), handler)
            .await
            .unwrap();

        for n in 0..10 {
            tokio::time::timeout(WAIT, broker.publish(numbered("task.delegated", n)))
                .await
                .expect("publish blocked")
                .unwrap();
        }
        for n in 0..10 {
            assert_eq!(next(&mut rx).await.payload["n"], json!(n));
        }
    }

    #[tokio::test]
    async fn test_hung_handlers_release_their_slot() {
        let broker = Broker::new(
            CategoryRegistry::with_defaults(),
            Arc::new(MemoryLog::new(100)),
            BrokerOptions {
                handler_concurrency: 2,
                handler_slot_timeout: Duration::from_millis(100),
                ..BrokerOptions::default()
            },
        );
        for _ in 0..2 {
            broker
                .subscribe(
                    Matcher::kind("task.delegated"),
                    handler_fn(|_event| async {
                        std::future::pending::<()>().await;
                        anyhow::Ok(())
                    }),
                )
                .await
                .unwrap();
        }
        let (handler, mut rx) = recorder();
        broker
            .subscribe(Matcher::kind("task.completed"), handler)
            .await
            .unwrap();

        broker.publish(numbered("task.delegated", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let receipt = broker.publish(numbered("task.completed", 2)).await.unwrap();

        assert_eq!(next(&mut rx).await.id, receipt.event_id);
        tokio::time::timeout(WAIT, async {
            while broker.stats().await.slow_handlers < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("slow handlers were not counted");
    }

    #[tokio::test]
    async fn test_cancelled_parent_rejects_subscribe() {
        let broker = broker();
        let parent = CancellationToken::new();
        parent.cancel();

        let (handler, _rx) = recorder();
        let err = broker
            .subscribe_shared("late", Matcher::kind("test.passed"), Arc::new(handler), &parent)
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::Closed));
        assert_eq!(broker.stats().await.subscriptions, 0);
    }

    #[tokio::test]
    async fn test_stopped_worker_leaves_registry() {
        let broker = broker();
        let parent = CancellationToken::new();
        let (handler, _rx) = recorder();
        broker
            .subscribe_shared(
                "owner",
                Matcher::kind("review.completed"),
                Arc::new(handler),
                &parent,
            )
            .await
            .unwrap();
        assert_eq!(broker.stats().await.subscriptions, 1);

        // No event is ever published for the kind; the entry must still go.
        parent.cancel();
        tokio::time::timeout(WAIT, async {
            while broker.stats().await.subscriptions > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stopped subscription stayed registered");
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let broker = broker();
        let (handler, mut rx) = recorder();
        let id = broker
            .subscribe(Matcher::kind("task.completed"), handler)
            .await
            .unwrap();

        assert!(broker.unsubscribe(id).await);
        assert!(!broker.unsubscribe(id).await);

        let receipt = broker.publish(numbered("task.completed", 1)).await.unwrap();
        assert_eq!(receipt.matched, 0);
        assert_silent(&mut rx).await;
        assert_eq!(broker.stats().await.subscriptions, 0);
    }

    #[tokio::test]
    async fn test_invalid_matchers_are_rejected() {
        let broker = broker();
        let (handler, _rx) = recorder();
        let err = broker
            .subscribe(Matcher::category("billing"), handler)
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::UnknownCategory(ref c) if c == "billing"));

        let (handler, _rx) = recorder();
        let err = broker.subscribe(Matcher::kind("  "), handler).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::EmptyKind));
    }

    #[tokio::test]
    async fn test_kind_and_category_subscriptions_both_deliver() {
        let broker = broker();
        let (by_kind, mut kind_rx) = recorder();
        let (by_category, mut category_rx) = recorder();
        broker
            .subscribe(Matcher::kind("task.delegated"), by_kind)
            .await
            .unwrap();
        broker
            .subscribe(Matcher::category("collaboration"), by_category)
            .await
            .unwrap();

        let receipt = broker.publish(numbered("task.delegated", 7)).await.unwrap();
        assert_eq!(receipt.matched, 2);
        assert_eq!(next(&mut kind_rx).await.id, receipt.event_id);
        assert_eq!(next(&mut category_rx).await.id, receipt.event_id);
    }

    #[tokio::test]
    async fn test_log_failure_still_delivers() {
        let broker = broker_with_log(Arc::new(FailingLog));
        let (handler, mut rx) = recorder();
        broker
            .subscribe(Matcher::kind("task.delegated"), handler)
            .await
            .unwrap();

        let receipt = broker.publish(numbered("task.delegated", 1)).await.unwrap();
        assert!(!receipt.persisted);
        assert_eq!(next(&mut rx).await.id, receipt.event_id);
        assert_eq!(broker.stats().await.log_failures, 1);
        assert!(broker.replay(10, None).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_log_times_out() {
        let broker = Broker::new(
            CategoryRegistry::with_defaults(),
            Arc::new(StalledLog),
            BrokerOptions {
                append_timeout: Duration::from_millis(50),
                ..BrokerOptions::default()
            },
        );
        let (handler, mut rx) = recorder();
        broker
            .subscribe(Matcher::kind("task.delegated"), handler)
            .await
            .unwrap();

        let receipt = tokio::time::timeout(WAIT, broker.publish(numbered("task.delegated", 1)))
            .await
            .expect("publish waited on the log")
            .unwrap();
        assert!(!receipt.persisted);
        assert_eq!(next(&mut rx).await.id, receipt.event_id);
    }

    #[tokio::test]
    async fn test_handler_concurrency_is_bounded() {
        let broker = Broker::new(
            CategoryRegistry::with_defaults(),
            Arc::new(MemoryLog::new(100)),
            BrokerOptions {
                handler_concurrency: 2,
                ..BrokerOptions::default()
            },
        );
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let done_tx = done_tx.clone();
            broker
                .subscribe(
                    Matcher::kind("test.passed"),
                    handler_fn(move |_event| {
                        let running = running.clone();
                        let peak = peak.clone();
                        let done_tx = done_tx.clone();
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            let _ = done_tx.send(());
                            anyhow::Ok(())
                        }
                    }),
                )
                .await
                .unwrap();
        }

        broker.publish(numbered("test.passed", 1)).await.unwrap();
        for _ in 0..6 {
            tokio::time::timeout(WAIT, done_rx.recv()).await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_publish_validation_and_shutdown() {
        let broker = broker();
        let err = broker.publish(numbered("", 1)).await.unwrap_err();
        assert!(matches!(err, PublishError::EmptyKind));

        let (handler, _rx) = recorder();
        broker
            .subscribe(Matcher::kind("task.delegated"), handler)
            .await
            .unwrap();
        broker.shutdown().await;

        assert!(broker.is_shut_down());
        assert!(matches!(
            broker.publish(numbered("task.delegated", 1)).await,
            Err(PublishError::Closed)
        ));
        let (handler, _rx) = recorder();
        assert!(matches!(
            broker.subscribe(Matcher::kind("task.delegated"), handler).await,
            Err(SubscriptionError::Closed)
        ));
        assert_eq!(broker.stats().await.subscriptions, 0);
    }

    #[tokio::test]
    async fn test_forwarding_and_remote_ingest() {
        let broker = broker();
        let (forward_tx, mut forward_rx) = mpsc::channel(8);
        assert!(broker.attach_forwarder(forward_tx));
        let (second_tx, _second_rx) = mpsc::channel(8);
        assert!(!broker.attach_forwarder(second_tx));

        let (handler, mut rx) = recorder();
        broker
            .subscribe(Matcher::category("task"), handler)
            .await
            .unwrap();

        let receipt = broker.publish(numbered("task.accepted", 1)).await.unwrap();
        assert_eq!(forward_rx.recv().await.unwrap().id, receipt.event_id);
        assert_eq!(next(&mut rx).await.id, receipt.event_id);

        let remote = numbered("task.completed", 2);
        let remote_id = remote.id;
        assert_eq!(broker.ingest_remote(remote).await, 1);
        assert_eq!(next(&mut rx).await.id, remote_id);
        assert!(forward_rx.try_recv().is_err());

        let history = broker.replay(10, None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(broker.stats().await.remote_ingested, 1);
    }
}
