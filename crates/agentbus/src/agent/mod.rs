// Agent Integration Facade
//
// A name-scoped view of a shared broker. Every event published through the
// facade carries the agent's name as its source, and every subscription it
// creates is owned by the facade: `shutdown` (or dropping the facade) stops
// all of them at once.

pub mod task;

pub use task::{DelegatedTask, TaskHistory, TaskState};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, EventHandler, Matcher, PublishReceipt, SubscriptionId, handler_fn};
use crate::error::{LogError, PublishError, SubscriptionError};
use agentbus_protocol::event_bus::{
    AgentRegisteredData, AgentStoppedData, CollaborationCompletedData, CollaborationFailedData,
    CollaborationRequestedData, TaskAcceptedData, TaskCompletedData, TaskDelegatedData,
    TaskFailedData,
};
use agentbus_protocol::{Event, EventKind, Payload, to_payload};

#[derive(Default)]
struct FacadeState {
    /// Category subscriptions made by `initialize`
    categories: BTreeMap<String, SubscriptionId>,
    /// Every live subscription owned by this facade
    subscriptions: Vec<SubscriptionId>,
    registered: bool,
}

pub struct AgentBus {
    name: String,
    broker: Arc<Broker>,
    cancel: CancellationToken,
    state: Mutex<FacadeState>,
}

impl AgentBus {
    pub fn new(name: impl Into<String>, broker: Arc<Broker>) -> Self {
        let cancel = broker.shutdown_token().child_token();
        Self {
            name: name.into(),
            broker,
            cancel,
            state: Mutex::new(FacadeState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Subscribe `handler` to each of `categories`.
    ///
    /// Categories already subscribed by an earlier call are skipped, so
    /// calling this twice never duplicates a subscription. All names are
    /// validated before anything is subscribed. The first successful call
    /// announces the agent with `agent.registered`.
    ///
    /// A category that is already subscribed keeps its original handler;
    /// `handler` is ignored for it.
    pub async fn initialize<H>(
        &self,
        categories: &[&str],
        handler: H,
    ) -> Result<(), SubscriptionError>
    where
        H: EventHandler + 'static,
    {
        if let Some(unknown) = categories
            .iter()
            .find(|category| !self.broker.categories().contains(category))
        {
            return Err(SubscriptionError::UnknownCategory(unknown.to_string()));
        }

        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        let mut state = self.state.lock().await;

        for category in categories {
            if state.categories.contains_key(*category) {
                debug!(agent = %self.name, category = %category, "category already subscribed");
                continue;
            }
            let id = self
                .broker
                .subscribe_shared(
                    &self.name,
                    Matcher::category(*category),
                    handler.clone(),
                    &self.cancel,
                )
                .await?;
            state.categories.insert(category.to_string(), id);
            state.subscriptions.push(id);
        }

        if !state.registered {
            state.registered = true;
            let data = AgentRegisteredData {
                agent: self.name.clone(),
                categories: state.categories.keys().cloned().collect(),
            };
            drop(state);

            if let Err(e) = self.publish_data(EventKind::AGENT_REGISTERED, &data, None).await {
                warn!(agent = %self.name, error = %e, "failed to announce agent");
            }
            info!(agent = %self.name, categories = ?data.categories, "agent initialized");
        }

        Ok(())
    }

    /// Publish with `source` set to this agent and a fresh timestamp.
    pub async fn publish_agent_event(
        &self,
        kind: &str,
        payload: Payload,
    ) -> Result<PublishReceipt, PublishError> {
        self.broker.publish(Event::new(kind, &self.name, payload)).await
    }

    pub async fn publish_correlated(
        &self,
        kind: &str,
        payload: Payload,
        correlation_id: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let event = Event::new(kind, &self.name, payload).with_correlation(correlation_id);
        self.broker.publish(event).await
    }

    /// Publish one of the typed payload structs.
    pub async fn publish_data<T: Serialize>(
        &self,
        kind: &str,
        data: &T,
        correlation_id: Option<&str>,
    ) -> Result<PublishReceipt, PublishError> {
        let payload = to_payload(data)?;
        match correlation_id {
            Some(correlation_id) => self.publish_correlated(kind, payload, correlation_id).await,
            None => self.publish_agent_event(kind, payload).await,
        }
    }

    /// Subscribe to one exact kind.
    pub async fn register_handler<H>(
        &self,
        kind: &str,
        handler: H,
    ) -> Result<SubscriptionId, SubscriptionError>
    where
        H: EventHandler + 'static,
    {
        self.subscribe(Matcher::kind(kind), handler).await
    }

    pub async fn subscribe<H>(
        &self,
        matcher: Matcher,
        handler: H,
    ) -> Result<SubscriptionId, SubscriptionError>
    where
        H: EventHandler + 'static,
    {
        let id = self
            .broker
            .subscribe_shared(&self.name, matcher, Arc::new(handler), &self.cancel)
            .await?;
        self.state.lock().await.subscriptions.push(id);
        Ok(id)
    }

    /// Returns false if `id` is not a live subscription of this facade.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        {
            let mut state = self.state.lock().await;
            let before = state.subscriptions.len();
            state.subscriptions.retain(|s| *s != id);
            if state.subscriptions.len() == before {
                return false;
            }
            state.categories.retain(|_, s| *s != id);
        }
        self.broker.unsubscribe(id).await
    }

    /// Handle delegations addressed to this agent.
    ///
    /// Malformed `task.delegated` events and delegations for other agents
    /// are ignored.
    pub async fn on_delegated_task<F, Fut>(
        &self,
        handler: F,
    ) -> Result<SubscriptionId, SubscriptionError>
    where
        F: Fn(DelegatedTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = self.name.clone();
        let handler = Arc::new(handler);

        self.register_handler(
            EventKind::TASK_DELEGATED,
            handler_fn(move |event: Arc<Event>| {
                let task = DelegatedTask::from_event(event).filter(|t| t.target_agent == name);
                let handler = handler.clone();
                async move {
                    match task {
                        Some(task) => handler(task).await,
                        None => Ok(()),
                    }
                }
            }),
        )
        .await
    }

    /// Ask `target_agents` for help. Returns the correlation id their
    /// responses will carry.
    pub async fn request_collaboration(
        &self,
        target_agents: &[&str],
        task: &str,
    ) -> Result<String, PublishError> {
        let correlation_id = Uuid::new_v4().to_string();
        let data = CollaborationRequestedData {
            target_agents: target_agents.iter().map(|a| a.to_string()).collect(),
            task: task.to_string(),
            requested_by: self.name.clone(),
        };
        self.publish_data(EventKind::COLLABORATION_REQUESTED, &data, Some(&correlation_id))
            .await?;
        Ok(correlation_id)
    }

    pub async fn complete_collaboration(
        &self,
        correlation_id: &str,
        result: Value,
    ) -> Result<PublishReceipt, PublishError> {
        let data = CollaborationCompletedData {
            agent: self.name.clone(),
            result,
        };
        self.publish_data(EventKind::COLLABORATION_COMPLETED, &data, Some(correlation_id))
            .await
    }

    pub async fn fail_collaboration(
        &self,
        correlation_id: &str,
        error: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let data = CollaborationFailedData {
            agent: self.name.clone(),
            error: error.to_string(),
        };
        self.publish_data(EventKind::COLLABORATION_FAILED, &data, Some(correlation_id))
            .await
    }

    /// Hand `task` to `target_agent`. Does not wait for acceptance; the
    /// outcome arrives later as `task.completed` or `task.failed` with the
    /// returned correlation id.
    pub async fn delegate_task(
        &self,
        target_agent: &str,
        task: &str,
    ) -> Result<String, PublishError> {
        let correlation_id = Uuid::new_v4().to_string();
        let data = TaskDelegatedData {
            target_agent: target_agent.to_string(),
            task: task.to_string(),
            delegated_by: self.name.clone(),
        };
        self.publish_data(EventKind::TASK_DELEGATED, &data, Some(&correlation_id))
            .await?;
        Ok(correlation_id)
    }

    pub async fn accept_task(&self, correlation_id: &str) -> Result<PublishReceipt, PublishError> {
        let data = TaskAcceptedData {
            agent: self.name.clone(),
        };
        self.publish_data(EventKind::TASK_ACCEPTED, &data, Some(correlation_id))
            .await
    }

    pub async fn complete_task(
        &self,
        correlation_id: &str,
        result: Value,
    ) -> Result<PublishReceipt, PublishError> {
        let data = TaskCompletedData {
            agent: self.name.clone(),
            result,
        };
        self.publish_data(EventKind::TASK_COMPLETED, &data, Some(correlation_id))
            .await
    }

    pub async fn fail_task(
        &self,
        correlation_id: &str,
        error: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let data = TaskFailedData {
            agent: self.name.clone(),
            error: error.to_string(),
        };
        self.publish_data(EventKind::TASK_FAILED, &data, Some(correlation_id))
            .await
    }

    /// Rebuild a task from the newest `window` events of the log.
    pub async fn task_history(
        &self,
        correlation_id: &str,
        window: usize,
    ) -> Result<Option<TaskHistory>, LogError> {
        let events = self.broker.replay(window, None).await?;
        Ok(TaskHistory::from_events(correlation_id, events))
    }

    /// Unsubscribe everything, cancel in-flight handlers and announce
    /// `agent.stopped`. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }

        let subscriptions = {
            let mut state = self.state.lock().await;
            state.categories.clear();
            std::mem::take(&mut state.subscriptions)
        };
        for id in &subscriptions {
            self.broker.unsubscribe(*id).await;
        }
        self.cancel.cancel();

        let data = AgentStoppedData {
            agent: self.name.clone(),
        };
        match self.publish_data(EventKind::AGENT_STOPPED, &data, None).await {
            Ok(_) | Err(PublishError::Closed) => {}
            Err(e) => warn!(agent = %self.name, error = %e, "failed to announce agent stop"),
        }
        info!(agent = %self.name, subscriptions = subscriptions.len(), "agent shut down");
    }
}

impl Drop for AgentBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
