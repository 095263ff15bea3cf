//! Event bus for coordinating autonomous agents.
//!
//! Agents publish immutable [`Event`]s to a [`Broker`], which persists them
//! to a [`DurableLog`] and hands them to every matching subscription. An
//! optional [`HubLink`] extends delivery to other processes through a shared
//! hub. [`AgentBus`] gives each agent a name-scoped view of the broker.

pub mod agent;
pub mod broker;
pub mod category;
pub mod config;
pub mod error;
pub mod fanout;
pub mod log;

use std::sync::Arc;

use tracing::info;

pub use agent::{AgentBus, DelegatedTask, TaskHistory, TaskState};
pub use agentbus_protocol::{Event, EventKind, Payload, to_payload};
pub use broker::{
    Broker, BrokerOptions, EventHandler, Matcher, PublishReceipt, StatsSnapshot, SubscriptionId,
    handler_fn,
};
pub use category::CategoryRegistry;
pub use crate::config::{BusConfig, HubConfig, LogBackend, LogConfig};
pub use error::{BusError, LogError, PublishError, SubscriptionError};
pub use fanout::HubLink;
pub use log::{DurableLog, FileLog, HubLog, MemoryLog};

/// Composition root: one broker per process, built from configuration and
/// shared by every agent facade.
pub struct Bus {
    broker: Arc<Broker>,
    link: Option<HubLink>,
}

impl Bus {
    /// Build from `BusConfig::load()`.
    pub async fn load() -> Result<Self, BusError> {
        Self::from_config(BusConfig::load()?).await
    }

    pub async fn from_config(config: BusConfig) -> Result<Self, BusError> {
        config.validate()?;

        let log: Arc<dyn DurableLog> = match config.log.backend {
            LogBackend::Memory => Arc::new(MemoryLog::new(config.log.max_events)),
            LogBackend::File => {
                let path = config
                    .log
                    .path
                    .clone()
                    .ok_or_else(|| {
                        BusError::Invalid("log.path is required for the file backend".into())
                    })?;
                let log = FileLog::open(path, config.log.max_events, config.log.segment_events)
                    .await?
                    .with_fsync(config.log.fsync);
                Arc::new(log)
            }
            LogBackend::Hub => {
                let hub = config
                    .hub
                    .as_ref()
                    .ok_or_else(|| {
                        BusError::Invalid("the hub log backend needs a [hub] section".into())
                    })?;
                Arc::new(HubLog::new(
                    &hub.url,
                    hub.token.clone(),
                    config.log.append_timeout(),
                )?)
            }
        };

        let broker = Arc::new(Broker::new(
            config.category_registry(),
            log,
            config.broker_options(),
        ));

        let link = match &config.hub {
            Some(hub) => Some(HubLink::spawn(broker.clone(), hub.clone())?),
            None => None,
        };

        info!(
            log = %broker.log().describe(),
            networked = link.is_some(),
            "bus ready"
        );

        Ok(Self { broker, link })
    }

    /// In-memory bus with default categories, mostly for tests.
    pub fn in_memory() -> Self {
        let broker = Arc::new(Broker::new(
            CategoryRegistry::with_defaults(),
            Arc::new(MemoryLog::new(LogConfig::default().max_events)),
            BrokerOptions::default(),
        ));
        Self { broker, link: None }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn link(&self) -> Option<&HubLink> {
        self.link.as_ref()
    }

    /// A facade for the agent `name` on this bus.
    pub fn agent(&self, name: impl Into<String>) -> AgentBus {
        AgentBus::new(name, self.broker.clone())
    }

    pub async fn shutdown(&self) {
        if let Some(link) = &self.link {
            link.shutdown().await;
        }
        self.broker.shutdown().await;
    }
}
