use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::broker::BrokerOptions;
use crate::category::CategoryRegistry;
use crate::error::BusError;

/// Which durable log implementation backs the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    /// In-process ring buffer, lost on restart
    #[default]
    Memory,
    /// Rotated JSONL segments under `path`
    File,
    /// The hub's shared history API
    Hub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub backend: LogBackend,
    /// Segment directory (file backend)
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Retention bound in events
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Events per segment file
    #[serde(default = "default_segment_events")]
    pub segment_events: usize,
    #[serde(default = "default_append_timeout_ms")]
    pub append_timeout_ms: u64,
    /// fsync after every append (file backend)
    #[serde(default)]
    pub fsync: bool,
}

fn default_max_events() -> usize {
    10_000
}

fn default_segment_events() -> usize {
    1_000
}

fn default_append_timeout_ms() -> u64 {
    2_000
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backend: LogBackend::default(),
            path: None,
            max_events: default_max_events(),
            segment_events: default_segment_events(),
            append_timeout_ms: default_append_timeout_ms(),
            fsync: false,
        }
    }
}

impl LogConfig {
    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }
}

/// Connection to a shared hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// WebSocket URL, e.g. `ws://127.0.0.1:7700`
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Stable identity of this process on the hub
    #[serde(default)]
    pub node_id: Option<String>,
    /// Outbound events buffered while the hub is unreachable
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_outbound_buffer() -> usize {
    4096
}

impl HubConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            node_id: None,
            outbound_buffer: default_outbound_buffer(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub log: LogConfig,
    /// Networked fan-out; absent means single-process
    #[serde(default)]
    pub hub: Option<HubConfig>,
    #[serde(default = "default_handler_concurrency")]
    pub handler_concurrency: usize,
    /// How long one handler call holds a concurrency slot
    #[serde(default = "default_handler_slot_timeout_ms")]
    pub handler_slot_timeout_ms: u64,
    /// Category table; empty means the built-in defaults
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<String>>,
}

fn default_handler_concurrency() -> usize {
    64
}

fn default_handler_slot_timeout_ms() -> u64 {
    5_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            hub: None,
            handler_concurrency: default_handler_concurrency(),
            handler_slot_timeout_ms: default_handler_slot_timeout_ms(),
            categories: BTreeMap::new(),
        }
    }
}

impl BusConfig {
    /// Load from `config/agentbus*` files and `AGENTBUS_*` environment
    /// variables (`AGENTBUS_LOG__BACKEND=file`).
    pub fn load() -> Result<Self, BusError> {
        dotenvy::dotenv().ok();
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/agentbus").required(false))
            .add_source(File::with_name(&format!("config/agentbus.{}", run_mode)).required(false))
            // Local overrides, not tracked by git
            .add_source(File::with_name("config/agentbus.local").required(false))
            .add_source(
                Environment::with_prefix("AGENTBUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(source: &str) -> Result<Self, BusError> {
        let config: Self = Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.log.max_events == 0 {
            return Err(BusError::Invalid("log.max_events must be positive".into()));
        }
        if self.log.segment_events == 0 {
            return Err(BusError::Invalid("log.segment_events must be positive".into()));
        }
        if self.handler_concurrency == 0 {
            return Err(BusError::Invalid("handler_concurrency must be positive".into()));
        }
        if self.handler_slot_timeout_ms == 0 {
            return Err(BusError::Invalid("handler_slot_timeout_ms must be positive".into()));
        }
        if self.log.backend == LogBackend::File && self.log.path.is_none() {
            return Err(BusError::Invalid("log.path is required for the file backend".into()));
        }
        match &self.hub {
            Some(hub) if hub.url.trim().is_empty() => {
                return Err(BusError::Invalid("hub.url must not be empty".into()));
            }
            Some(hub) if hub.outbound_buffer == 0 => {
                return Err(BusError::Invalid("hub.outbound_buffer must be positive".into()));
            }
            None if self.log.backend == LogBackend::Hub => {
                return Err(BusError::Invalid("the hub log backend needs a [hub] section".into()));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn category_registry(&self) -> CategoryRegistry {
        if self.categories.is_empty() {
            CategoryRegistry::with_defaults()
        } else {
            CategoryRegistry::new(self.categories.clone())
        }
    }

    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            handler_concurrency: self.handler_concurrency,
            append_timeout: self.log.append_timeout(),
            handler_slot_timeout: Duration::from_millis(self.handler_slot_timeout_ms),
        }
    }
}

/// `<hostname>-<8 hex chars>`, unique per process start.
pub fn default_node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "agentbus".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}
