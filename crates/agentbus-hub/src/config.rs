use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::HubState;
use crate::hub::Hub;
use agentbus::{DurableLog, FileLog, LogError, MemoryLog};

/// Command line of the hub binary. Every flag can also come from the
/// environment.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "agentbus-hub",
    version,
    about = "Shared hub connecting agentbus processes",
    long_about = None
)]
pub struct HubArgs {
    /// Address to listen on
    #[arg(long, env = "AGENTBUS_HUB_BIND", default_value = "127.0.0.1:7700")]
    pub bind: SocketAddr,

    /// Directory for the history log; history is kept in memory when absent
    #[arg(long, env = "AGENTBUS_HUB_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Retention bound of the history log
    #[arg(long, env = "AGENTBUS_HUB_MAX_EVENTS", default_value_t = 100_000)]
    pub max_events: usize,

    /// Events per log segment file
    #[arg(long, env = "AGENTBUS_HUB_SEGMENT_EVENTS", default_value_t = 5_000)]
    pub segment_events: usize,

    /// Frames a slow node may fall behind before it is told it lagged
    #[arg(long, env = "AGENTBUS_HUB_BROADCAST_CAPACITY", default_value_t = 1024)]
    pub broadcast_capacity: usize,

    /// Shared secret required from nodes and history clients
    #[arg(long, env = "AGENTBUS_HUB_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

impl HubArgs {
    pub async fn open_log(&self) -> Result<Arc<dyn DurableLog>, LogError> {
        match &self.log_dir {
            Some(dir) => {
                let log = FileLog::open(dir.clone(), self.max_events, self.segment_events).await?;
                Ok(Arc::new(log))
            }
            None => Ok(Arc::new(MemoryLog::new(self.max_events))),
        }
    }

    pub async fn state(&self) -> Result<HubState, LogError> {
        let log = self.open_log().await?;
        let token = self.token.clone().filter(|t| !t.is_empty());
        Ok(HubState::new(
            Arc::new(Hub::new(self.broadcast_capacity)),
            log,
            token,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = HubArgs::try_parse_from(["agentbus-hub"]).unwrap();
        assert_eq!(args.bind, "127.0.0.1:7700".parse::<SocketAddr>().unwrap());
        assert_eq!(args.max_events, 100_000);
        assert!(args.log_dir.is_none());
    }

    #[tokio::test]
    async fn test_file_log_from_flags() {
        let dir = tempfile::tempdir().unwrap();
        let args = HubArgs::try_parse_from([
            "agentbus-hub",
            "--bind",
            "0.0.0.0:9000",
            "--log-dir",
            dir.path().to_str().unwrap(),
            "--max-events",
            "50",
            "--token",
            "secret",
        ])
        .unwrap();

        let state = args.state().await.unwrap();
        assert!(state.log.describe().contains("file"));
        assert_eq!(state.token.as_deref(), Some("secret"));

        let args = HubArgs::try_parse_from(["agentbus-hub", "--token", ""]).unwrap();
        assert!(args.state().await.unwrap().token.is_none());
    }
}
