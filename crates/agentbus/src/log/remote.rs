use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::DurableLog;
use crate::error::LogError;
use agentbus_protocol::{Event, RecentResponse};

/// Durable log backed by the hub's history API.
///
/// Every process linked to the same hub appends to and replays from one
/// shared store.
#[derive(Clone)]
pub struct HubLog {
    http_client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HubLog {
    /// `hub_url` may be the WebSocket URL used by the hub link; it is
    /// converted to the matching HTTP base URL.
    pub fn new(hub_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, LogError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LogError::Unavailable(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: http_base_url(hub_url),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }
}

#[async_trait]
impl DurableLog for HubLog {
    async fn append(&self, event: &Event) -> Result<(), LogError> {
        let url = format!("{}/api/events", self.base_url);

        let resp = self
            .authorize(self.http_client.post(&url))
            .json(event)
            .send()
            .await
            .map_err(|e| LogError::Unavailable(e.to_string()))?;

        if resp.status().is_success() {
            debug!(kind = %event.kind, id = %event.id, "appended event to hub log");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(kind = %event.kind, status = %status, body = %body, "hub rejected append");
            Err(LogError::Unavailable(format!("hub returned {}: {}", status, body)))
        }
    }

    async fn recent(&self, limit: usize, kind: Option<&str>) -> Result<Vec<Event>, LogError> {
        let url = format!("{}/api/events", self.base_url);
        let limit = limit.to_string();
        let mut query = vec![("limit", limit.as_str())];
        if let Some(kind) = kind {
            query.push(("kind", kind));
        }

        let resp = self
            .authorize(self.http_client.get(&url))
            .query(&query)
            .send()
            .await
            .map_err(|e| LogError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(LogError::Unavailable(format!(
                "hub history query failed: {}",
                resp.status()
            )));
        }

        let data: RecentResponse = resp
            .json()
            .await
            .map_err(|e| LogError::Unavailable(e.to_string()))?;
        Ok(data.events)
    }

    fn is_shared(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("hub({})", self.base_url)
    }
}

/// Derive the HTTP base URL from a hub WebSocket URL.
pub(crate) fn http_base_url(hub_url: &str) -> String {
    hub_url
        .trim_end_matches('/')
        .trim_end_matches("/ws/bus")
        .replace("wss://", "https://")
        .replace("ws://", "http://")
}
