// Networked Fan-out
//
// Bridges a local broker to the hub. Local publishes arrive through the
// broker's forwarder channel and are sent as `publish` frames; `event` frames
// from other nodes are re-injected with `Broker::ingest_remote`, which never
// forwards them again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::{HubConfig, default_node_id};
use crate::error::BusError;
use agentbus_protocol::{ClientMessage, Event, ServerMessage};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the background hub connection.
pub struct HubLink {
    node_id: String,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HubLink {
    /// Attach to `broker` and start connecting in the background.
    ///
    /// The link stops when the broker shuts down. A broker accepts one link.
    pub fn spawn(broker: Arc<Broker>, config: HubConfig) -> Result<Self, BusError> {
        let node_id = config.node_id.clone().unwrap_or_else(default_node_id);
        let url = connect_url(&config.url, &node_id)?;
        client_request(&url, config.token.as_deref())?;
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));
        if !broker.attach_forwarder(outbound_tx) {
            return Err(BusError::Invalid("broker is already linked to a hub".into()));
        }

        let (status_tx, status_rx) = watch::channel(false);
        let cancel = broker.shutdown_token().child_token();
        let connection = Connection {
            broker,
            url,
            token: config.token.clone(),
            hub: config.url.clone(),
            node_id: node_id.clone(),
            status: status_tx,
            cancel: cancel.clone(),
        };

        info!(hub = %config.url, node_id = %node_id, "starting hub link");
        let task = tokio::spawn(connection.run(outbound_rx));

        Ok(Self {
            node_id,
            connected: status_rx,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the hub acknowledged the connection. False on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut status = self.connected.clone();
        matches!(
            tokio::time::timeout(timeout, status.wait_for(|connected| *connected)).await,
            Ok(Ok(_))
        )
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "hub link task panicked");
            }
        }
    }
}

impl Drop for HubLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum ConnectionResult {
    /// Reconnect after the backoff delay, keeping the outbound buffer
    Reconnect(mpsc::Receiver<Arc<Event>>),
    /// Was connected; reconnect now and reset the backoff
    ReconnectImmediate(mpsc::Receiver<Arc<Event>>),
    /// Cancelled
    Stopped,
}

struct Connection {
    broker: Arc<Broker>,
    url: Url,
    token: Option<String>,
    hub: String,
    node_id: String,
    status: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(self, outbound: mpsc::Receiver<Arc<Event>>) {
        let mut reconnect_delay = RECONNECT_DELAY;
        let mut outbound = outbound;

        loop {
            match self.connect_once(outbound).await {
                ConnectionResult::Reconnect(returned) => {
                    outbound = returned;
                    info!(
                        delay_secs = reconnect_delay.as_secs(),
                        "hub unavailable, reconnecting..."
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                    reconnect_delay = std::cmp::min(reconnect_delay * 2, MAX_RECONNECT_DELAY);
                }
                ConnectionResult::ReconnectImmediate(returned) => {
                    outbound = returned;
                    reconnect_delay = RECONNECT_DELAY;
                }
                ConnectionResult::Stopped => break,
            }
        }

        self.status.send_replace(false);
        info!(node_id = %self.node_id, "hub link stopped");
    }

    async fn connect_once(&self, mut outbound: mpsc::Receiver<Arc<Event>>) -> ConnectionResult {
        debug!(hub = %self.hub, "connecting to hub");

        let request = match client_request(&self.url, self.token.as_deref()) {
            Ok(request) => request,
            Err(e) => {
                error!(hub = %self.hub, error = %e, "cannot build hub request, stopping link");
                return ConnectionResult::Stopped;
            }
        };
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return ConnectionResult::Stopped,
            result = connect_async(request) => result,
        };
        let (ws_stream, _) = match connected {
            Ok(s) => s,
            Err(e) => {
                warn!(hub = %self.hub, error = %e, "failed to connect to hub");
                return ConnectionResult::Reconnect(outbound);
            }
        };

        let (mut ws_write, mut ws_read) = ws_stream.split();

        // Wait for subscribed acknowledgment first
        let ack = tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
            loop {
                match ws_read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(ServerMessage::Subscribed { node_id }) => return Ok(node_id),
                            Ok(ServerMessage::Error { message }) => return Err(message),
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err("connection closed before subscription ack".to_string());
                    }
                    Some(Err(e)) => return Err(e.to_string()),
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;

        match ack {
            Ok(Ok(node_id)) => debug!(node_id = %node_id, "hub acknowledged subscription"),
            Ok(Err(e)) => {
                warn!(hub = %self.hub, error = %e, "hub refused subscription");
                return ConnectionResult::Reconnect(outbound);
            }
            Err(_) => {
                warn!(hub = %self.hub, "timed out waiting for hub subscription ack");
                return ConnectionResult::Reconnect(outbound);
            }
        }

        self.status.send_replace(true);
        info!(hub = %self.hub, node_id = %self.node_id, "connected to hub");

        // Channel to signal shutdown to forwarder
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (control_tx, mut control_rx) = mpsc::channel::<ClientMessage>(16);
        let origin = self.node_id.clone();

        // Forwarder task: outbound buffer -> WebSocket
        let forwarder = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    msg = control_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    event = outbound.recv() => match event {
                        Some(event) => ClientMessage::Publish {
                            origin: origin.clone(),
                            event: (*event).clone(),
                        },
                        None => {
                            debug!("outbound channel closed");
                            break;
                        }
                    },
                };

                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "failed to serialize hub message");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    warn!("hub send failed, stopping forwarder");
                    break;
                }
            }
            let _ = ws_write.close().await;
            outbound
        });

        let disconnect_reason = loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break "shutdown",
                frame = ws_read.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(ServerMessage::Event { origin, event }) => {
                        if origin == self.node_id {
                            continue;
                        }
                        self.broker.ingest_remote(event).await;
                    }
                    Ok(ServerMessage::Ping) => {
                        let _ = control_tx.send(ClientMessage::Pong).await;
                    }
                    Ok(ServerMessage::Error { message }) => {
                        warn!(error = %message, "received error from hub");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "failed to parse hub message");
                    }
                },
                Some(Ok(Message::Close(_))) => break "hub closed connection",
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "websocket error, will reconnect");
                    break "websocket error";
                }
                None => break "stream ended",
            }
        };

        self.status.send_replace(false);
        info!(reason = disconnect_reason, "disconnected from hub");

        let _ = shutdown_tx.send(()).await;
        let returned = match forwarder.await {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "hub forwarder task panicked, stopping link");
                return ConnectionResult::Stopped;
            }
        };

        if self.cancel.is_cancelled() {
            ConnectionResult::Stopped
        } else {
            ConnectionResult::ReconnectImmediate(returned)
        }
    }
}

/// `ws://<hub>/ws/bus?node_id=..` from a configured hub URL.
fn connect_url(hub_url: &str, node_id: &str) -> Result<Url, BusError> {
    let base = hub_url
        .trim_end_matches('/')
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    let mut url = Url::parse(&base)
        .map_err(|e| BusError::Invalid(format!("invalid hub url {}: {}", hub_url, e)))?;
    if !url.path().ends_with("/ws/bus") {
        let path = format!("{}/ws/bus", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    url.set_query(None);
    url.query_pairs_mut().append_pair("node_id", node_id);
    Ok(url)
}

/// Upgrade request for `url`, carrying the token as a Bearer header.
fn client_request(url: &Url, token: Option<&str>) -> Result<Request, BusError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| BusError::Invalid(format!("invalid hub url {}: {}", url, e)))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| BusError::Invalid("hub.token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}
