use crate::message::{VtsRequest, VtsResponse};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;
use yueli_core::config::VtsConfig;
use yueli_core::TriggerBinding;
use yueli_expression::{AvatarControl, AvatarError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;
type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<VtsResponse>>>>;

/// Token requests wait on a prompt inside VTube Studio.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Reconnect delay: doubles from one second per failed attempt, capped.
pub fn backoff(retry: u32, max: Duration) -> Duration {
    Duration::from_secs(1u64 << retry.min(16)).min(max)
}

/// Handle to the background connection. Dropping it closes the connection.
pub struct VtsClient {
    url: Url,
    outgoing: mpsc::Sender<String>,
    pending: Pending,
    connected: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl VtsClient {
    /// Start connecting in the background. Only the URL is checked here;
    /// connection failures are retried forever.
    pub fn connect(config: &VtsConfig) -> Result<Self> {
        let url = Url::parse(&config.url).context("Invalid VTube Studio URL")?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("VTube Studio URL must be ws:// or wss://, got {}", url);
        }

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<String>(32);
        let (connected_tx, connected_rx) = watch::channel(false);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let link = Link {
            url: url.clone(),
            plugin_name: config.plugin_name.clone(),
            plugin_developer: config.plugin_developer.clone(),
            token: config.token.clone().filter(|t| !t.is_empty()),
            reconnect_max: Duration::from_secs(config.reconnect_max_secs.max(1)),
            pending: Arc::clone(&pending),
            connected: connected_tx,
        };
        let task = tokio::spawn(link.run(outgoing_rx));

        Ok(Self {
            url,
            outgoing: outgoing_tx,
            pending,
            connected: connected_rx,
            task,
        })
    }

    /// Connected and authenticated.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub async fn wait_connected(&self, within: Duration) -> bool {
        let mut connected = self.connected.clone();
        let ready = matches!(tokio::time::timeout(within, connected.wait_for(|c| *c)).await, Ok(Ok(_)));
        ready
    }
}

impl Drop for VtsClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl AvatarControl for VtsClient {
    async fn trigger(&self, binding: &TriggerBinding) -> Result<(), AvatarError> {
        if !self.is_connected() {
            return Err(AvatarError::Unavailable(format!("not connected to {}", self.url)));
        }

        let request = VtsRequest::hotkey(&binding.hotkey);
        let frame = serde_json::to_string(&request).map_err(|e| AvatarError::Rejected(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            // Callers that timed out leave closed senders behind.
            pending.retain(|_, waiting| !waiting.is_closed());
            pending.insert(request.request_id.clone(), tx);
        }

        self.outgoing
            .send(frame)
            .await
            .map_err(|_| AvatarError::Unavailable("connection task stopped".to_string()))?;
        let response = rx
            .await
            .map_err(|_| AvatarError::Unavailable("connection lost before acknowledgment".to_string()))?;

        if response.is_error() {
            return Err(AvatarError::Rejected(response.error_message()));
        }
        debug!(hotkey = %binding.hotkey, "Hotkey acknowledged");
        Ok(())
    }
}

/// State owned by the connection task.
struct Link {
    url: Url,
    plugin_name: String,
    plugin_developer: String,
    token: Option<String>,
    reconnect_max: Duration,
    pending: Pending,
    connected: watch::Sender<bool>,
}

impl Link {
    async fn run(mut self, mut outgoing: mpsc::Receiver<String>) {
        let mut retry = 0;
        loop {
            info!("Connecting to VTube Studio at {}...", self.url);
            match connect_async(&self.url).await {
                Ok((ws, _)) => {
                    retry = 0;
                    match self.serve(ws, &mut outgoing).await {
                        Ok(()) => info!("VTube Studio closed the connection"),
                        Err(e) => error!("VTube Studio connection error: {:#}", e),
                    }
                    self.disconnected(&mut outgoing).await;
                }
                Err(e) => error!("Failed to connect to VTube Studio: {}", e),
            }

            let wait = backoff(retry, self.reconnect_max);
            debug!("Reconnecting to VTube Studio in {:?}", wait);
            tokio::time::sleep(wait).await;
            retry = retry.saturating_add(1);
        }
    }

    async fn serve(&mut self, ws: WsStream, outgoing: &mut mpsc::Receiver<String>) -> Result<()> {
        let (mut write, mut read) = ws.split();
        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.authenticate(&mut write, &mut read))
            .await
            .context("VTube Studio authentication timed out")??;
        let _ = self.connected.send(true);
        info!("Authenticated with VTube Studio as `{}`", self.plugin_name);

        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(msg) = msg else { return Ok(()) };
                    match msg? {
                        Message::Text(text) => self.route(&text).await,
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
                Some(frame) = outgoing.recv() => {
                    write.send(Message::Text(frame)).await?;
                }
            }
        }
    }

    async fn authenticate(&mut self, write: &mut WsWrite, read: &mut WsRead) -> Result<()> {
        let token = match self.token.clone() {
            Some(token) => token,
            None => {
                info!("Requesting a plugin token; confirm the prompt in VTube Studio");
                let response = call(write, read, VtsRequest::token(&self.plugin_name, &self.plugin_developer)).await?;
                if response.is_error() {
                    bail!("token request refused: {}", response.error_message());
                }
                let token = response
                    .issued_token()
                    .context("token response carried no token")?
                    .to_string();
                info!("VTube Studio issued a plugin token; set vts.token to skip the prompt next time");
                self.token = Some(token.clone());
                token
            }
        };

        let response = call(
            write,
            read,
            VtsRequest::authenticate(&self.plugin_name, &self.plugin_developer, &token),
        )
        .await?;
        if response.is_error() || !response.authenticated() {
            // Revoked or stale; ask for a fresh one on the next attempt.
            self.token = None;
            bail!("authentication refused");
        }
        Ok(())
    }

    async fn route(&self, text: &str) {
        let response: VtsResponse = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unparseable VTube Studio message: {}", e);
                return;
            }
        };
        match self.pending.lock().await.remove(&response.request_id) {
            Some(waiting) => {
                let _ = waiting.send(response);
            }
            None => debug!(message_type = %response.message_type, "Unsolicited VTube Studio message"),
        }
    }

    /// Fail every waiting trigger and discard frames queued for the lost
    /// connection.
    async fn disconnected(&self, outgoing: &mut mpsc::Receiver<String>) {
        let _ = self.connected.send(false);
        let failed = {
            let mut pending = self.pending.lock().await;
            let n = pending.len();
            pending.clear();
            n
        };
        let mut stale = 0;
        while outgoing.try_recv().is_ok() {
            stale += 1;
        }
        if failed + stale > 0 {
            warn!(failed, stale, "VTube Studio connection lost with requests outstanding");
        }
    }
}

/// One request/response exchange before the main loop starts.
async fn call(write: &mut WsWrite, read: &mut WsRead, request: VtsRequest) -> Result<VtsResponse> {
    write.send(Message::Text(serde_json::to_string(&request)?)).await?;
    while let Some(msg) = read.next().await {
        let Message::Text(text) = msg? else { continue };
        match serde_json::from_str::<VtsResponse>(&text) {
            Ok(response) if response.request_id == request.request_id => return Ok(response),
            Ok(other) => debug!(message_type = %other.message_type, "Skipping message during handshake"),
            Err(e) => warn!("Unparseable VTube Studio message: {}", e),
        }
    }
    bail!("connection closed during {}", request.message_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let max = Duration::from_secs(30);
        assert_eq!(backoff(0, max), Duration::from_secs(1));
        assert_eq!(backoff(1, max), Duration::from_secs(2));
        assert_eq!(backoff(4, max), Duration::from_secs(16));
        assert_eq!(backoff(5, max), max);
        assert_eq!(backoff(u32::MAX, max), max);
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_url() {
        let config = VtsConfig {
            url: "http://127.0.0.1:8001".into(),
            ..VtsConfig::default()
        };
        assert!(VtsClient::connect(&config).is_err());
        let config = VtsConfig {
            url: "not a url".into(),
            ..VtsConfig::default()
        };
        assert!(VtsClient::connect(&config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_target_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = VtsConfig {
            url: format!("ws://127.0.0.1:{}", port),
            ..VtsConfig::default()
        };
        let client = VtsClient::connect(&config).unwrap();
        let err = client.trigger(&TriggerBinding::new("Wave")).await.unwrap_err();
        assert!(matches!(err, AvatarError::Unavailable(_)));
        assert!(!client.is_connected());
    }
}
