// WebSocket transport built on tokio-tungstenite.

use std::future::Future;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

use super::{Connector, HeartbeatConfig, Link, TransportError, TransportFrame};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WsConnector {
    pub heartbeat: HeartbeatConfig,
    pub connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self { heartbeat: HeartbeatConfig::default(), connect_timeout: DEFAULT_CONNECT_TIMEOUT }
    }
}

impl WsConnector {
    pub fn new(heartbeat: HeartbeatConfig) -> Self {
        Self { heartbeat, ..Self::default() }
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &Url) -> impl Future<Output = Result<Link, TransportError>> + Send {
        let url = url.clone();
        let heartbeat = self.heartbeat;
        let connect_timeout = self.connect_timeout;
        async move {
            let (stream, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| TransportError::Timeout { url: url.to_string(), after: connect_timeout })?
                .map_err(|error| TransportError::Connect { url: url.to_string(), reason: error.to_string() })?;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(stream, outbound_rx, inbound_tx, heartbeat, url));
            Ok(Link { outbound: outbound_tx, inbound: inbound_rx })
        }
    }
}

/// Shuttle frames between the socket and the link channels, probing the
/// peer with pings. A ping that gets no traffic back within the heartbeat
/// timeout closes the link.
async fn pump<S>(
    stream: S,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<TransportFrame>,
    heartbeat: HeartbeatConfig,
    url: Url,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + Unpin
        + 'static,
{
    let (mut writer, mut reader) = stream.split();
    let mut ticker = interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping_deadline: Option<Instant> = None;

    let reason = loop {
        let deadline = ping_deadline;
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(error) = writer.send(Message::Ping(Default::default())).await {
                    break format!("ping failed: {error}");
                }
                trace!(%url, "ping sent");
                ping_deadline.get_or_insert(Instant::now() + heartbeat.timeout);
            }
            _ = sleep_until_opt(deadline) => {
                warn!(%url, timeout = ?heartbeat.timeout, "heartbeat timed out");
                break "heartbeat timed out".to_string();
            }
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(error) = writer.send(Message::Text(text.into())).await {
                        break format!("write failed: {error}");
                    }
                }
                None => {
                    debug!(%url, "link released, closing socket");
                    let _ = writer.send(Message::Close(None)).await;
                    return;
                }
            },
            message = reader.next() => {
                ping_deadline = None;
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(TransportFrame::Text(text.as_str().to_string())).is_err() {
                            let _ = writer.send(Message::Close(None)).await;
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(bytes))) => {
                        debug!(%url, len = bytes.len(), "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|frame| format!("closed by server: {}", frame.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(error)) => break format!("read failed: {error}"),
                    None => break "stream ended".to_string(),
                }
            }
        }
    };

    let _ = inbound.send(TransportFrame::Closed(Some(reason)));
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
