use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::protocol::{ClientFrame, PresencePayload, ServerFrame, TopicKey};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

/// What a transport reports upward: inbound frames and unexpected closes.
/// A close requested through [`PushTransport::close`] is not reported.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    Frame(ServerFrame),
    Closed { reason: String },
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Opens the underlying connection. Opening an open transport is a no-op.
    async fn open(&self) -> Result<()>;
    async fn join(&self, key: TopicKey) -> Result<()>;
    async fn leave(&self, key: TopicKey) -> Result<()>;
    async fn send_presence(&self, key: TopicKey, presence: PresencePayload) -> Result<()>;
    async fn close(&self) -> Result<()>;
    fn signals(&self) -> broadcast::Receiver<TransportSignal>;
}

pub struct MissingPushTransport {
    signals: broadcast::Sender<TransportSignal>,
}

impl Default for MissingPushTransport {
    fn default() -> Self {
        let (signals, _) = broadcast::channel(1);
        Self { signals }
    }
}

#[async_trait]
impl PushTransport for MissingPushTransport {
    async fn open(&self) -> Result<()> {
        Err(anyhow!("push transport is unavailable"))
    }

    async fn join(&self, _key: TopicKey) -> Result<()> {
        Err(anyhow!("push transport is unavailable"))
    }

    async fn leave(&self, _key: TopicKey) -> Result<()> {
        Ok(())
    }

    async fn send_presence(&self, _key: TopicKey, _presence: PresencePayload) -> Result<()> {
        Err(anyhow!("push transport is unavailable"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }
}

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

pub struct WsPushTransport {
    url: String,
    access_token: Option<String>,
    writer: Arc<Mutex<Option<WsWriter>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    signals: broadcast::Sender<TransportSignal>,
}

impl WsPushTransport {
    pub fn new(url: impl Into<String>, access_token: Option<String>) -> Self {
        let (signals, _) = broadcast::channel(1024);
        Self {
            url: url.into(),
            access_token,
            writer: Arc::new(Mutex::new(None)),
            reader_task: Mutex::new(None),
            signals,
        }
    }

    fn connect_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.url)
            .with_context(|| format!("invalid push channel url: {}", self.url))?;
        match url.scheme() {
            "ws" | "wss" => {}
            "http" => url
                .set_scheme("ws")
                .map_err(|_| anyhow!("cannot derive websocket url from {}", self.url))?,
            "https" => url
                .set_scheme("wss")
                .map_err(|_| anyhow!("cannot derive websocket url from {}", self.url))?,
            other => return Err(anyhow!("unsupported push channel scheme: {other}")),
        }
        if let Some(token) = &self.access_token {
            url.query_pairs_mut().append_pair("access_token", token);
        }
        Ok(url.into())
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow!("push channel is not connected"))?;
        writer
            .send(WsMessage::Text(text))
            .await
            .context("failed to write push channel frame")
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    async fn open(&self) -> Result<()> {
        if self.writer.lock().await.is_some() {
            return Ok(());
        }

        let ws_url = self.connect_url()?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect push channel: {}", self.url))?;
        let (ws_writer, mut ws_reader) = ws_stream.split();
        *self.writer.lock().await = Some(ws_writer);
        info!(url = %self.url, "push channel connected");

        let writer = Arc::clone(&self.writer);
        let signals = self.signals.clone();
        let task = tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => {
                                let _ = signals.send(TransportSignal::Frame(frame));
                            }
                            Err(err) => warn!(%err, "dropping malformed push frame"),
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame
                            .map(|frame| format!("closed by server: {}", frame.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break format!("push channel receive failed: {err}"),
                    None => break "push channel stream ended".to_string(),
                }
            };
            writer.lock().await.take();
            debug!(%reason, "push channel reader stopped");
            let _ = signals.send(TransportSignal::Closed { reason });
        });

        if let Some(previous) = self.reader_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn join(&self, key: TopicKey) -> Result<()> {
        self.send_frame(&ClientFrame::Join { key }).await
    }

    async fn leave(&self, key: TopicKey) -> Result<()> {
        self.send_frame(&ClientFrame::Leave { key }).await
    }

    async fn send_presence(&self, key: TopicKey, presence: PresencePayload) -> Result<()> {
        self.send_frame(&ClientFrame::Presence { key, presence })
            .await
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        let Some(mut writer) = self.writer.lock().await.take() else {
            return Ok(());
        };
        writer
            .send(WsMessage::Close(None))
            .await
            .context("failed to close push channel")?;
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }
}
