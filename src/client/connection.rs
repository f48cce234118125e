use super::GEMINI_AUDIO_SAMPLE_RATE_HZ_OUTPUT;
use super::token::AuthToken;
use crate::audio::pcm::{TransportFrame, rate_from_mime_type};
use crate::error::ConversationError;
use crate::types::{
    BidiGenerateContentClientContent, BidiGenerateContentRealtimeInput, BidiGenerateContentSetup,
    Blob, ClientMessagePayload, ServerMessage,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, trace, warn};
use url::Url;

pub const DEFAULT_LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContentConstrained";

const OUTGOING_CAPACITY: usize = 100;
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle and data callbacks of a duplex session, delivered in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The server accepted the setup; the session can carry audio.
    Open,
    /// One inline audio fragment from the model turn.
    Audio(TransportFrame),
    Error(String),
    Close(String),
}

/// Opens duplex sessions with the remote model.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Opens a session and sends `setup`. Events, starting with
    /// [`SessionEvent::Open`], are delivered on `events`.
    ///
    /// Failure to open is [`ConversationError::ServiceUnavailable`].
    async fn connect(
        &self,
        token: &AuthToken,
        setup: BidiGenerateContentSetup,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Box<dyn LiveSession>, ConversationError>;
}

#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Queues one captured frame without waiting.
    fn send_realtime_audio(&self, frame: TransportFrame) -> Result<(), ConversationError>;

    async fn send_client_content(
        &self,
        content: BidiGenerateContentClientContent,
    ) -> Result<(), ConversationError>;

    /// Closes the session. A second call returns
    /// [`ConversationError::AlreadyClosed`].
    async fn close(&mut self) -> Result<(), ConversationError>;
}

/// [`LiveConnector`] speaking the BidiGenerateContent JSON protocol over a
/// WebSocket, authenticated with an ephemeral token.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: String,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_LIVE_ENDPOINT)
    }
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub(crate) fn session_url(&self, token: &AuthToken) -> Result<Url, ConversationError> {
        Url::parse_with_params(&self.endpoint, &[("access_token", token.as_str())]).map_err(|e| {
            ConversationError::ServiceUnavailable(format!("invalid live endpoint: {}", e))
        })
    }
}

#[async_trait]
impl LiveConnector for WebSocketConnector {
    async fn connect(
        &self,
        token: &AuthToken,
        setup: BidiGenerateContentSetup,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Box<dyn LiveSession>, ConversationError> {
        // Fails harmlessly if a provider is already installed.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let url = self.session_url(token)?;
        info!("[Connection] Connecting to live endpoint for model {}", setup.model);
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ConversationError::ServiceUnavailable(format!("connect: {}", e)))?;
        let (mut ws_sink, ws_source) = ws_stream.split();

        let setup_json = serde_json::to_string(&ClientMessagePayload::Setup(setup))?;
        ws_sink
            .send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| ConversationError::ServiceUnavailable(format!("send setup: {}", e)))?;
        debug!("[Connection] Setup sent; waiting for setupComplete.");

        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let writer = tokio::spawn(run_writer(ws_sink, outgoing_rx, shutdown_rx));
        let reader = tokio::spawn(run_reader(ws_source, events));

        Ok(Box::new(WebSocketSession {
            outgoing: Some(outgoing_tx),
            shutdown_tx: Some(shutdown_tx),
            writer: Some(writer),
            reader,
        }))
    }
}

pub struct WebSocketSession {
    outgoing: Option<mpsc::Sender<ClientMessagePayload>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    writer: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
}

impl WebSocketSession {
    fn outgoing(&self) -> Result<&mpsc::Sender<ClientMessagePayload>, ConversationError> {
        self.outgoing.as_ref().ok_or(ConversationError::AlreadyClosed)
    }
}

#[async_trait]
impl LiveSession for WebSocketSession {
    fn send_realtime_audio(&self, frame: TransportFrame) -> Result<(), ConversationError> {
        let payload = ClientMessagePayload::RealtimeInput(BidiGenerateContentRealtimeInput {
            audio: Some(Blob {
                mime_type: frame.mime_type(),
                data: frame.into_data(),
            }),
            ..Default::default()
        });
        self.outgoing()?.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                trace!("[Connection] Outgoing queue full; audio frame dropped.");
                ConversationError::SendError
            }
            mpsc::error::TrySendError::Closed(_) => ConversationError::SendError,
        })
    }

    async fn send_client_content(
        &self,
        content: BidiGenerateContentClientContent,
    ) -> Result<(), ConversationError> {
        self.outgoing()?
            .send(ClientMessagePayload::ClientContent(content))
            .await
            .map_err(|_| ConversationError::SendError)
    }

    async fn close(&mut self) -> Result<(), ConversationError> {
        let Some(tx) = self.shutdown_tx.take() else {
            return Err(ConversationError::AlreadyClosed);
        };
        info!("[Connection] Close requested.");
        self.outgoing.take();
        if tx.send(()).is_err() {
            debug!("[Connection] Writer task already gone.");
        }
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, writer).await.is_err() {
                warn!("[Connection] Writer did not finish closing in time.");
            }
        }
        self.reader.abort();
        Ok(())
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            warn!("[Connection] Dropped without explicit close(); signalling shutdown.");
            let _ = tx.send(());
        }
        self.reader.abort();
    }
}

async fn run_writer<S>(
    mut sink: S,
    mut outgoing_rx: mpsc::Receiver<ClientMessagePayload>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!("[Connection] Shutdown signal received by writer.");
                break;
            }
            maybe_payload = outgoing_rx.recv() => {
                let Some(payload) = maybe_payload else { break };
                let json = match serde_json::to_string(&payload) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("[Connection] Failed to serialize outgoing message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    error!("[Connection] Failed to send message: {}", e);
                    break;
                }
            }
        }
    }
    if let Err(e) = sink.send(WsMessage::Close(None)).await {
        debug!("[Connection] Close frame not sent: {}", e);
    }
    let _ = sink.close().await;
}

async fn run_reader<S>(mut source: S, events: mpsc::Sender<SessionEvent>)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(next) = source.next().await {
        let decoded = match next {
            Ok(WsMessage::Text(text)) => server_events(text.as_str()),
            Ok(WsMessage::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => server_events(text),
                Err(_) => {
                    warn!("[Connection] Ignoring non-UTF-8 binary frame ({} bytes).", data.len());
                    continue;
                }
            },
            Ok(WsMessage::Close(frame)) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                    .unwrap_or_else(|| "closed by server".to_string());
                info!("[Connection] Server closed the session: {}", reason);
                let _ = events.send(SessionEvent::Close(reason)).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("[Connection] WebSocket error: {}", e);
                let _ = events.send(SessionEvent::Error(e.to_string())).await;
                return;
            }
        };
        for event in decoded {
            if events.send(event).await.is_err() {
                debug!("[Connection] Event receiver dropped; reader exiting.");
                return;
            }
        }
    }
    let _ = events
        .send(SessionEvent::Close("stream ended".to_string()))
        .await;
}

/// Turns one JSON server message into session events.
pub(crate) fn server_events(text: &str) -> Vec<SessionEvent> {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("[Connection] Unparseable server message: {}", e);
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        info!("[Connection] setupComplete received.");
        events.push(SessionEvent::Open);
    }
    events.extend(message.audio_blobs().map(|blob| {
        let rate = rate_from_mime_type(&blob.mime_type).unwrap_or(GEMINI_AUDIO_SAMPLE_RATE_HZ_OUTPUT);
        SessionEvent::Audio(TransportFrame::from_base64(blob.data.clone(), rate))
    }));
    if let Some(content) = &message.server_content {
        if content.interrupted {
            debug!("[Connection] Model turn interrupted.");
        }
        if content.turn_complete {
            debug!("[Connection] Model turn complete.");
        }
    }
    if let Some(go_away) = &message.go_away {
        warn!(
            "[Connection] Server sent goAway (time left: {}).",
            go_away.time_left.as_deref().unwrap_or("unknown")
        );
    }
    if let Some(usage) = &message.usage_metadata {
        trace!("[Connection] Usage metadata: {}", usage);
    }
    if let Some(err) = &message.error {
        events.push(SessionEvent::Error(
            err.message
                .clone()
                .unwrap_or_else(|| "unspecified server error".to_string()),
        ));
    }
    events
}
