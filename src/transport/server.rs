//! WebSocket boundary: one connection per call.
//!
//! A connection must open with `start`. Once the call is accepted the server
//! acks it and then pumps client frames into the call's engine and engine
//! outputs back out as frames until either side ends the call, the client
//! goes quiet for longer than the idle timeout, or a frame breaks the protocol.

use super::speech::{SpeechBridge, TextOnlyBridge, decode_media};
use super::ws::{self, WsStream};
use crate::protocol::{ClientMessage, CloseReason, ServerMessage, StartConfig};
use crate::sdk::{App, CallId, CallSession, EngineOutput, Event, LogLevel, Metadata, OutputEvent, TurnContent};
use crate::{Error, ProtocolViolation, Result, TRACE_LOG_MAX_BYTES, safe_truncate};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Close the call after this long without client activity. `None`
    /// disables the timer.
    #[serde(default = "default_idle_timeout", with = "crate::serde_ext::option_millis")]
    pub idle_timeout: Option<Duration>,
    /// How long a new connection may take to send `start`.
    #[serde(default = "default_start_timeout", with = "crate::serde_ext::millis")]
    pub start_timeout: Duration,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[allow(clippy::unnecessary_wraps)]
const fn default_idle_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

const fn default_start_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            idle_timeout: default_idle_timeout(),
            start_timeout: default_start_timeout(),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    #[must_use]
    pub fn bind(mut self, addr: impl Into<String>) -> Self {
        self.config.bind = addr.into();
        self
    }

    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn start_timeout(mut self, timeout: Duration) -> Self {
        self.config.start_timeout = timeout;
        self
    }

    /// # Errors
    /// Returns an error if a timeout is zero.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<ServerConfig> {
        if self.config.start_timeout.is_zero() {
            return Err(Error::InvalidConfig("start_timeout must be positive".to_string()));
        }
        if self.config.idle_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(Error::InvalidConfig("idle_timeout must be positive".to_string()));
        }
        Ok(self.config)
    }
}

/// Serves an [`App`] to telephony clients over WebSocket.
#[derive(Clone)]
pub struct Server {
    app: App,
    config: Arc<ServerConfig>,
    bridge: Arc<dyn SpeechBridge>,
}

impl Server {
    #[must_use]
    pub fn new(app: App) -> Self {
        Self { app, config: Arc::new(ServerConfig::default()), bridge: Arc::new(TextOnlyBridge) }
    }

    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    #[must_use]
    pub fn speech(mut self, bridge: impl SpeechBridge + 'static) -> Self {
        self.bridge = Arc::new(bridge);
        self
    }

    #[must_use]
    pub const fn app(&self) -> &App {
        &self.app
    }

    /// Bind the configured address and serve until the listener fails.
    ///
    /// # Errors
    /// Returns an error if binding or accepting fails.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    ///
    /// # Errors
    /// Returns an error if accepting a connection fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = ?listener.local_addr().ok(), "call server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move { server.handle(stream, peer).await });
        }
    }

    async fn handle(self, stream: TcpStream, peer: SocketAddr) {
        let mut ws = match ws::accept(stream).await {
            Ok(ws) => ws,
            Err(err) => {
                tracing::warn!(%peer, error = %err, "websocket handshake failed");
                return;
            }
        };
        tracing::debug!(%peer, "connection opened");

        let Some(reason) = self.converse(&mut ws).await else {
            tracing::debug!(%peer, "client went away");
            return;
        };
        if let CloseReason::Protocol(violation) = &reason {
            tracing::warn!(%peer, %violation, "closing on protocol violation");
            let error = ServerMessage::Error { message: violation.to_string() };
            if send_frame(&mut ws, &error).await.is_err() {
                return;
            }
        }
        if let Err(err) = ws.close_with(&reason).await {
            tracing::debug!(%peer, error = %err, "close frame not delivered");
        }
    }

    /// Run one call over `ws`. Returns the close to send, or `None` if the
    /// client is already gone.
    async fn converse(&self, ws: &mut WsStream) -> Option<CloseReason> {
        let start = match self.await_start(ws).await {
            Ok(start) => start,
            Err(reason) => return reason,
        };

        let mut session = match self.app.start_call(start.to_request()).await {
            Ok(session) => session,
            Err(Error::CallRejected(reason)) => return Some(CloseReason::Rejected(reason)),
            Err(err) => {
                tracing::error!(error = %err, "failed to start call");
                return Some(CloseReason::Internal(err.to_string()));
            }
        };
        let call_id = session.call_id().clone();

        let reason = match self.bridge.open(&call_id, start.input_format, start.output_format).await {
            Ok(()) => {
                let ack = ServerMessage::Ack { call_id: call_id.to_string() };
                match send_frame(ws, &ack).await {
                    Ok(()) => self.pump(ws, &mut session).await,
                    Err(_) => None,
                }
            }
            Err(err) => {
                tracing::error!(%call_id, error = %err, "speech bridge failed to open");
                Some(CloseReason::Internal(err.to_string()))
            }
        };

        if let Err(err) = session.end().await {
            tracing::trace!(%call_id, error = %err, "call already ended");
        }
        self.bridge.close(&call_id).await;
        tracing::info!(%call_id, reason = ?reason, "connection finished");
        reason
    }

    async fn await_start(&self, ws: &mut WsStream) -> std::result::Result<StartConfig, Option<CloseReason>> {
        let deadline = Instant::now() + self.config.start_timeout;
        loop {
            let inbound = tokio::time::timeout_at(deadline, read_inbound(ws))
                .await
                .map_err(|_| Some(CloseReason::IdleTimeout))?
                .map_err(Some)?;
            match inbound {
                Inbound::Keepalive => {}
                Inbound::Gone => return Err(None),
                Inbound::Message(ClientMessage::Start { config }) => {
                    config.validate().map_err(|err| Some(violation(err)))?;
                    return Ok(config);
                }
                Inbound::Message(other) => {
                    return Err(Some(CloseReason::Protocol(ProtocolViolation::StartExpected(
                        other.name().to_string(),
                    ))));
                }
            }
        }
    }

    async fn pump(&self, ws: &mut WsStream, session: &mut CallSession) -> Option<CloseReason> {
        let call_id = session.call_id().clone();
        let idle = self.config.idle_timeout;
        let idle_timer = tokio::time::sleep(idle.unwrap_or(Duration::MAX));
        tokio::pin!(idle_timer);

        loop {
            tokio::select! {
                inbound = read_inbound(ws) => {
                    match inbound {
                        Ok(Inbound::Gone) => return None,
                        Ok(Inbound::Keepalive) => {}
                        Ok(Inbound::Message(message)) => {
                            if let Err(reason) = self.on_message(session, message).await {
                                return Some(reason);
                            }
                        }
                        Err(reason) => return Some(reason),
                    }
                    if let Some(idle) = idle {
                        idle_timer.as_mut().reset(Instant::now() + idle);
                    }
                }
                output = session.next_output() => {
                    match output {
                        Some(EngineOutput::Event(event)) => match self.on_output(ws, &call_id, event).await {
                            Ok(None) => {}
                            Ok(Some(reason)) => return Some(reason),
                            Err(err) => {
                                tracing::debug!(%call_id, error = %err, "failed to deliver output");
                                return None;
                            }
                        },
                        Some(EngineOutput::Clear) => {
                            if send_frame(ws, &ServerMessage::Clear).await.is_err() {
                                return None;
                            }
                        }
                        Some(EngineOutput::Ended) | None => return Some(CloseReason::CallEnded),
                    }
                }
                () = &mut idle_timer, if idle.is_some() => {
                    tracing::info!(%call_id, "client idle, ending call");
                    return Some(CloseReason::IdleTimeout);
                }
            }
        }
    }

    async fn on_message(&self, session: &CallSession, message: ClientMessage) -> std::result::Result<(), CloseReason> {
        let call_id = session.call_id();
        let events = match message {
            ClientMessage::Start { .. } => return Err(CloseReason::Protocol(ProtocolViolation::DuplicateStart)),
            ClientMessage::MediaInput { payload } => {
                let audio = decode_media(&payload).map_err(violation)?;
                match self.bridge.transcribe(call_id, audio).await {
                    Ok(events) => events,
                    Err(err) => {
                        tracing::warn!(%call_id, error = %err, "transcription failed");
                        Vec::new()
                    }
                }
            }
            ClientMessage::Text { content } => vec![
                Event::UserTurnStarted,
                Event::UserTurnEnded { content: vec![TurnContent::text(content)] },
            ],
            ClientMessage::Dtmf { button } => vec![Event::UserDtmfSent { button }],
            ClientMessage::Custom { metadata } => {
                tracing::debug!(%call_id, ?metadata, "custom client event");
                Vec::new()
            }
        };

        for event in events {
            match session.send(event).await {
                Ok(()) => {}
                Err(Error::CallEnded) => return Err(CloseReason::CallEnded),
                Err(err) => tracing::warn!(%call_id, error = %err, "dropping input event"),
            }
        }
        Ok(())
    }

    async fn on_output(&self, ws: &mut WsStream, call_id: &CallId, event: OutputEvent) -> Result<Option<CloseReason>> {
        let frames = match event {
            OutputEvent::AgentSendText { text } => match self.bridge.synthesize(call_id, &text).await {
                Ok(frames) => frames,
                Err(err) => {
                    tracing::warn!(%call_id, error = %err, "speech synthesis failed");
                    Vec::new()
                }
            },
            OutputEvent::AgentSendDtmf { button } => vec![ServerMessage::Dtmf { button }],
            OutputEvent::AgentTransferCall { target } => vec![ServerMessage::TransferCall { target }],
            OutputEvent::AgentUpdateCall { voice_id, pronunciation_dict_id, .. } => {
                vec![ServerMessage::UpdateCall { voice_id, pronunciation_dict_id }]
            }
            OutputEvent::AgentEndCall => return Ok(Some(CloseReason::AgentEndedCall)),
            OutputEvent::AgentToolCalled { id, name, .. } => {
                tracing::debug!(%call_id, tool = %name, %id, "tool called");
                Vec::new()
            }
            OutputEvent::AgentToolReturned { id, name, .. } => {
                tracing::debug!(%call_id, tool = %name, %id, "tool returned");
                Vec::new()
            }
            OutputEvent::LogMetric { name, value } => {
                tracing::info!(%call_id, metric = %name, %value, "agent metric");
                Vec::new()
            }
            OutputEvent::LogMessage { name, level, message, metadata } => {
                log_message(call_id, &name, level, &message, &metadata);
                Vec::new()
            }
        };
        for frame in &frames {
            send_frame(ws, frame).await?;
        }
        Ok(None)
    }
}

enum Inbound {
    Message(ClientMessage),
    /// Protocol-level traffic that only proves the client is alive.
    Keepalive,
    Gone,
}

async fn read_inbound(ws: &mut WsStream) -> std::result::Result<Inbound, CloseReason> {
    let Some(frame) = ws.next().await else {
        return Ok(Inbound::Gone);
    };
    match frame {
        Ok(Message::Text(text)) => {
            tracing::trace!("Received frame: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
            serde_json::from_str::<ClientMessage>(&text)
                .map(Inbound::Message)
                .map_err(|err| CloseReason::Protocol(ProtocolViolation::MalformedFrame(err.to_string())))
        }
        Ok(Message::Binary(_)) => Err(CloseReason::Protocol(ProtocolViolation::BinaryFrame)),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => Ok(Inbound::Keepalive),
        Ok(Message::Close(_)) => Ok(Inbound::Gone),
        Err(err) => {
            tracing::debug!(error = %err, "websocket read failed");
            Ok(Inbound::Gone)
        }
    }
}

async fn send_frame(ws: &mut WsStream, frame: &ServerMessage) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    tracing::trace!("Sending frame: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
    ws.send(Message::Text(json.into())).await?;
    Ok(())
}

fn violation(err: Error) -> CloseReason {
    match err {
        Error::Protocol(violation) => CloseReason::Protocol(violation),
        other => CloseReason::Protocol(ProtocolViolation::MalformedFrame(other.to_string())),
    }
}

fn log_message(call_id: &CallId, name: &str, level: LogLevel, message: &str, metadata: &Metadata) {
    match level {
        LogLevel::Trace => tracing::trace!(%call_id, event = %name, ?metadata, "{message}"),
        LogLevel::Debug => tracing::debug!(%call_id, event = %name, ?metadata, "{message}"),
        LogLevel::Info => tracing::info!(%call_id, event = %name, ?metadata, "{message}"),
        LogLevel::Warn => tracing::warn!(%call_id, event = %name, ?metadata, "{message}"),
        LogLevel::Error => tracing::error!(%call_id, event = %name, ?metadata, "{message}"),
    }
}
