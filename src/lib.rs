#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

pub mod error;
pub mod protocol;
pub mod sdk;
mod serde_ext;
pub mod transport;

pub use error::{Error, ProtocolViolation, ProviderError, ProviderErrorKind, Result};
pub use protocol::{AudioFormat, ClientMessage, CloseReason, ServerMessage, StartConfig};
pub use sdk::{
    Agent, AgentConfig, AgentOverrides, App, AppBuilder, Args, CallContext, CallHandlers, CallId, CallRequest,
    CallSession, CallStatus, EngineConfig, EngineHandle, EngineOutput, EngineState, Event, EventFilter, EventKind,
    FnAgent, History, LlmAgent, LlmAgentBuilder, LogLevel, Metadata, OutputEvent, Paradigm, PreCallDecision,
    ReasoningDelta, ReasoningPolicy, ReasoningProvider, ReasoningRequest, Tool, ToolContext, ToolOutput,
    ToolRegistry, Turn, TurnContent, TurnContext, TurnEngine, agent_as_handoff,
};
pub use transport::{Server, ServerConfig, SpeechBridge, TextOnlyBridge};

use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde_json::from_str;
use tokio_tungstenite::tungstenite::protocol::Message;
use transport::ws::WsStream;

pub(crate) const TRACE_LOG_MAX_BYTES: usize = 1024;
const MAX_MEDIA_CHUNK_BYTES: usize = 1024 * 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

/// The telephony side of a call connection.
///
/// Harnesses and tests use it to drive a [`Server`]. Thread safety:
/// `CallClient` is `Send` but not `Sync` because the underlying WebSocket
/// stream is not `Sync`.
#[must_use]
pub struct CallClient {
    stream: WsStream,
    close: Option<(u16, String)>,
}

impl CallClient {
    /// Connect to a call server at a `ws://` or `wss://` URL.
    ///
    /// # Errors
    /// Returns an error if the connection fails or if the URL is invalid.
    pub async fn connect(url: &str) -> Result<Self> {
        let stream = transport::ws::connect(url).await?;
        Ok(Self { stream, close: None })
    }

    /// Send a client message to the server.
    ///
    /// # Errors
    /// Returns an error if validation, serialization or the WebSocket send fails.
    pub async fn send(&mut self, message: ClientMessage) -> Result<()> {
        validate_client_message(&message)?;
        let json = serde_json::to_string(&message)?;
        tracing::trace!("Sending message: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
        self.stream.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Send a raw frame, bypassing validation.
    ///
    /// # Errors
    /// Returns an error if the WebSocket send fails.
    pub async fn send_raw(&mut self, frame: Message) -> Result<()> {
        self.stream.send(frame).await?;
        Ok(())
    }

    /// Receive the next server message. `None` once the server closed the
    /// connection; the close code is then available from [`Self::close_frame`].
    ///
    /// # Errors
    /// Returns an error if deserialization fails or if the WebSocket fails.
    pub async fn next_message(&mut self) -> Result<Option<ServerMessage>> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => {
                    tracing::trace!("Received message: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                    return Ok(Some(from_str::<ServerMessage>(&text)?));
                }
                Message::Close(frame) => {
                    tracing::info!("WebSocket connection closed by server");
                    self.close = frame.map(|frame| (u16::from(frame.code), frame.reason.as_str().to_string()));
                    return Ok(None);
                }
                Message::Ping(payload) => {
                    tracing::debug!("Received Ping, sending Pong");
                    self.stream.send(Message::Pong(payload)).await?;
                }
                _ => (),
            }
        }
        Ok(None)
    }

    /// Code and reason of the server's close frame, if one was received.
    #[must_use]
    pub fn close_frame(&self) -> Option<(u16, &str)> {
        self.close.as_ref().map(|(code, reason)| (*code, reason.as_str()))
    }

    /// Split the client into a sender and a receiver for concurrent usage.
    pub fn split(self) -> (CallSender, CallReceiver) {
        let (write, read) = self.stream.split();
        (CallSender { write }, CallReceiver { read })
    }

    /// Re-unify a split client.
    ///
    /// # Errors
    /// Returns an error if the split halves don't match or cannot be reunited.
    #[allow(clippy::result_large_err)]
    pub fn unsplit(sender: CallSender, receiver: CallReceiver) -> Result<Self> {
        let stream = receiver
            .read
            .reunite(sender.write)
            .map_err(|_| Error::InvalidConfig("mismatched client halves".to_string()))?;
        Ok(Self { stream, close: None })
    }
}

pub(crate) fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

/// The sending half of a split `CallClient`.
pub struct CallSender {
    write: futures::stream::SplitSink<WsStream, Message>,
}

impl CallSender {
    /// Send a client message.
    ///
    /// # Errors
    /// Returns an error if validation, serialization or sending fails.
    pub async fn send(&mut self, message: ClientMessage) -> Result<()> {
        validate_client_message(&message)?;
        let json = serde_json::to_string(&message)?;
        tracing::trace!("Sending message (split): {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }
}

#[allow(clippy::result_large_err)]
fn validate_client_message(message: &ClientMessage) -> Result<()> {
    match message {
        ClientMessage::MediaInput { payload } => {
            let size = estimate_base64_decoded_len(payload)?;
            if size > MAX_MEDIA_CHUNK_BYTES {
                return Err(ProtocolViolation::MalformedFrame(format!(
                    "media_input exceeds {MAX_MEDIA_CHUNK_BYTES} bytes ({size} bytes)"
                ))
                .into());
            }
        }
        ClientMessage::Start { config } => config.validate()?,
        ClientMessage::Dtmf { button } => {
            if !is_dtmf_button(button) {
                return Err(ProtocolViolation::MalformedFrame(format!("invalid dtmf button {button:?}")).into());
            }
        }
        ClientMessage::Text { .. } | ClientMessage::Custom { .. } => {}
    }
    Ok(())
}

fn is_dtmf_button(button: &str) -> bool {
    let mut chars = button.chars();
    matches!((chars.next(), chars.next()), (Some('0'..='9' | '*' | '#' | 'A'..='D'), None))
}

#[allow(clippy::result_large_err)]
fn estimate_base64_decoded_len(s: &str) -> Result<usize> {
    let invalid = |detail: &str| -> Error {
        ProtocolViolation::MalformedFrame(format!("media_input {detail}")).into()
    };
    let bytes = s.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(invalid("invalid base64 length"));
    }

    let mut padding = 0;
    let mut seen_padding = false;
    for &b in bytes {
        if b == b'=' {
            seen_padding = true;
            padding += 1;
            continue;
        }
        if seen_padding {
            return Err(invalid("invalid base64 padding"));
        }
        let is_valid = matches!(b,
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/'
        );
        if !is_valid {
            return Err(invalid("invalid base64 character"));
        }
    }

    if padding > 2 {
        return Err(invalid("invalid base64 padding length"));
    }

    Ok(bytes.len() / 4 * 3 - padding)
}

/// The receiving half of a split `CallClient`.
pub struct CallReceiver {
    read: futures::stream::SplitStream<WsStream>,
}

impl CallReceiver {
    /// Exposes an asynchronous stream of `Result<ServerMessage>` that preserves Errors.
    #[must_use]
    pub fn try_into_stream(self) -> BoxStream<'static, Result<ServerMessage>> {
        self.read.map(|res| res.map_err(Error::from)).filter_map(|res| async move {
            match res {
                Ok(Message::Text(text)) => {
                    tracing::trace!("Received message (stream): {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                    Some(from_str::<ServerMessage>(&text).map_err(Error::from))
                }
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        }).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let out = safe_truncate(s, 2);
        assert!(out.starts_with('h'));
        assert!(out.contains(TRACE_TRUNCATE_SUFFIX));
        assert_eq!(safe_truncate("short", 10), "short");
    }

    #[test]
    fn media_payloads_are_checked_before_sending() {
        let ok = ClientMessage::MediaInput { payload: "AAECAw==".to_string() };
        assert!(validate_client_message(&ok).is_ok());
        let bad = ClientMessage::MediaInput { payload: "AAE".to_string() };
        assert!(matches!(validate_client_message(&bad), Err(Error::Protocol(_))));
        assert_eq!(estimate_base64_decoded_len("AAECAw==").unwrap(), 4);
    }

    #[test]
    fn dtmf_buttons_are_single_keypad_keys() {
        for button in ["0", "9", "*", "#", "A"] {
            assert!(is_dtmf_button(button), "{button}");
        }
        for button in ["", "10", "x", "##"] {
            assert!(!is_dtmf_button(button), "{button}");
        }
    }
}
