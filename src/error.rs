use crate::sdk::schema::SchemaViolation;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    Upstream,
    Authentication,
    RateLimit,
    #[serde(other)]
    Unknown,
}

/// Failure reported by a reasoning provider.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Name of the provider that failed, filled in by the retry layer.
    pub provider: Option<String>,
}

impl ProviderError {
    #[must_use]
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), provider: None }
    }

    /// Authentication failures never succeed on retry; everything else may.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self.kind, ProviderErrorKind::Authentication)
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.provider {
            Some(name) => write!(f, "{:?} from {name}: {}", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Transport-level protocol violations. Fatal to the connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("expected start message, got {0}")]
    StartExpected(String),
    #[error("duplicate start message")]
    DuplicateStart,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("binary frames are not supported")]
    BinaryFrame,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to parse or serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("Schema violation: {0}")]
    SchemaViolation(#[from] SchemaViolation),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool failed: {0}")]
    Tool(String),

    #[error("Tool loop exceeded {limit} consecutive rounds")]
    ToolLoopExceeded { limit: usize },

    #[error("Reasoning provider error: {0}")]
    Provider(ProviderError),

    #[error("Reasoning providers exhausted after {attempts} attempts: {last}")]
    ProviderExhausted { attempts: usize, last: ProviderError },

    #[error("Reasoning step timed out after {0:?}")]
    ReasoningTimeout(Duration),

    #[error("Work was cancelled")]
    Cancelled,

    #[error("The call has ended")]
    CallEnded,

    #[error("Call rejected: {0}")]
    CallRejected(String),

    #[error("The connection was closed unexpectedly")]
    ConnectionClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} is an output event and cannot be sent to the engine")]
    UnexpectedEvent(crate::sdk::events::EventKind),
}

impl Error {
    /// Structural failures end the current turn but leave the call running.
    #[must_use]
    pub const fn is_turn_failure(&self) -> bool {
        matches!(
            self,
            Self::ToolLoopExceeded { .. }
                | Self::ProviderExhausted { .. }
                | Self::Provider(_)
                | Self::ReasoningTimeout(_)
        )
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Stable short name, used as the `reason` of `turn_failed` log events.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::WebSocket(_) | Self::ConnectionClosed => "transport",
            Self::Serialization(_) | Self::Base64(_) => "serialization",
            Self::Url(_) | Self::InvalidConfig(_) => "invalid_config",
            Self::Io(_) => "io",
            Self::Protocol(_) => "protocol_violation",
            Self::SchemaViolation(_) => "schema_violation",
            Self::UnknownTool(_) => "unknown_tool",
            Self::Tool(_) => "tool_failed",
            Self::ToolLoopExceeded { .. } => "tool_loop_exceeded",
            Self::Provider(_) => "provider_error",
            Self::ProviderExhausted { .. } => "provider_exhausted",
            Self::ReasoningTimeout(_) => "reasoning_timeout",
            Self::Cancelled => "cancelled",
            Self::CallEnded => "call_ended",
            Self::CallRejected(_) => "call_rejected",
            Self::UnexpectedEvent(_) => "unexpected_event",
        }
    }
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
