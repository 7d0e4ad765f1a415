use crate::sdk::{AgentOverrides, CallRequest, Metadata};
use crate::{Error, ProtocolViolation};
use serde::{Deserialize, Serialize};
use std::fmt;

const PCM_DEFAULT_RATE: u32 = 16_000;
const PCM_RATES: [u32; 5] = [8_000, 16_000, 24_000, 44_100, 48_000];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioFormat {
    #[serde(rename = "audio/pcm")]
    Pcm {
        #[serde(default = "default_pcm_rate")]
        rate: u32,
    },
    #[serde(rename = "audio/pcmu")]
    Pcmu,
    #[serde(rename = "audio/pcma")]
    Pcma,
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pcm { rate } => write!(f, "audio/pcm@{rate}"),
            Self::Pcmu => write!(f, "audio/pcmu"),
            Self::Pcma => write!(f, "audio/pcma"),
        }
    }
}

const fn default_pcm_rate() -> u32 {
    PCM_DEFAULT_RATE
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::Pcm { rate: PCM_DEFAULT_RATE }
    }
}

impl AudioFormat {
    /// Telephony mu-law at 8 kHz.
    #[must_use]
    pub const fn telephony() -> Self {
        Self::Pcmu
    }

    #[must_use]
    pub const fn sample_rate(self) -> u32 {
        match self {
            Self::Pcm { rate } => rate,
            Self::Pcmu | Self::Pcma => 8_000,
        }
    }

    /// # Errors
    /// Returns an error if a PCM format uses an unsupported sample rate.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Self::Pcm { rate } if !PCM_RATES.contains(rate) => Err(ProtocolViolation::MalformedFrame(format!(
                "unsupported audio/pcm rate {rate}"
            ))
            .into()),
            _ => Ok(()),
        }
    }
}

/// Payload of the `start` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StartConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub input_format: AudioFormat,
    #[serde(default)]
    pub output_format: AudioFormat,
    #[serde(default, skip_serializing_if = "AgentOverrides::is_empty")]
    pub agent: AgentOverrides,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl StartConfig {
    /// # Errors
    /// Returns an error if either audio format is unsupported.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<(), Error> {
        self.input_format.validate()?;
        self.output_format.validate()
    }

    #[must_use]
    pub fn to_request(&self) -> CallRequest {
        CallRequest {
            call_id: self.call_id.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            agent: self.agent.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// WebSocket close codes used by the server.
pub mod close {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;

    pub const AGENT_ENDED_CALL: &str = "agent ended call";
    pub const IDLE_TIMEOUT: &str = "idle timeout";
    pub const CALL_ENDED: &str = "call ended";
}

/// Why the server is closing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    AgentEndedCall,
    IdleTimeout,
    CallEnded,
    Protocol(ProtocolViolation),
    Rejected(String),
    Internal(String),
}

impl CloseReason {
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::AgentEndedCall | Self::IdleTimeout | Self::CallEnded => close::NORMAL,
            Self::Protocol(ProtocolViolation::BinaryFrame) => close::UNSUPPORTED_DATA,
            Self::Protocol(_) => close::PROTOCOL_ERROR,
            Self::Rejected(_) => close::POLICY_VIOLATION,
            Self::Internal(_) => close::INTERNAL_ERROR,
        }
    }

    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::AgentEndedCall => close::AGENT_ENDED_CALL.to_string(),
            Self::IdleTimeout => close::IDLE_TIMEOUT.to_string(),
            Self::CallEnded => close::CALL_ENDED.to_string(),
            Self::Protocol(violation) => violation.to_string(),
            Self::Rejected(reason) | Self::Internal(reason) => reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_rate_defaults_and_validates() {
        let format: AudioFormat = serde_json::from_str(r#"{"type": "audio/pcm"}"#).unwrap();
        assert_eq!(format, AudioFormat::Pcm { rate: PCM_DEFAULT_RATE });
        assert!(format.validate().is_ok());
        assert!(AudioFormat::Pcm { rate: 11_025 }.validate().is_err());
        assert_eq!(AudioFormat::telephony().sample_rate(), 8_000);
    }

    #[test]
    fn close_reasons_map_to_codes() {
        assert_eq!(CloseReason::IdleTimeout.code(), 1000);
        assert_eq!(CloseReason::IdleTimeout.reason(), "idle timeout");
        assert_eq!(CloseReason::Protocol(ProtocolViolation::DuplicateStart).code(), 1002);
        assert_eq!(CloseReason::Protocol(ProtocolViolation::BinaryFrame).code(), 1003);
        assert_eq!(CloseReason::Rejected("busy".to_string()).code(), 1008);
    }
}
