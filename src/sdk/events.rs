//! Call event model.
//!
//! Every record a call can carry is a variant of [`Event`]. Output-only
//! variants are also available as the narrower [`OutputEvent`], which is what
//! agents and tools emit.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub type Metadata = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Content of a finished user turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Text { content: String },
    Dtmf { button: String },
}

impl TurnContent {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text { content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    CallStarted,
    CallEnded,
    UserTurnStarted,
    UserTurnEnded {
        content: Vec<TurnContent>,
    },
    UserTextSent {
        content: String,
    },
    UserDtmfSent {
        button: String,
    },
    AgentTurnStarted,
    AgentTurnEnded,
    AgentTextSent {
        content: String,
    },
    AgentDtmfSent {
        button: String,
    },
    AgentHandedOff,
    AgentSendText {
        text: String,
    },
    AgentSendDtmf {
        button: String,
    },
    AgentEndCall,
    AgentTransferCall {
        target: String,
    },
    AgentUpdateCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        voice_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pronunciation_dict_id: Option<String>,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
    AgentToolCalled {
        id: String,
        name: String,
        args: Value,
    },
    AgentToolReturned {
        id: String,
        name: String,
        args: Value,
        result: Value,
    },
    LogMetric {
        name: String,
        value: Value,
    },
    LogMessage {
        name: String,
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
}

/// Field-less discriminant of [`Event`], used by run and cancel filters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CallStarted,
    CallEnded,
    UserTurnStarted,
    UserTurnEnded,
    UserTextSent,
    UserDtmfSent,
    AgentTurnStarted,
    AgentTurnEnded,
    AgentTextSent,
    AgentDtmfSent,
    AgentHandedOff,
    AgentSendText,
    AgentSendDtmf,
    AgentEndCall,
    AgentTransferCall,
    AgentUpdateCall,
    AgentToolCalled,
    AgentToolReturned,
    LogMetric,
    LogMessage,
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::CallStarted => EventKind::CallStarted,
            Self::CallEnded => EventKind::CallEnded,
            Self::UserTurnStarted => EventKind::UserTurnStarted,
            Self::UserTurnEnded { .. } => EventKind::UserTurnEnded,
            Self::UserTextSent { .. } => EventKind::UserTextSent,
            Self::UserDtmfSent { .. } => EventKind::UserDtmfSent,
            Self::AgentTurnStarted => EventKind::AgentTurnStarted,
            Self::AgentTurnEnded => EventKind::AgentTurnEnded,
            Self::AgentTextSent { .. } => EventKind::AgentTextSent,
            Self::AgentDtmfSent { .. } => EventKind::AgentDtmfSent,
            Self::AgentHandedOff => EventKind::AgentHandedOff,
            Self::AgentSendText { .. } => EventKind::AgentSendText,
            Self::AgentSendDtmf { .. } => EventKind::AgentSendDtmf,
            Self::AgentEndCall => EventKind::AgentEndCall,
            Self::AgentTransferCall { .. } => EventKind::AgentTransferCall,
            Self::AgentUpdateCall { .. } => EventKind::AgentUpdateCall,
            Self::AgentToolCalled { .. } => EventKind::AgentToolCalled,
            Self::AgentToolReturned { .. } => EventKind::AgentToolReturned,
            Self::LogMetric { .. } => EventKind::LogMetric,
            Self::LogMessage { .. } => EventKind::LogMessage,
        }
    }

    #[must_use]
    pub const fn is_output(&self) -> bool {
        self.kind().is_output()
    }

    #[must_use]
    pub const fn is_input(&self) -> bool {
        !self.is_output()
    }

    #[must_use]
    pub fn user_turn_ended(text: impl Into<String>) -> Self {
        Self::UserTurnEnded { content: vec![TurnContent::text(text)] }
    }

    /// Concatenated text of a finished user turn, if this is one.
    #[must_use]
    pub fn user_text(&self) -> Option<String> {
        match self {
            Self::UserTurnEnded { content } => {
                let parts: Vec<&str> = content
                    .iter()
                    .filter_map(|part| match part {
                        TurnContent::Text { content } => Some(content.as_str()),
                        TurnContent::Dtmf { .. } => None,
                    })
                    .collect();
                Some(parts.join(" "))
            }
            Self::UserTextSent { content } => Some(content.clone()),
            _ => None,
        }
    }
}

impl EventKind {
    #[must_use]
    pub const fn is_output(self) -> bool {
        matches!(
            self,
            Self::AgentSendText
                | Self::AgentSendDtmf
                | Self::AgentEndCall
                | Self::AgentTransferCall
                | Self::AgentUpdateCall
                | Self::AgentToolCalled
                | Self::AgentToolReturned
                | Self::LogMetric
                | Self::LogMessage
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// An event an agent or tool may emit toward the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    AgentSendText {
        text: String,
    },
    AgentSendDtmf {
        button: String,
    },
    AgentEndCall,
    AgentTransferCall {
        target: String,
    },
    AgentUpdateCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        voice_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pronunciation_dict_id: Option<String>,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
    AgentToolCalled {
        id: String,
        name: String,
        args: Value,
    },
    AgentToolReturned {
        id: String,
        name: String,
        args: Value,
        result: Value,
    },
    LogMetric {
        name: String,
        value: Value,
    },
    LogMessage {
        name: String,
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
}

impl OutputEvent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::AgentSendText { text: text.into() }
    }

    #[must_use]
    pub fn log(name: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self::LogMessage {
            name: name.into(),
            level,
            message: message.into(),
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn metric(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::LogMetric { name: name.into(), value: value.into() }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        Event::from(self.clone()).kind()
    }
}

impl From<OutputEvent> for Event {
    fn from(event: OutputEvent) -> Self {
        match event {
            OutputEvent::AgentSendText { text } => Self::AgentSendText { text },
            OutputEvent::AgentSendDtmf { button } => Self::AgentSendDtmf { button },
            OutputEvent::AgentEndCall => Self::AgentEndCall,
            OutputEvent::AgentTransferCall { target } => Self::AgentTransferCall { target },
            OutputEvent::AgentUpdateCall { voice_id, pronunciation_dict_id, metadata } => {
                Self::AgentUpdateCall { voice_id, pronunciation_dict_id, metadata }
            }
            OutputEvent::AgentToolCalled { id, name, args } => Self::AgentToolCalled { id, name, args },
            OutputEvent::AgentToolReturned { id, name, args, result } => {
                Self::AgentToolReturned { id, name, args, result }
            }
            OutputEvent::LogMetric { name, value } => Self::LogMetric { name, value },
            OutputEvent::LogMessage { name, level, message, metadata } => {
                Self::LogMessage { name, level, message, metadata }
            }
        }
    }
}

impl TryFrom<Event> for OutputEvent {
    type Error = Event;

    fn try_from(event: Event) -> Result<Self, Self::Error> {
        match event {
            Event::AgentSendText { text } => Ok(Self::AgentSendText { text }),
            Event::AgentSendDtmf { button } => Ok(Self::AgentSendDtmf { button }),
            Event::AgentEndCall => Ok(Self::AgentEndCall),
            Event::AgentTransferCall { target } => Ok(Self::AgentTransferCall { target }),
            Event::AgentUpdateCall { voice_id, pronunciation_dict_id, metadata } => {
                Ok(Self::AgentUpdateCall { voice_id, pronunciation_dict_id, metadata })
            }
            Event::AgentToolCalled { id, name, args } => Ok(Self::AgentToolCalled { id, name, args }),
            Event::AgentToolReturned { id, name, args, result } => {
                Ok(Self::AgentToolReturned { id, name, args, result })
            }
            Event::LogMetric { name, value } => Ok(Self::LogMetric { name, value }),
            Event::LogMessage { name, level, message, metadata } => {
                Ok(Self::LogMessage { name, level, message, metadata })
            }
            other @ (Event::CallStarted
            | Event::CallEnded
            | Event::UserTurnStarted
            | Event::UserTurnEnded { .. }
            | Event::UserTextSent { .. }
            | Event::UserDtmfSent { .. }
            | Event::AgentTurnStarted
            | Event::AgentTurnEnded
            | Event::AgentTextSent { .. }
            | Event::AgentDtmfSent { .. }
            | Event::AgentHandedOff) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_events_round_trip_through_event() {
        let out = OutputEvent::text("hello");
        let event = Event::from(out.clone());
        assert_eq!(event.kind(), EventKind::AgentSendText);
        assert!(event.is_output());
        assert_eq!(OutputEvent::try_from(event).unwrap(), out);
    }

    #[test]
    fn input_events_do_not_convert_to_output() {
        let err = OutputEvent::try_from(Event::UserTurnStarted).unwrap_err();
        assert_eq!(err, Event::UserTurnStarted);
        assert!(Event::CallStarted.is_input());
    }

    #[test]
    fn user_turn_serializes_with_type_tag() {
        let event = Event::user_turn_ended("cancel please");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user_turn_ended");
        assert_eq!(json["content"][0]["content"], "cancel please");
        assert_eq!(event.user_text().as_deref(), Some("cancel please"));
    }
}
