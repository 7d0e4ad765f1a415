use super::models::StartConfig;
use crate::sdk::Metadata;
use serde::{Deserialize, Serialize};

/// Messages a telephony client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Start {
        #[serde(default)]
        config: StartConfig,
    },
    MediaInput {
        /// Base64-encoded audio in the negotiated input format.
        payload: String,
    },
    Text {
        content: String,
    },
    Dtmf {
        button: String,
    },
    Custom {
        #[serde(default)]
        metadata: Metadata,
    },
}

impl ClientMessage {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::MediaInput { .. } => "media_input",
            Self::Text { .. } => "text",
            Self::Dtmf { .. } => "dtmf",
            Self::Custom { .. } => "custom",
        }
    }
}
