use serde::{Deserialize, Serialize};

/// Messages the server sends to a telephony client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The call was accepted.
    Ack {
        call_id: String,
    },
    MediaOutput {
        /// Base64-encoded audio in the negotiated output format.
        payload: String,
    },
    Text {
        content: String,
    },
    /// Drop any agent audio still buffered for playback.
    Clear,
    Dtmf {
        button: String,
    },
    TransferCall {
        target: String,
    },
    UpdateCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pronunciation_dict_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text { content: content.into() }
    }
}
