//! Seam between call audio and the engine's text events.

use crate::Result;
use crate::protocol::{AudioFormat, ServerMessage};
use crate::sdk::{CallId, Event};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

/// Converts caller audio into input events and agent text into output frames.
///
/// Implementations wrap a speech-to-text and text-to-speech service. One
/// bridge is shared by every connection of a server.
#[async_trait]
pub trait SpeechBridge: Send + Sync {
    /// Called once per connection after `start` is accepted.
    async fn open(&self, _call_id: &CallId, _input: AudioFormat, _output: AudioFormat) -> Result<()> {
        Ok(())
    }

    /// Decoded `media_input` audio. Returned events are sent to the engine
    /// in order.
    async fn transcribe(&self, call_id: &CallId, audio: Vec<u8>) -> Result<Vec<Event>>;

    /// Frames to send for a piece of agent speech.
    async fn synthesize(&self, call_id: &CallId, text: &str) -> Result<Vec<ServerMessage>>;

    async fn close(&self, _call_id: &CallId) {}
}

/// Bridge for text-only clients: ignores media and speaks with `text` frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextOnlyBridge;

#[async_trait]
impl SpeechBridge for TextOnlyBridge {
    async fn transcribe(&self, call_id: &CallId, audio: Vec<u8>) -> Result<Vec<Event>> {
        tracing::trace!(%call_id, bytes = audio.len(), "dropping media without a speech bridge");
        Ok(Vec::new())
    }

    async fn synthesize(&self, _call_id: &CallId, text: &str) -> Result<Vec<ServerMessage>> {
        Ok(vec![ServerMessage::text(text)])
    }
}

/// Wrap raw audio in a `media_output` frame.
#[must_use]
pub fn media_frame(audio: &[u8]) -> ServerMessage {
    ServerMessage::MediaOutput { payload: STANDARD.encode(audio) }
}

/// # Errors
/// Returns an error if `payload` is not valid base64.
#[allow(clippy::result_large_err)]
pub fn decode_media(payload: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_only_bridge_speaks_text_frames() {
        let bridge = TextOnlyBridge;
        let call_id = CallId::from("c1");
        assert!(bridge.transcribe(&call_id, vec![0, 1, 2]).await.unwrap().is_empty());
        assert_eq!(bridge.synthesize(&call_id, "hi").await.unwrap(), vec![ServerMessage::text("hi")]);
    }

    #[test]
    fn media_payloads_are_base64() {
        let ServerMessage::MediaOutput { payload } = media_frame(&[1, 2, 3]) else {
            panic!("expected media frame");
        };
        assert_eq!(decode_media(&payload).unwrap(), vec![1, 2, 3]);
        assert!(decode_media("not base64!").is_err());
    }
}
