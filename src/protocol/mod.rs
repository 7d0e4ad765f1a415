//! JSON wire messages exchanged with telephony clients.

pub mod client_events;
pub mod models;
pub mod server_events;

pub use client_events::ClientMessage;
pub use models::{AudioFormat, CloseReason, StartConfig, close};
pub use server_events::ServerMessage;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_message_parses_with_defaults() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "start",
            "config": {
                "input_format": {"type": "audio/pcmu"},
                "agent": {"introduction": "Hello!"},
                "metadata": {"campaign": "spring"}
            }
        }))
        .unwrap();
        let ClientMessage::Start { config } = msg else {
            panic!("unexpected message: {msg:?}");
        };
        assert_eq!(config.input_format, AudioFormat::Pcmu);
        assert_eq!(config.output_format, AudioFormat::default());
        assert_eq!(config.agent.introduction.as_deref(), Some("Hello!"));
        assert_eq!(config.to_request().metadata["campaign"], "spring");
    }

    #[test]
    fn server_messages_use_snake_case_tags() {
        assert_eq!(serde_json::to_value(ServerMessage::Clear).unwrap(), json!({"type": "clear"}));
        assert_eq!(
            serde_json::to_value(ServerMessage::TransferCall { target: "+15550100".to_string() }).unwrap(),
            json!({"type": "transfer_call", "target": "+15550100"})
        );
    }

    #[test]
    fn unknown_message_types_fail_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "hangup"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "dtmf"}"#).is_err());
    }
}
