pub mod server;
pub mod speech;
pub mod ws;

pub use server::{Server, ServerConfig, ServerConfigBuilder};
pub use speech::{SpeechBridge, TextOnlyBridge};
pub use ws::WsStream;
