use crate::error::Result;
use crate::protocol::CloseReason;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use url::Url;

#[derive(Debug)]
pub struct WsStream(WebSocketStream<MaybeTlsStream<TcpStream>>);

impl WsStream {
    pub(crate) const fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self(stream)
    }

    /// Send a close frame for `reason` and flush the sink.
    ///
    /// # Errors
    /// Returns an error if the close frame cannot be written.
    pub async fn close_with(&mut self, reason: &CloseReason) -> Result<()> {
        let frame = CloseFrame { code: CloseCode::from(reason.code()), reason: reason.reason().into() };
        tracing::debug!(code = reason.code(), reason = %reason.reason(), "closing connection");
        self.send(Message::Close(Some(frame))).await?;
        self.flush().await?;
        Ok(())
    }
}

impl futures::Stream for WsStream {
    type Item = std::result::Result<
        tokio_tungstenite::tungstenite::Message,
        tokio_tungstenite::tungstenite::Error,
    >;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.0).poll_next(cx)
    }
}

impl futures::Sink<tokio_tungstenite::tungstenite::Message> for WsStream {
    type Error = tokio_tungstenite::tungstenite::Error;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: tokio_tungstenite::tungstenite::Message,
    ) -> std::result::Result<(), Self::Error> {
        std::pin::Pin::new(&mut self.0).start_send(item)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_close(cx)
    }
}

/// Complete the server side of the WebSocket handshake.
///
/// # Errors
/// Returns an error if the handshake fails.
pub async fn accept(stream: TcpStream) -> Result<WsStream> {
    let ws_stream = accept_async(MaybeTlsStream::Plain(stream)).await?;
    Ok(WsStream::new(ws_stream))
}

/// Connect to a call server as a telephony client. Used by harnesses and tests.
///
/// # Errors
/// Returns an error if the URL is not `ws`/`wss` or the handshake fails.
pub async fn connect(url: &str) -> Result<WsStream> {
    let url = Url::parse(url)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(crate::Error::InvalidConfig(format!("unsupported scheme {}", url.scheme())));
    }
    let (ws_stream, _) = connect_async(url.as_str()).await?;

    tracing::info!(%url, "Connected to call server");

    Ok(WsStream::new(ws_stream))
}
