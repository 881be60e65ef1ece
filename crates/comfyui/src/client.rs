//! WebSocket client for one ComfyUI instance.
//!
//! [`ComfyClient`] holds the base URL and the client id used for the
//! `clientId` handshake parameter. Call [`ComfyClient::connect`] to
//! establish a live event stream.

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::base_url::BaseUrl;
use crate::error::{ClientError, ErrorKind};

/// A live WebSocket event stream.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for one instance's event stream.
#[derive(Debug, Clone)]
pub struct ComfyClient {
    base: BaseUrl,
    client_id: String,
}

impl ComfyClient {
    /// Create a client for the given instance and client id.
    ///
    /// The same client id must be used for workflow submission so the
    /// server addresses execution events back to this stream.
    pub fn new(base: BaseUrl, client_id: impl Into<String>) -> Self {
        Self {
            base,
            client_id: client_id.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connect to the event stream endpoint.
    ///
    /// Any connection-level failure is classified as
    /// [`ErrorKind::StreamConnectFailed`], which the completion waiter
    /// treats as its cue to fall back to history polling.
    pub async fn connect(&self) -> Result<WsStream, ClientError> {
        let url = self.base.ws_url(&self.client_id);

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            ClientError::new(ErrorKind::StreamConnectFailed, "websocket connect failed")
                .with_context("url", url.as_str())
                .with_context("detail", e.to_string())
        })?;

        tracing::debug!(
            client_id = %self.client_id,
            url = %url,
            "Connected to ComfyUI event stream",
        );

        Ok(ws_stream)
    }
}
