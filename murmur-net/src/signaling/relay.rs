// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transports towards the signaling relay.
use thiserror::Error;

use crate::signaling::SignalingEnvelope;

/// Opens connections to a signaling relay.
pub trait RelayConnector: Send + Sync + 'static {
    type Connection: RelayConnection;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, RelayError>> + Send;
}

/// Established, bidirectional connection to a signaling relay.
pub trait RelayConnection: Send + 'static {
    fn send(
        &mut self,
        envelope: &SignalingEnvelope,
    ) -> impl Future<Output = Result<(), RelayError>> + Send;

    /// Returns the next envelope or `None` when the relay closed the connection.
    ///
    /// Malformed frames are skipped by implementations.
    fn recv(
        &mut self,
    ) -> impl Future<Output = Option<Result<SignalingEnvelope, RelayError>>> + Send;
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is unreachable: {0}")]
    Unreachable(String),

    #[error("relay connection closed")]
    Closed,

    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "websocket")]
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketConnector};

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
    use tracing::{debug, warn};

    use crate::config::SignalingConfig;
    use crate::signaling::SignalingEnvelope;

    use super::{RelayConnection, RelayConnector, RelayError};

    /// Connects to a relay speaking JSON envelopes over WebSocket text frames.
    #[derive(Clone, Debug)]
    pub struct WebSocketConnector {
        relay_url: String,
        auth_token: Option<String>,
    }

    impl WebSocketConnector {
        pub fn new(relay_url: impl Into<String>, auth_token: Option<String>) -> Self {
            Self {
                relay_url: relay_url.into(),
                auth_token,
            }
        }

        pub fn from_config(config: &SignalingConfig) -> Self {
            Self::new(config.relay_url.clone(), config.auth_token.clone())
        }
    }

    impl RelayConnector for WebSocketConnector {
        type Connection = WebSocketConnection;

        async fn connect(&self) -> Result<Self::Connection, RelayError> {
            let mut request = self.relay_url.as_str().into_client_request()?;
            if let Some(token) = &self.auth_token {
                let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                    RelayError::InvalidConfig("auth token is not a valid header".into())
                })?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }

            let (stream, response) = connect_async(request).await?;
            debug!(status = %response.status(), "connected to signaling relay");

            Ok(WebSocketConnection { stream })
        }
    }

    #[derive(Debug)]
    pub struct WebSocketConnection {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    impl RelayConnection for WebSocketConnection {
        async fn send(&mut self, envelope: &SignalingEnvelope) -> Result<(), RelayError> {
            let text = envelope.to_json()?;
            self.stream.send(Message::text(text)).await?;
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<SignalingEnvelope, RelayError>> {
            loop {
                let message = match self.stream.next().await? {
                    Ok(message) => message,
                    Err(err) => return Some(Err(err.into())),
                };

                match message {
                    Message::Text(text) => match SignalingEnvelope::from_json(text.as_str()) {
                        Ok(envelope) => return Some(Ok(envelope)),
                        Err(err) => warn!("dropping malformed signaling frame: {err}"),
                    },
                    Message::Close(_) => return None,
                    // Pings are answered by tungstenite itself.
                    _ => continue,
                }
            }
        }
    }
}
