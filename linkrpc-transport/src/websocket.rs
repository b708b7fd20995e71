use crate::mux::{ConnectionOptions, MuxClient};
use crate::transport::{Connector, MessageChannel};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use linkrpc_core::{
    Link, Next, Operation, OperationResult, SubscriptionsSupported, TerminatingLink,
    TransportError,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, trace};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub url: String,
    /// Sent with the upgrade request of every connection.
    pub headers: BTreeMap<String, String>,
    #[serde(flatten)]
    pub options: ConnectionOptions,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketConfig {
            url: url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    headers: BTreeMap<String, String>,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>) -> Self {
        WebSocketConnector {
            url: url.into(),
            headers,
        }
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ConnectionClosed
        }
        other => TransportError::Network(other.to_string()),
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<MessageChannel, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connect(format!("invalid header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connect(format!("invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "websocket connected");

        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(map_ws_error)
            .with(|text: String| async move {
                Ok::<_, TransportError>(Message::Text(text.into()))
            });
        let stream = stream.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|_| TransportError::Codec("binary frame is not UTF-8".into())),
                ),
                Ok(other) => {
                    trace!("ignoring websocket control frame: {:?}", other);
                    None
                }
                Err(e) => Some(Err(map_ws_error(e))),
            }
        });
        Ok(MessageChannel::new(Box::pin(sink), Box::pin(stream)))
    }
}

/// Build a multiplexer that talks to `config.url`. Must be called inside a
/// tokio runtime.
pub fn create_ws_client(config: WebSocketConfig) -> MuxClient {
    let connector = WebSocketConnector::new(config.url, config.headers);
    MuxClient::new(Arc::new(connector), config.options)
}

/// Terminating link that runs every operation, subscriptions included,
/// over one shared WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketLink {
    client: MuxClient,
}

impl WebSocketLink {
    pub fn new(client: MuxClient) -> Self {
        WebSocketLink { client }
    }

    pub fn connect(config: WebSocketConfig) -> Self {
        Self::new(create_ws_client(config))
    }

    pub fn client(&self) -> &MuxClient {
        &self.client
    }
}

impl Link for WebSocketLink {
    fn call(&self, op: Operation, _next: Next) -> OperationResult {
        self.client.operation(op)
    }

    fn is_terminating(&self) -> bool {
        true
    }
}

impl TerminatingLink for WebSocketLink {
    type Subscriptions = SubscriptionsSupported;
}
