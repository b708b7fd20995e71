//! In-process / host-bridge transport: the same multiplexed protocol as the
//! WebSocket link, carried over any `AsyncRead + AsyncWrite` stream framed
//! with [`JsonFrameCodec`].

use crate::codec::JsonFrameCodec;
use crate::mux::{ConnectionOptions, MuxClient};
use crate::transport::{Connector, MessageChannel};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use linkrpc_core::{
    Link, Next, Operation, OperationResult, SubscriptionsSupported, TerminatingLink,
    TransportError,
};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;
const DUPLEX_BUFFER: usize = 64 * 1024;

trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IpcStream for T {}

type BoxedStream = Box<dyn IpcStream>;
type StreamFactory = Arc<dyn Fn() -> BoxFuture<'static, io::Result<BoxedStream>> + Send + Sync>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    #[serde(flatten)]
    pub options: ConnectionOptions,
    pub max_frame_size: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        IpcConfig {
            options: ConnectionOptions::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Opens host channels through a caller-provided factory.
#[derive(Clone)]
pub struct IpcConnector {
    factory: StreamFactory,
    max_frame_size: usize,
}

impl IpcConnector {
    pub fn new<F, Fut, S>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<S>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let factory: StreamFactory = Arc::new(move || {
            factory()
                .map(|res| res.map(|s| Box::new(s) as BoxedStream))
                .boxed()
        });
        IpcConnector {
            factory,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl fmt::Debug for IpcConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcConnector")
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

#[async_trait]
impl Connector for IpcConnector {
    async fn connect(&self) -> Result<MessageChannel, TransportError> {
        let stream = (self.factory)()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let framed = Framed::new(stream, JsonFrameCodec::with_max_frame_size(self.max_frame_size));
        let (sink, stream) = framed.split();
        Ok(MessageChannel::new(
            Box::pin(sink.sink_map_err(TransportError::from)),
            Box::pin(stream.map(|frame| frame.map_err(TransportError::from))),
        ))
    }
}

/// Connector/acceptor pair joined by in-memory duplex pipes. Every
/// (re)connect of the connector yields a fresh [`IpcHostEnd`] on the
/// acceptor.
pub fn in_process() -> (IpcConnector, IpcAcceptor) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = IpcConnector::new(move || {
        let tx = tx.clone();
        async move {
            let (client, host) = tokio::io::duplex(DUPLEX_BUFFER);
            tx.send(host)
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "host is gone"))?;
            Ok(client)
        }
    });
    (connector, IpcAcceptor { rx })
}

#[derive(Debug)]
pub struct IpcAcceptor {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl IpcAcceptor {
    /// Wait for the next client connection. `None` once the connector is
    /// dropped.
    pub async fn accept(&mut self) -> Option<IpcHostEnd> {
        let stream = self.rx.recv().await?;
        debug!("accepted ipc connection");
        Some(IpcHostEnd {
            framed: Framed::new(stream, JsonFrameCodec::new()),
        })
    }
}

/// Host side of one in-process connection.
pub struct IpcHostEnd {
    framed: Framed<DuplexStream, JsonFrameCodec>,
}

impl IpcHostEnd {
    pub async fn send(&mut self, text: impl Into<String>) -> Result<(), TransportError> {
        self.framed.send(text.into()).await?;
        Ok(())
    }

    /// Next frame from the client, or `None` when it hung up.
    pub async fn recv(&mut self) -> Option<String> {
        match self.framed.next().await? {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("ipc host read failed: {}", e);
                None
            }
        }
    }
}

impl fmt::Debug for IpcHostEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IpcHostEnd")
    }
}

pub fn create_ipc_client(connector: IpcConnector, config: IpcConfig) -> MuxClient {
    let connector = connector.with_max_frame_size(config.max_frame_size);
    MuxClient::new(Arc::new(connector), config.options)
}

/// Terminating link over an IPC multiplexer.
#[derive(Debug, Clone)]
pub struct IpcLink {
    client: MuxClient,
}

impl IpcLink {
    pub fn new(client: MuxClient) -> Self {
        IpcLink { client }
    }

    pub fn client(&self) -> &MuxClient {
        &self.client
    }
}

impl Link for IpcLink {
    fn call(&self, op: Operation, _next: Next) -> OperationResult {
        self.client.operation(op)
    }

    fn is_terminating(&self) -> bool {
        true
    }
}

impl TerminatingLink for IpcLink {
    type Subscriptions = SubscriptionsSupported;
}
