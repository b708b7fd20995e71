use async_trait::async_trait;
use futures::{Sink, Stream};
use linkrpc_core::TransportError;
use std::fmt;
use std::pin::Pin;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One established duplex channel of JSON text frames. The stream ending
/// means the peer closed the connection.
pub struct MessageChannel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl MessageChannel {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        MessageChannel { sink, stream }
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageChannel")
    }
}

/// Opens physical connections for the multiplexer. Called once per
/// (re)connect; each call must yield a fresh channel.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    async fn connect(&self) -> Result<MessageChannel, TransportError>;
}
