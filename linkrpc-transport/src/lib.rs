pub mod backoff;
pub mod codec;
pub mod ipc;
pub mod loader;
pub mod mux;
pub mod transport;
#[cfg(feature = "http-batch")]
pub mod http;
#[cfg(feature = "http-batch")]
pub mod http_batch;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::{ExponentialBackoff, FixedDelay, RetryDelay};
pub use codec::{CodecError, JsonFrameCodec};
pub use ipc::{
    create_ipc_client, in_process, IpcAcceptor, IpcConfig, IpcConnector, IpcHostEnd, IpcLink,
};
pub use loader::{BatchFetcher, BatchLoader, CancelLoad, ItemResult, Load, LoaderOptions};
pub use mux::{ConnectionOptions, ConnectionState, KeepAliveConfig, LazyConfig, MuxClient};
pub use transport::{Connector, FrameSink, FrameStream, MessageChannel};
#[cfg(feature = "http-batch")]
pub use http::{HttpLink, HttpLinkConfig};
#[cfg(feature = "http-batch")]
pub use http_batch::{HttpBatchFetcher, HttpBatchLink, HttpBatchLinkConfig};
#[cfg(feature = "websocket")]
pub use websocket::{create_ws_client, WebSocketConfig, WebSocketConnector, WebSocketLink};
