//! Core building blocks shared by the linkrpc transports and client:
//! the observable stream primitive, the operation model, wire messages and
//! the link chain.

pub mod error;
pub mod ids;
pub mod link;
pub mod observable;
pub mod operation;
pub mod wire;

pub use error::{error_codes, ClientError, ErrorShape, TransportError};
pub use ids::{OpId, OpIdAllocator};
pub use link::{
    link_fn, terminating_fn, AllowsSubscriptions, Chain, ChainBuilder, Either, FnLink, Link,
    Next, SubscriptionSupport, SubscriptionsSupported, SubscriptionsUnchecked,
    SubscriptionsUnsupported, TerminatingFnLink, TerminatingLink,
};
pub use observable::{
    observable_to_promise, AbortHandle, CompletedWithoutValue, Observable, ObservableStream,
    Observer, Promise, Sink, Subscription, TapEvent, Teardown,
};
pub use operation::{Envelope, Operation, OperationContext, OperationKind, OperationResult};
pub use wire::{
    ConnectionParamsMessage, HttpResponseBody, HttpResponseItem, IncomingMessage,
    OutgoingFrame, RequestMessage, RequestParams, ResultKind, ResultPayload,
};
