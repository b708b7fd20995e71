//! Typed client facade for linkrpc.
//!
//! A [`Client`] wraps a link chain, built with
//! [`ChainBuilder`](linkrpc_core::ChainBuilder), and issues queries,
//! mutations and subscriptions through it. Whether `subscription` is
//! available is decided by the chain's terminating link at compile time.

pub mod client;
pub mod links;
pub mod logging;

pub use client::{CallOptions, Client, ClientBuilder, Procedure, SubscriptionHandlers, Unsubscribe};
pub use links::{is_subscription, LoggerLink, RetryLink, RetryPolicy, SplitLink};

// Re-export the building blocks callers need to assemble a chain.
pub use linkrpc_core::{
    error_codes, link_fn, AllowsSubscriptions, Chain, ChainBuilder, ClientError, ErrorShape,
    Link, Next, Operation, OperationContext, OperationKind, OperationResult,
    SubscriptionsSupported, SubscriptionsUnchecked, SubscriptionsUnsupported, TerminatingLink,
};
pub use linkrpc_transport as transport;
pub use tokio_util::sync::CancellationToken;
