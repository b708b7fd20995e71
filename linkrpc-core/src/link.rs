//! Composable request pipeline.
//!
//! A chain is an ordered list of links. Every link but the last forwards
//! (possibly transformed) operations to [`Next`]; the last one is a
//! terminating link that performs I/O and never calls `next`.
//!
//! Whether a chain can carry subscriptions is tracked in its type through
//! the terminating link's [`SubscriptionSupport`] marker. The marker has no
//! runtime behaviour; transports still reject what they cannot carry.

use crate::error::ClientError;
use crate::observable::{Observable, Sink, Teardown};
use crate::operation::{Operation, OperationResult};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::error;

pub trait Link: Send + Sync + 'static {
    fn call(&self, op: Operation, next: Next) -> OperationResult;

    /// Terminating links perform I/O and must never call `next`.
    fn is_terminating(&self) -> bool {
        false
    }
}

/// A link that ends a chain. `Subscriptions` records, at compile time,
/// whether subscriptions can be issued through it.
pub trait TerminatingLink: Link {
    type Subscriptions: SubscriptionSupport;
}

pub trait SubscriptionSupport: Send + Sync + 'static {}

/// The terminating link can carry subscriptions.
#[derive(Debug)]
pub enum SubscriptionsSupported {}

/// The terminating link is request/response only.
#[derive(Debug)]
pub enum SubscriptionsUnsupported {}

/// Built from a runtime link list; support is only known when a
/// subscription reaches the transport.
#[derive(Debug)]
pub enum SubscriptionsUnchecked {}

impl SubscriptionSupport for SubscriptionsSupported {}
impl SubscriptionSupport for SubscriptionsUnsupported {}
impl SubscriptionSupport for SubscriptionsUnchecked {}

/// Markers that allow `subscription` on a client.
pub trait AllowsSubscriptions: SubscriptionSupport {}
impl AllowsSubscriptions for SubscriptionsSupported {}
impl AllowsSubscriptions for SubscriptionsUnchecked {}

/// Capability of a link that routes to one of two branches.
pub trait Either<Other: SubscriptionSupport>: SubscriptionSupport {
    type Output: SubscriptionSupport;
}

impl<O: SubscriptionSupport> Either<O> for SubscriptionsSupported {
    type Output = SubscriptionsSupported;
}
impl Either<SubscriptionsSupported> for SubscriptionsUnsupported {
    type Output = SubscriptionsSupported;
}
impl Either<SubscriptionsUnsupported> for SubscriptionsUnsupported {
    type Output = SubscriptionsUnsupported;
}
impl Either<SubscriptionsUnchecked> for SubscriptionsUnsupported {
    type Output = SubscriptionsUnchecked;
}
impl Either<SubscriptionsSupported> for SubscriptionsUnchecked {
    type Output = SubscriptionsSupported;
}
impl Either<SubscriptionsUnsupported> for SubscriptionsUnchecked {
    type Output = SubscriptionsUnchecked;
}
impl Either<SubscriptionsUnchecked> for SubscriptionsUnchecked {
    type Output = SubscriptionsUnchecked;
}

/// The remainder of the chain after the current link.
#[derive(Clone)]
pub struct Next {
    links: Arc<[Arc<dyn Link>]>,
    index: usize,
}

impl Next {
    pub fn call(&self, op: Operation) -> OperationResult {
        match self.links.get(self.index) {
            Some(link) => link.call(
                op,
                Next {
                    links: self.links.clone(),
                    index: self.index + 1,
                },
            ),
            None => {
                error!(
                    op_id = %op.id,
                    path = %op.path,
                    "next() called past the end of the link chain"
                );
                Observable::error(ClientError::usage(
                    "next() called from a terminating link",
                ))
            }
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("len", &self.links.len())
            .finish()
    }
}

/// A validated link chain.
pub struct Chain<C: SubscriptionSupport> {
    links: Arc<[Arc<dyn Link>]>,
    _caps: PhantomData<fn() -> C>,
}

impl<C: SubscriptionSupport> Clone for Chain<C> {
    fn clone(&self) -> Self {
        Chain {
            links: self.links.clone(),
            _caps: PhantomData,
        }
    }
}

impl<C: SubscriptionSupport> fmt::Debug for Chain<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("links", &self.links.len())
            .finish()
    }
}

fn validate(links: &[Arc<dyn Link>]) -> Result<(), ClientError> {
    let Some(last) = links.last() else {
        return Err(ClientError::usage("link chain is empty"));
    };
    if !last.is_terminating() {
        return Err(ClientError::usage(
            "the last link of a chain must be a terminating link",
        ));
    }
    if let Some(pos) = links[..links.len() - 1]
        .iter()
        .position(|link| link.is_terminating())
    {
        return Err(ClientError::usage(format!(
            "terminating link at position {} is not last in the chain",
            pos
        )));
    }
    Ok(())
}

impl Chain<SubscriptionsUnchecked> {
    /// Build a chain from a runtime list, checking its shape once.
    pub fn from_links(links: Vec<Arc<dyn Link>>) -> Result<Self, ClientError> {
        validate(&links).inspect_err(|e| error!("invalid link chain: {}", e))?;
        Ok(Chain {
            links: links.into(),
            _caps: PhantomData,
        })
    }
}

impl<C: SubscriptionSupport> Chain<C> {
    /// Run the chain for one operation. Nothing executes until the returned
    /// observable is subscribed.
    pub fn execute(&self, op: Operation) -> OperationResult {
        let links = self.links.clone();
        Observable::new(move |observer| {
            let head = Next {
                links: links.clone(),
                index: 0,
            };
            let sub = head.call(op.clone()).subscribe(Sink::forward_to(observer));
            Teardown::from(sub)
        })
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// A chain can end another chain, which is how branching links nest.
impl<C: SubscriptionSupport> Link for Chain<C> {
    fn call(&self, op: Operation, _next: Next) -> OperationResult {
        self.execute(op)
    }

    fn is_terminating(&self) -> bool {
        true
    }
}

impl<C: SubscriptionSupport> TerminatingLink for Chain<C> {
    type Subscriptions = C;
}

/// Collects middleware links, then seals the chain with a terminating link.
#[derive(Default)]
pub struct ChainBuilder {
    links: Vec<Arc<dyn Link>>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link<L: Link>(mut self, link: L) -> Self {
        self.links.push(Arc::new(link));
        self
    }

    pub fn link_arc(mut self, link: Arc<dyn Link>) -> Self {
        self.links.push(link);
        self
    }

    pub fn terminate<T: TerminatingLink>(
        mut self,
        link: T,
    ) -> Result<Chain<T::Subscriptions>, ClientError> {
        self.links.push(Arc::new(link));
        validate(&self.links).inspect_err(|e| error!("invalid link chain: {}", e))?;
        Ok(Chain {
            links: self.links.into(),
            _caps: PhantomData,
        })
    }
}

impl fmt::Debug for ChainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainBuilder")
            .field("links", &self.links.len())
            .finish()
    }
}

/// Middleware link backed by a closure.
pub struct FnLink<F> {
    f: F,
}

pub fn link_fn<F>(f: F) -> FnLink<F>
where
    F: Fn(Operation, Next) -> OperationResult + Send + Sync + 'static,
{
    FnLink { f }
}

impl<F> Link for FnLink<F>
where
    F: Fn(Operation, Next) -> OperationResult + Send + Sync + 'static,
{
    fn call(&self, op: Operation, next: Next) -> OperationResult {
        (self.f)(op, next)
    }
}

impl<F> fmt::Debug for FnLink<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnLink")
    }
}

/// Terminating link backed by a closure, with an explicit capability marker.
pub struct TerminatingFnLink<F, C> {
    f: F,
    _caps: PhantomData<fn() -> C>,
}

pub fn terminating_fn<C, F>(f: F) -> TerminatingFnLink<F, C>
where
    C: SubscriptionSupport,
    F: Fn(Operation) -> OperationResult + Send + Sync + 'static,
{
    TerminatingFnLink {
        f,
        _caps: PhantomData,
    }
}

impl<F, C> Link for TerminatingFnLink<F, C>
where
    C: SubscriptionSupport,
    F: Fn(Operation) -> OperationResult + Send + Sync + 'static,
{
    fn call(&self, op: Operation, _next: Next) -> OperationResult {
        (self.f)(op)
    }

    fn is_terminating(&self) -> bool {
        true
    }
}

impl<F, C> TerminatingLink for TerminatingFnLink<F, C>
where
    C: SubscriptionSupport,
    F: Fn(Operation) -> OperationResult + Send + Sync + 'static,
{
    type Subscriptions = C;
}

impl<F, C> fmt::Debug for TerminatingFnLink<F, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TerminatingFnLink")
    }
}
