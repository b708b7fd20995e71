use futures::stream::{BoxStream, StreamExt};
use linkrpc_core::{
    observable_to_promise, AllowsSubscriptions, Chain, ClientError, Envelope, OpIdAllocator,
    Operation, OperationContext, OperationKind, Sink, Subscription, SubscriptionSupport,
    TransportError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Per-call options for queries and mutations.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Readable by every link in the chain.
    pub context: OperationContext,
    /// Cancelling unsubscribes the call; its future then never resolves.
    pub signal: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

type Callback = Box<dyn Fn() + Send + Sync>;

/// Callbacks for one subscription. Exactly one of `on_error` and
/// `on_complete` runs when the stream ends by itself; unsubscribing runs
/// neither.
#[derive(Default)]
pub struct SubscriptionHandlers {
    on_started: Option<Callback>,
    on_data: Option<Box<dyn Fn(Value) + Send + Sync>>,
    on_error: Option<Box<dyn FnOnce(ClientError) + Send>>,
    on_stopped: Option<Callback>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_started(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_started = Some(Box::new(f));
        self
    }

    pub fn on_data(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(ClientError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_stopped(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stopped = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    fn into_sink(self) -> Sink<Envelope, ClientError> {
        let SubscriptionHandlers {
            on_started,
            on_data,
            on_error,
            on_stopped,
            on_complete,
        } = self;
        let mut sink = Sink::new().on_next(move |envelope| match envelope {
            Envelope::Started => {
                if let Some(f) = &on_started {
                    f();
                }
            }
            Envelope::Data(value) => {
                if let Some(f) = &on_data {
                    f(value);
                }
            }
            Envelope::Stopped => {
                if let Some(f) = &on_stopped {
                    f();
                }
            }
        });
        if let Some(f) = on_error {
            sink = sink.on_error(f);
        }
        if let Some(f) = on_complete {
            sink = sink.on_complete(f);
        }
        sink
    }
}

impl fmt::Debug for SubscriptionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandlers")
            .field("on_started", &self.on_started.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_stopped", &self.on_stopped.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Returned by [`Client::subscription`]. Unsubscribing is idempotent and
/// never waits for the server.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    subscription: Subscription,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }
}

/// Typed entry point. Every call gets a fresh operation id and runs
/// through the configured chain.
pub struct Client<C: SubscriptionSupport> {
    chain: Chain<C>,
    ids: Arc<OpIdAllocator>,
}

impl<C: SubscriptionSupport> Clone for Client<C> {
    fn clone(&self) -> Self {
        Client {
            chain: self.chain.clone(),
            ids: self.ids.clone(),
        }
    }
}

impl<C: SubscriptionSupport> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("chain", &self.chain)
            .field("next_id", &self.ids.peek_next())
            .finish()
    }
}

pub struct ClientBuilder<C: SubscriptionSupport> {
    chain: Chain<C>,
    ids: Option<Arc<OpIdAllocator>>,
}

impl<C: SubscriptionSupport> ClientBuilder<C> {
    /// Share an id allocator with other clients that use the same transport,
    /// so their operation ids cannot collide.
    pub fn id_allocator(mut self, ids: Arc<OpIdAllocator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Client<C> {
        Client {
            chain: self.chain,
            ids: self.ids.unwrap_or_default(),
        }
    }
}

impl<C: SubscriptionSupport> fmt::Debug for ClientBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("chain", &self.chain)
            .field("shared_ids", &self.ids.is_some())
            .finish()
    }
}

fn to_input<I: Serialize + ?Sized>(input: &I) -> Result<Value, ClientError> {
    serde_json::to_value(input)
        .map_err(|e| ClientError::usage(format!("failed to serialize input: {}", e)))
}

fn from_output<O: DeserializeOwned>(value: Value) -> Result<O, ClientError> {
    serde_json::from_value(value).map_err(|e| ClientError::Deserialize(e.to_string()))
}

impl<C: SubscriptionSupport> Client<C> {
    pub fn new(chain: Chain<C>) -> Self {
        Self::builder(chain).build()
    }

    pub fn builder(chain: Chain<C>) -> ClientBuilder<C> {
        ClientBuilder { chain, ids: None }
    }

    pub fn chain(&self) -> &Chain<C> {
        &self.chain
    }

    /// Start a dotted procedure path, e.g. `client.procedure("post").procedure("byId")`.
    pub fn procedure(&self, segment: impl Into<String>) -> Procedure<C> {
        Procedure {
            client: self.clone(),
            segments: vec![segment.into()],
        }
    }

    fn operation(
        &self,
        kind: OperationKind,
        path: &str,
        input: Value,
        context: OperationContext,
    ) -> Operation {
        Operation::new(self.ids.allocate(), kind, path, input).with_context(context)
    }

    pub async fn query<I, O>(
        &self,
        path: &str,
        input: &I,
        options: CallOptions,
    ) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let value = self.query_value(path, to_input(input)?, options).await?;
        from_output(value)
    }

    pub async fn mutation<I, O>(
        &self,
        path: &str,
        input: &I,
        options: CallOptions,
    ) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let value = self.mutation_value(path, to_input(input)?, options).await?;
        from_output(value)
    }

    pub async fn query_value(
        &self,
        path: &str,
        input: Value,
        options: CallOptions,
    ) -> Result<Value, ClientError> {
        self.request(OperationKind::Query, path, input, options).await
    }

    pub async fn mutation_value(
        &self,
        path: &str,
        input: Value,
        options: CallOptions,
    ) -> Result<Value, ClientError> {
        self.request(OperationKind::Mutation, path, input, options).await
    }

    async fn request(
        &self,
        kind: OperationKind,
        path: &str,
        input: Value,
        options: CallOptions,
    ) -> Result<Value, ClientError> {
        let CallOptions { context, signal } = options;
        if signal.as_ref().is_some_and(CancellationToken::is_cancelled) {
            debug!(%kind, path, "call cancelled before it started");
            return std::future::pending().await;
        }

        let op = self.operation(kind, path, input, context);
        trace!(op_id = %op.id, %kind, path, "issuing call");
        let (promise, abort) = observable_to_promise(&self.chain.execute(op));

        let envelope = match signal {
            Some(signal) => {
                tokio::select! {
                    result = promise => result?,
                    _ = signal.cancelled() => {
                        debug!(%kind, path, "call cancelled");
                        abort.abort();
                        return std::future::pending().await;
                    }
                }
            }
            None => promise.await?,
        };

        envelope.into_data().ok_or_else(|| {
            ClientError::from(TransportError::Protocol(format!(
                "{} {} produced no data",
                kind, path
            )))
        })
    }
}

impl<C: AllowsSubscriptions> Client<C> {
    pub fn subscription(
        &self,
        path: &str,
        input: Value,
        handlers: SubscriptionHandlers,
    ) -> Unsubscribe {
        self.subscription_with(path, input, OperationContext::default(), handlers)
    }

    pub fn subscription_with(
        &self,
        path: &str,
        input: Value,
        context: OperationContext,
        handlers: SubscriptionHandlers,
    ) -> Unsubscribe {
        let op = self.operation(OperationKind::Subscription, path, input, context);
        trace!(op_id = %op.id, path, "subscribing");
        let subscription = self.chain.execute(op).subscribe(handlers.into_sink());
        Unsubscribe { subscription }
    }

    /// Data values of a subscription as a stream. Dropping the stream
    /// unsubscribes.
    pub fn subscription_stream(
        &self,
        path: &str,
        input: Value,
    ) -> BoxStream<'static, Result<Value, ClientError>> {
        let op = self.operation(
            OperationKind::Subscription,
            path,
            input,
            OperationContext::default(),
        );
        self.chain
            .execute(op)
            .into_stream()
            .filter_map(|item| {
                futures::future::ready(match item {
                    Ok(Envelope::Data(value)) => Some(Ok(value)),
                    Ok(_) => None,
                    Err(err) => Some(Err(err)),
                })
            })
            .boxed()
    }
}

/// Dotted procedure path under construction.
pub struct Procedure<C: SubscriptionSupport> {
    client: Client<C>,
    segments: Vec<String>,
}

impl<C: SubscriptionSupport> Procedure<C> {
    pub fn procedure(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn path(&self) -> String {
        self.segments.join(".")
    }

    pub async fn query<I, O>(&self, input: &I) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.client.query(&self.path(), input, CallOptions::default()).await
    }

    pub async fn query_with<I, O>(&self, input: &I, options: CallOptions) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.client.query(&self.path(), input, options).await
    }

    pub async fn mutation<I, O>(&self, input: &I) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.client.mutation(&self.path(), input, CallOptions::default()).await
    }

    pub async fn mutation_with<I, O>(
        &self,
        input: &I,
        options: CallOptions,
    ) -> Result<O, ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.client.mutation(&self.path(), input, options).await
    }
}

impl<C: AllowsSubscriptions> Procedure<C> {
    pub fn subscription<I>(
        &self,
        input: &I,
        handlers: SubscriptionHandlers,
    ) -> Result<Unsubscribe, ClientError>
    where
        I: Serialize + ?Sized,
    {
        Ok(self.client.subscription(&self.path(), to_input(input)?, handlers))
    }
}

impl<C: SubscriptionSupport> fmt::Debug for Procedure<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure").field("path", &self.path()).finish()
    }
}
