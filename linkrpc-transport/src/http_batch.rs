use crate::http::{emit_when_ready, item_result, subscription_rejected, HttpShared};
use crate::loader::{BatchFetcher, BatchLoader, ItemResult, LoaderOptions};
use async_trait::async_trait;
use linkrpc_core::{
    ClientError, HttpResponseBody, Link, Next, Observable, Operation, OperationKind,
    OperationResult, SubscriptionsUnsupported, Teardown, TerminatingLink, TransportError,
};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpBatchLinkConfig {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Longest GET URL a batch may produce before it is split.
    pub max_url_length: Option<usize>,
    pub max_items: Option<usize>,
    /// Collection window; zero batches whatever is issued in the same tick.
    pub batch_window_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HttpBatchLinkConfig {
    fn default() -> Self {
        HttpBatchLinkConfig {
            url: "http://localhost:3000/trpc".to_string(),
            headers: BTreeMap::new(),
            max_url_length: None,
            max_items: None,
            batch_window_ms: 0,
            timeout_ms: 30_000,
        }
    }
}

impl HttpBatchLinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        HttpBatchLinkConfig {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Fetches one batch of same-kind operations in a single HTTP request.
#[derive(Debug)]
pub struct HttpBatchFetcher {
    shared: Arc<HttpShared>,
    kind: OperationKind,
    max_url_length: Option<usize>,
}

impl HttpBatchFetcher {
    /// `{url}/{p1},{p2}?batch=1`, plus the inputs for GET requests.
    fn batch_url(&self, ops: &[Operation]) -> Result<Url, ClientError> {
        let paths: Vec<&str> = ops.iter().map(|op| op.path.as_str()).collect();
        let mut query = vec![("batch", "1".to_string())];
        if self.kind == OperationKind::Query {
            let inputs = serde_json::to_string(&indexed_inputs(ops)).map_err(TransportError::from)?;
            query.push(("input", inputs));
        }
        self.shared.url(&paths.join(","), &query)
    }
}

/// `{"0": input0, "1": input1, ...}`
fn indexed_inputs(ops: &[Operation]) -> Value {
    let map: Map<String, Value> = ops
        .iter()
        .enumerate()
        .map(|(index, op)| (index.to_string(), op.input.clone()))
        .collect();
    Value::Object(map)
}

#[async_trait]
impl BatchFetcher for HttpBatchFetcher {
    type Key = Operation;
    type Value = Value;

    fn validate(&self, ops: &[Operation]) -> bool {
        match (self.kind, self.max_url_length) {
            (OperationKind::Query, Some(max)) => self
                .batch_url(ops)
                .is_ok_and(|url| url.as_str().len() <= max),
            _ => true,
        }
    }

    async fn fetch(&self, ops: Vec<Operation>) -> Result<Vec<ItemResult<Value>>, ClientError> {
        let url = self.batch_url(&ops)?;
        let headers = self.shared.headers_for(&ops);
        let body = match self.kind {
            OperationKind::Mutation => Some(indexed_inputs(&ops)),
            _ => None,
        };
        debug!(kind = %self.kind, size = ops.len(), "sending http batch");
        let response = self.shared.send(self.kind, url, headers, body.as_ref()).await?;
        Ok(match response {
            HttpResponseBody::Batch(items) => items.into_iter().map(item_result).collect(),
            HttpResponseBody::Single(item) => {
                let shared = item_result(item);
                ops.iter().map(|_| shared.clone()).collect()
            }
        })
    }
}

/// Terminating link that coalesces queries (and, separately, mutations)
/// issued within one window into a single HTTP request.
#[derive(Debug, Clone)]
pub struct HttpBatchLink {
    queries: BatchLoader<HttpBatchFetcher>,
    mutations: BatchLoader<HttpBatchFetcher>,
}

impl HttpBatchLink {
    pub fn new(config: HttpBatchLinkConfig) -> Result<Self, ClientError> {
        let shared = Arc::new(HttpShared::new(
            &config.url,
            config.headers,
            config.timeout_ms,
        )?);
        let options = LoaderOptions {
            max_items: config.max_items,
            window: Duration::from_millis(config.batch_window_ms),
        };
        let loader = |kind| {
            BatchLoader::new(
                HttpBatchFetcher {
                    shared: shared.clone(),
                    kind,
                    max_url_length: config.max_url_length,
                },
                options.clone(),
            )
        };
        Ok(HttpBatchLink {
            queries: loader(OperationKind::Query),
            mutations: loader(OperationKind::Mutation),
        })
    }
}

impl Link for HttpBatchLink {
    fn call(&self, op: Operation, _next: Next) -> OperationResult {
        let loader = match op.kind {
            OperationKind::Query => self.queries.clone(),
            OperationKind::Mutation => self.mutations.clone(),
            _ => return subscription_rejected(&op),
        };
        Observable::new(move |observer| {
            let load = loader.load(op.clone());
            let cancel = load.cancel_handle();
            let task = emit_when_ready(observer, load);
            Teardown::new(move || {
                cancel.cancel();
                task.abort();
            })
        })
    }

    fn is_terminating(&self) -> bool {
        true
    }
}

impl TerminatingLink for HttpBatchLink {
    type Subscriptions = SubscriptionsUnsupported;
}
