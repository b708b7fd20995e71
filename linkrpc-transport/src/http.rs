use linkrpc_core::{
    ClientError, Envelope, HttpResponseBody, HttpResponseItem, Link, Next, Observable, Observer,
    Operation, OperationKind, OperationResult, SubscriptionsUnsupported, Teardown,
    TerminatingLink, TransportError,
};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpLinkConfig {
    /// Base URL; the procedure path is appended as a path segment.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl Default for HttpLinkConfig {
    fn default() -> Self {
        HttpLinkConfig {
            url: "http://localhost:3000/trpc".to_string(),
            headers: BTreeMap::new(),
            timeout_ms: 30_000,
        }
    }
}

impl HttpLinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        HttpLinkConfig {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// HTTP plumbing shared by the plain and the batching link.
#[derive(Debug)]
pub(crate) struct HttpShared {
    pub client: reqwest::Client,
    pub base: String,
    pub headers: BTreeMap<String, String>,
}

impl HttpShared {
    pub fn new(
        url: &str,
        headers: BTreeMap<String, String>,
        timeout_ms: u64,
    ) -> Result<Self, ClientError> {
        Url::parse(url).map_err(|e| ClientError::usage(format!("invalid url {}: {}", url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| ClientError::usage(format!("failed to build HTTP client: {}", e)))?;
        Ok(HttpShared {
            client,
            base: url.trim_end_matches('/').to_string(),
            headers,
        })
    }

    pub fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, ClientError> {
        let mut url = Url::parse(&format!("{}/{}", self.base, path))
            .map_err(|e| ClientError::usage(format!("invalid procedure path {}: {}", path, e)))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Static headers, overridden by `context.headers` of each operation.
    pub fn headers_for<'a>(
        &self,
        ops: impl IntoIterator<Item = &'a Operation>,
    ) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        for op in ops {
            headers.extend(op.context.headers());
        }
        headers
    }

    pub async fn send(
        &self,
        kind: OperationKind,
        url: Url,
        headers: BTreeMap<String, String>,
        body: Option<&Value>,
    ) -> Result<HttpResponseBody, ClientError> {
        debug!(%kind, %url, "sending http request");
        let mut request = match kind {
            OperationKind::Mutation => self.client.post(url),
            _ => self.client.get(url),
        };
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        trace!(status = status.as_u16(), "response body: {}", text);
        parse_body(status, text)
    }
}

/// Error statuses still carry per-call error shapes; only an unreadable
/// body turns into a transport error.
fn parse_body(status: StatusCode, text: String) -> Result<HttpResponseBody, ClientError> {
    match serde_json::from_str::<HttpResponseBody>(&text) {
        Ok(body) => Ok(body),
        Err(_) if !status.is_success() => Err(TransportError::Http {
            status: status.as_u16(),
            body: text,
        }
        .into()),
        Err(e) => Err(TransportError::Protocol(format!("unexpected response body: {}", e)).into()),
    }
}

pub(crate) fn item_result(item: HttpResponseItem) -> Result<Value, ClientError> {
    item.into_result().map_err(ClientError::Server)
}

pub(crate) fn subscription_rejected(op: &Operation) -> OperationResult {
    tracing::error!(op_id = %op.id, path = %op.path, "subscription issued on an HTTP link");
    Observable::error(ClientError::usage(
        "subscriptions are not supported by HTTP links, use a WebSocket or IPC link",
    ))
}

/// Run `fut` in the background and emit its value as one `Data` envelope.
pub(crate) fn emit_when_ready<F>(
    observer: Observer<Envelope, ClientError>,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<Value, ClientError>> + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(value) => {
                observer.next(Envelope::Data(value));
                observer.complete();
            }
            Err(err) => observer.error(err),
        }
    })
}

/// Terminating link issuing one HTTP request per operation.
#[derive(Debug, Clone)]
pub struct HttpLink {
    shared: Arc<HttpShared>,
}

impl HttpLink {
    pub fn new(config: HttpLinkConfig) -> Result<Self, ClientError> {
        let shared = HttpShared::new(&config.url, config.headers, config.timeout_ms)?;
        Ok(HttpLink {
            shared: Arc::new(shared),
        })
    }

    async fn request(shared: Arc<HttpShared>, op: Operation) -> Result<Value, ClientError> {
        let headers = shared.headers_for([&op]);
        let body = match op.kind {
            OperationKind::Query => {
                let query = match &op.input {
                    Value::Null => Vec::new(),
                    input => {
                        let encoded = serde_json::to_string(input).map_err(TransportError::from)?;
                        vec![("input", encoded)]
                    }
                };
                let url = shared.url(&op.path, &query)?;
                shared.send(op.kind, url, headers, None).await?
            }
            _ => {
                let url = shared.url(&op.path, &[])?;
                shared.send(op.kind, url, headers, Some(&op.input)).await?
            }
        };
        match body {
            HttpResponseBody::Single(item) => item_result(item),
            HttpResponseBody::Batch(_) => Err(TransportError::Protocol(
                "batched response to a single request".into(),
            )
            .into()),
        }
    }
}

impl Link for HttpLink {
    fn call(&self, op: Operation, _next: Next) -> OperationResult {
        if !op.kind.is_one_shot() {
            return subscription_rejected(&op);
        }
        let shared = self.shared.clone();
        Observable::new(move |observer| {
            let task = emit_when_ready(observer, Self::request(shared.clone(), op.clone()));
            Teardown::new(move || task.abort())
        })
    }

    fn is_terminating(&self) -> bool {
        true
    }
}

impl TerminatingLink for HttpLink {
    type Subscriptions = SubscriptionsUnsupported;
}
