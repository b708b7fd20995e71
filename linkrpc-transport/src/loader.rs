//! Debounced batch loader: keys requested within one window are fetched
//! together and results are routed back to each caller by position.

use async_trait::async_trait;
use linkrpc_core::{ClientError, TransportError};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub type ItemResult<V> = Result<V, ClientError>;

#[async_trait]
pub trait BatchFetcher: Send + Sync + 'static {
    type Key: Clone + Send + Sync + 'static;
    type Value: Send + 'static;

    /// Whether `keys` may go out as one request. A single key is always
    /// sent, even when it fails validation on its own.
    fn validate(&self, _keys: &[Self::Key]) -> bool {
        true
    }

    /// One result per key, in the same order. An `Err` fails the whole batch.
    async fn fetch(
        &self,
        keys: Vec<Self::Key>,
    ) -> Result<Vec<ItemResult<Self::Value>>, ClientError>;
}

#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Cap on keys per fetch.
    pub max_items: Option<usize>,
    /// Zero means flush on the next scheduler tick.
    pub window: Duration,
}

struct PendingItem<K, V> {
    key: K,
    tx: oneshot::Sender<ItemResult<V>>,
    cancelled: Arc<AtomicBool>,
}

struct LoaderState<K, V> {
    pending: Vec<PendingItem<K, V>>,
    scheduled: bool,
}

struct LoaderInner<F: BatchFetcher> {
    fetcher: F,
    options: LoaderOptions,
    state: Mutex<LoaderState<F::Key, F::Value>>,
}

pub struct BatchLoader<F: BatchFetcher> {
    inner: Arc<LoaderInner<F>>,
}

impl<F: BatchFetcher> Clone for BatchLoader<F> {
    fn clone(&self) -> Self {
        BatchLoader {
            inner: self.inner.clone(),
        }
    }
}

impl<F: BatchFetcher> fmt::Debug for BatchLoader<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchLoader")
            .field("options", &self.inner.options)
            .field("pending", &self.inner.state.lock().pending.len())
            .finish()
    }
}

impl<F: BatchFetcher> BatchLoader<F> {
    pub fn new(fetcher: F, options: LoaderOptions) -> Self {
        BatchLoader {
            inner: Arc::new(LoaderInner {
                fetcher,
                options,
                state: Mutex::new(LoaderState {
                    pending: Vec::new(),
                    scheduled: false,
                }),
            }),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.inner.fetcher
    }

    /// Queue `key` for the next flush. Must be called inside a tokio runtime.
    pub fn load(&self, key: F::Key) -> Load<F::Value> {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let schedule = {
            let mut st = self.inner.state.lock();
            st.pending.push(PendingItem {
                key,
                tx,
                cancelled: cancelled.clone(),
            });
            !std::mem::replace(&mut st.scheduled, true)
        };
        if schedule {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if inner.options.window.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(inner.options.window).await;
                }
                LoaderInner::flush(inner);
            });
        }
        Load { rx, cancelled }
    }
}

impl<F: BatchFetcher> LoaderInner<F> {
    fn flush(this: Arc<Self>) {
        let items: Vec<_> = {
            let mut st = this.state.lock();
            st.scheduled = false;
            std::mem::take(&mut st.pending)
        };
        let items: Vec<_> = items
            .into_iter()
            .filter(|item| !item.cancelled.load(Ordering::SeqCst))
            .collect();
        if items.is_empty() {
            return;
        }

        for group in this.group(items) {
            let inner = this.clone();
            tokio::spawn(async move { inner.dispatch(group).await });
        }
    }

    /// Greedy grouping: extend the current group while it stays within
    /// `max_items` and passes `validate`.
    fn group(
        &self,
        items: Vec<PendingItem<F::Key, F::Value>>,
    ) -> Vec<Vec<PendingItem<F::Key, F::Value>>> {
        let mut groups = Vec::new();
        let mut current: Vec<PendingItem<F::Key, F::Value>> = Vec::new();
        let mut keys: Vec<F::Key> = Vec::new();
        for item in items {
            keys.push(item.key.clone());
            let within_cap = self.options.max_items.is_none_or(|max| keys.len() <= max);
            if !current.is_empty() && !(within_cap && self.fetcher.validate(&keys)) {
                groups.push(std::mem::take(&mut current));
                keys.clear();
                keys.push(item.key.clone());
            }
            current.push(item);
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    async fn dispatch(&self, group: Vec<PendingItem<F::Key, F::Value>>) {
        let keys: Vec<F::Key> = group.iter().map(|item| item.key.clone()).collect();
        debug!(size = keys.len(), "fetching batch");
        let results = self.fetcher.fetch(keys).await;

        match results {
            Ok(values) if values.len() == group.len() => {
                for (item, value) in group.into_iter().zip(values) {
                    item.deliver(value);
                }
            }
            Ok(values) => {
                let err = ClientError::from(TransportError::Protocol(format!(
                    "batch returned {} results for {} requests",
                    values.len(),
                    group.len()
                )));
                for item in group {
                    item.deliver(Err(err.clone()));
                }
            }
            Err(err) => {
                for item in group {
                    item.deliver(Err(err.clone()));
                }
            }
        }
    }
}

impl<K, V> PendingItem<K, V> {
    fn deliver(self, result: ItemResult<V>) {
        if self.cancelled.load(Ordering::SeqCst) {
            trace!("discarding result of cancelled item");
            return;
        }
        let _ = self.tx.send(result);
    }
}

/// Result of one [`BatchLoader::load`] call.
pub struct Load<V> {
    rx: oneshot::Receiver<ItemResult<V>>,
    cancelled: Arc<AtomicBool>,
}

impl<V> Load<V> {
    /// Handle that drops this item from its batch. If the batch was already
    /// sent its result is discarded on arrival.
    pub fn cancel_handle(&self) -> CancelLoad {
        CancelLoad {
            cancelled: self.cancelled.clone(),
        }
    }
}

impl<V> Future for Load<V> {
    type Output = ItemResult<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::from(TransportError::Protocol(
                "batch item dropped before it was answered".into(),
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<V> fmt::Debug for Load<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Load")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CancelLoad {
    cancelled: Arc<AtomicBool>,
}

impl CancelLoad {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
