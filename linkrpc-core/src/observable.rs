//! Lazy, cancellable push streams.
//!
//! An [`Observable`] does nothing until [`Observable::subscribe`] is called;
//! each subscription runs the producer exactly once. After the first
//! terminal event (`error` or `complete`) or after unsubscribe, the observer
//! goes silent and the producer's [`Teardown`] runs exactly once.

use futures::Stream;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

type NextFn<T> = Arc<dyn Fn(T) + Send + Sync>;
type ErrorFn<E> = Box<dyn FnOnce(E) + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;
type Producer<T, E> = Arc<dyn Fn(Observer<T, E>) -> Teardown + Send + Sync>;

/// Cleanup returned by a producer.
pub struct Teardown(Option<Box<dyn FnOnce() + Send>>);

impl Teardown {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Teardown(Some(Box::new(f)))
    }

    pub fn none() -> Self {
        Teardown(None)
    }

    fn run(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl From<Subscription> for Teardown {
    fn from(sub: Subscription) -> Self {
        Teardown::new(move || sub.unsubscribe())
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Teardown").field(&self.0.is_some()).finish()
    }
}

struct Latch {
    closed: AtomicBool,
    teardown: Mutex<Option<Teardown>>,
}

impl Latch {
    fn new() -> Self {
        Latch {
            closed: AtomicBool::new(false),
            teardown: Mutex::new(None),
        }
    }

    /// Returns true for the one caller that flips the latch.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn run_teardown(&self) {
        let teardown = self.teardown.lock().take();
        if let Some(teardown) = teardown {
            teardown.run();
        }
    }

    fn install(&self, teardown: Teardown) {
        *self.teardown.lock() = Some(teardown);
        if self.is_closed() {
            self.run_teardown();
        }
    }
}

/// Handle returned by `subscribe`. Cloning shares the same subscription.
#[derive(Clone)]
pub struct Subscription {
    latch: Arc<Latch>,
}

impl Subscription {
    /// Stop the producer. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if self.latch.close() {
            self.latch.run_teardown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.latch.is_closed()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Partial observer: any callback may be left out.
pub struct Sink<T, E> {
    on_next: Option<NextFn<T>>,
    on_error: Option<ErrorFn<E>>,
    on_complete: Option<CompleteFn>,
}

impl<T, E> Sink<T, E> {
    pub fn new() -> Self {
        Sink {
            on_next: None,
            on_error: None,
            on_complete: None,
        }
    }

    pub fn on_next(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_next = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(E) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl<T, E> Sink<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Relay every event to another observer.
    pub fn forward_to(observer: Observer<T, E>) -> Self {
        let on_next = observer.clone();
        let on_error = observer.clone();
        Sink::new()
            .on_next(move |value| on_next.next(value))
            .on_error(move |err| on_error.error(err))
            .on_complete(move || observer.complete())
    }
}

impl<T, E> Default for Sink<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Sink<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("on_next", &self.on_next.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

struct ObserverInner<T, E> {
    latch: Arc<Latch>,
    on_next: Option<NextFn<T>>,
    on_error: Mutex<Option<ErrorFn<E>>>,
    on_complete: Mutex<Option<CompleteFn>>,
}

/// The producer's side of a subscription.
pub struct Observer<T, E> {
    inner: Arc<ObserverInner<T, E>>,
}

impl<T, E> Clone for Observer<T, E> {
    fn clone(&self) -> Self {
        Observer {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Observer<T, E> {
    fn new(sink: Sink<T, E>, latch: Arc<Latch>) -> Self {
        Observer {
            inner: Arc::new(ObserverInner {
                latch,
                on_next: sink.on_next,
                on_error: Mutex::new(sink.on_error),
                on_complete: Mutex::new(sink.on_complete),
            }),
        }
    }

    pub fn next(&self, value: T) {
        if self.inner.latch.is_closed() {
            return;
        }
        if let Some(on_next) = &self.inner.on_next {
            on_next(value);
        }
    }

    pub fn error(&self, err: E) {
        if !self.inner.latch.close() {
            return;
        }
        let on_error = self.inner.on_error.lock().take();
        if let Some(on_error) = on_error {
            on_error(err);
        }
        self.inner.latch.run_teardown();
    }

    pub fn complete(&self) {
        if !self.inner.latch.close() {
            return;
        }
        let on_complete = self.inner.on_complete.lock().take();
        if let Some(on_complete) = on_complete {
            on_complete();
        }
        self.inner.latch.run_teardown();
    }

    /// True once a terminal event was delivered or the consumer unsubscribed.
    pub fn is_closed(&self) -> bool {
        self.inner.latch.is_closed()
    }
}

impl<T, E> fmt::Debug for Observer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A cold push stream of `T` values that may fail with `E`.
pub struct Observable<T, E> {
    producer: Producer<T, E>,
}

impl<T, E> Clone for Observable<T, E> {
    fn clone(&self) -> Self {
        Observable {
            producer: self.producer.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Observable<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Observable")
    }
}

/// Event seen by [`Observable::tap`].
#[derive(Debug)]
pub enum TapEvent<'a, T, E> {
    Next(&'a T),
    Error(&'a E),
    Complete,
}

impl<T, E> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn(Observer<T, E>) -> Teardown + Send + Sync + 'static,
    {
        Observable {
            producer: Arc::new(producer),
        }
    }

    /// An observable that fails as soon as it is subscribed.
    pub fn error(err: E) -> Self
    where
        E: Clone + Sync,
    {
        Observable::new(move |observer| {
            observer.error(err.clone());
            Teardown::none()
        })
    }

    /// An observable that emits one value and completes.
    pub fn of(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Observable::new(move |observer| {
            observer.next(value.clone());
            observer.complete();
            Teardown::none()
        })
    }

    pub fn subscribe(&self, sink: Sink<T, E>) -> Subscription {
        let latch = Arc::new(Latch::new());
        let observer = Observer::new(sink, latch.clone());
        let teardown = (self.producer)(observer);
        latch.install(teardown);
        Subscription { latch }
    }

    pub fn map<U, F>(self, f: F) -> Observable<U, E>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Observable::new(move |observer: Observer<U, E>| {
            let f = f.clone();
            let on_next = observer.clone();
            let on_error = observer.clone();
            let sub = self.subscribe(
                Sink::new()
                    .on_next(move |value| on_next.next(f(value)))
                    .on_error(move |err| on_error.error(err))
                    .on_complete(move || observer.complete()),
            );
            Teardown::from(sub)
        })
    }

    pub fn map_err<E2, F>(self, f: F) -> Observable<T, E2>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Observable::new(move |observer: Observer<T, E2>| {
            let f = f.clone();
            let on_next = observer.clone();
            let on_error = observer.clone();
            let sub = self.subscribe(
                Sink::new()
                    .on_next(move |value| on_next.next(value))
                    .on_error(move |err| on_error.error(f(err)))
                    .on_complete(move || observer.complete()),
            );
            Teardown::from(sub)
        })
    }

    /// Observe events without altering them.
    pub fn tap<F>(self, f: F) -> Observable<T, E>
    where
        F: Fn(TapEvent<'_, T, E>) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Observable::new(move |observer: Observer<T, E>| {
            let (f_next, f_error, f_complete) = (f.clone(), f.clone(), f.clone());
            let on_next = observer.clone();
            let on_error = observer.clone();
            let sub = self.subscribe(
                Sink::new()
                    .on_next(move |value| {
                        f_next(TapEvent::Next(&value));
                        on_next.next(value);
                    })
                    .on_error(move |err| {
                        f_error(TapEvent::Error(&err));
                        on_error.error(err);
                    })
                    .on_complete(move || {
                        f_complete(TapEvent::Complete);
                        observer.complete();
                    }),
            );
            Teardown::from(sub)
        })
    }

    /// Let many subscribers share one upstream execution.
    ///
    /// The upstream is subscribed when the first subscriber arrives and
    /// unsubscribed when the last one leaves. After a terminal event the next
    /// subscriber starts a fresh execution.
    pub fn share(self) -> Observable<T, E>
    where
        T: Clone,
        E: Clone,
    {
        let state = Arc::new(Mutex::new(ShareState::<T, E> {
            observers: Vec::new(),
            upstream: None,
            next_key: 0,
        }));
        let source = self;

        Observable::new(move |observer: Observer<T, E>| {
            let (key, start) = {
                let mut st = state.lock();
                let key = st.next_key;
                st.next_key += 1;
                st.observers.push((key, observer));
                (key, st.observers.len() == 1 && st.upstream.is_none())
            };

            if start {
                let s_next = state.clone();
                let s_error = state.clone();
                let s_complete = state.clone();
                let sub = source.subscribe(
                    Sink::new()
                        .on_next(move |value: T| {
                            let observers = ShareState::snapshot(&s_next);
                            for o in observers {
                                o.next(value.clone());
                            }
                        })
                        .on_error(move |err: E| {
                            for o in ShareState::drain(&s_error) {
                                o.error(err.clone());
                            }
                        })
                        .on_complete(move || {
                            for o in ShareState::drain(&s_complete) {
                                o.complete();
                            }
                        }),
                );

                let orphaned = {
                    let mut st = state.lock();
                    if sub.is_closed() || st.observers.is_empty() {
                        true
                    } else {
                        st.upstream = Some(sub.clone());
                        false
                    }
                };
                if orphaned {
                    sub.unsubscribe();
                }
            }

            let state = state.clone();
            Teardown::new(move || {
                let upstream = {
                    let mut st = state.lock();
                    st.observers.retain(|(k, _)| *k != key);
                    if st.observers.is_empty() {
                        st.upstream.take()
                    } else {
                        None
                    }
                };
                if let Some(upstream) = upstream {
                    upstream.unsubscribe();
                }
            })
        })
    }

    /// Adapt to a `futures::Stream`. Dropping the stream unsubscribes.
    pub fn into_stream(self) -> ObservableStream<T, E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (tx_err, tx_done) = (tx.clone(), tx.clone());
        let subscription = self.subscribe(
            Sink::new()
                .on_next(move |value| {
                    let _ = tx.send(StreamSignal::Item(Ok(value)));
                })
                .on_error(move |err| {
                    let _ = tx_err.send(StreamSignal::Item(Err(err)));
                    let _ = tx_err.send(StreamSignal::End);
                })
                .on_complete(move || {
                    let _ = tx_done.send(StreamSignal::End);
                }),
        );
        ObservableStream {
            rx,
            subscription,
            done: false,
        }
    }
}

struct ShareState<T, E> {
    observers: Vec<(u64, Observer<T, E>)>,
    upstream: Option<Subscription>,
    next_key: u64,
}

impl<T, E> ShareState<T, E> {
    fn snapshot(state: &Mutex<Self>) -> Vec<Observer<T, E>> {
        state.lock().observers.iter().map(|(_, o)| o.clone()).collect()
    }

    fn drain(state: &Mutex<Self>) -> Vec<Observer<T, E>> {
        let mut st = state.lock();
        st.upstream = None;
        st.observers.drain(..).map(|(_, o)| o).collect()
    }
}

enum StreamSignal<T, E> {
    Item(Result<T, E>),
    End,
}

/// `Stream` view over an observable, created by [`Observable::into_stream`].
pub struct ObservableStream<T, E> {
    rx: mpsc::UnboundedReceiver<StreamSignal<T, E>>,
    subscription: Subscription,
    done: bool,
}

impl<T, E> Stream for ObservableStream<T, E> {
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamSignal::Item(item))) => Poll::Ready(Some(item)),
            Poll::Ready(Some(StreamSignal::End)) | Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> Drop for ObservableStream<T, E> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl<T, E> fmt::Debug for ObservableStream<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableStream")
            .field("done", &self.done)
            .finish()
    }
}

/// Raised through a [`Promise`] when the observable completes without
/// emitting a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedWithoutValue;

/// Future resolving with the first value of an observable.
///
/// Dropping the promise unsubscribes. After [`AbortHandle::abort`] the
/// promise never settles.
pub struct Promise<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
    aborted: Arc<AtomicBool>,
    subscription: Subscription,
    parked: bool,
}

/// Cancels the subscription behind a [`Promise`].
#[derive(Clone)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    subscription: Subscription,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.subscription.unsubscribe();
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.aborted.load(Ordering::SeqCst))
            .finish()
    }
}

/// Convert an observable into a single-value future plus an abort handle.
pub fn observable_to_promise<T, E>(observable: &Observable<T, E>) -> (Promise<T, E>, AbortHandle)
where
    T: Send + 'static,
    E: From<CompletedWithoutValue> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

    let (tx_next, tx_error, tx_complete) = (tx.clone(), tx.clone(), tx.clone());
    let slot_next = slot.clone();
    let subscription = observable.subscribe(
        Sink::new()
            .on_next(move |value| {
                let sender = tx_next.lock().take();
                if let Some(sender) = sender {
                    let _ = sender.send(Ok(value));
                    let sub = slot_next.lock().take();
                    if let Some(sub) = sub {
                        sub.unsubscribe();
                    }
                }
            })
            .on_error(move |err| {
                if let Some(sender) = tx_error.lock().take() {
                    let _ = sender.send(Err(err));
                }
            })
            .on_complete(move || {
                if let Some(sender) = tx_complete.lock().take() {
                    let _ = sender.send(Err(E::from(CompletedWithoutValue)));
                }
            }),
    );

    if tx.lock().is_none() {
        // Settled synchronously inside subscribe.
        subscription.unsubscribe();
    } else {
        *slot.lock() = Some(subscription.clone());
    }

    let aborted = Arc::new(AtomicBool::new(false));
    (
        Promise {
            rx,
            aborted: aborted.clone(),
            subscription: subscription.clone(),
            parked: false,
        },
        AbortHandle {
            aborted,
            subscription,
        },
    )
}

impl<T, E> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.parked {
            return Poll::Pending;
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                // Every observer went away without a terminal event: the
                // stream neither completed nor failed, so neither do we.
                self.parked = true;
                Poll::Pending
            }
            Poll::Pending => {
                if self.aborted.load(Ordering::SeqCst) {
                    self.parked = true;
                }
                Poll::Pending
            }
        }
    }
}

impl<T, E> Drop for Promise<T, E> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("aborted", &self.aborted.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Failed(&'static str),
        Empty,
    }

    impl From<CompletedWithoutValue> for TestError {
        fn from(_: CompletedWithoutValue) -> Self {
            TestError::Empty
        }
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let c = Arc::new(AtomicUsize::new(0));
        (c.clone(), c)
    }

    #[test]
    fn test_producer_is_cold() {
        let (runs, runs_in) = counter();
        let obs: Observable<u32, TestError> = Observable::new(move |o| {
            runs_in.fetch_add(1, Ordering::SeqCst);
            o.next(1);
            Teardown::none()
        });
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        obs.subscribe(Sink::new());
        obs.subscribe(Sink::new());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_next_after_terminal() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let completes = Arc::new(AtomicUsize::new(0));
        let completes_in = completes.clone();

        let obs: Observable<u32, TestError> = Observable::new(|o| {
            o.next(1);
            o.complete();
            o.next(2);
            o.error(TestError::Failed("late"));
            o.complete();
            Teardown::none()
        });
        obs.subscribe(
            Sink::new()
                .on_next(move |v| seen_in.lock().push(v))
                .on_error(|_| panic!("error after complete"))
                .on_complete(move || {
                    completes_in.fetch_add(1, Ordering::SeqCst);
                }),
        );
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_runs_teardown_once() {
        let (teardowns, teardowns_in) = counter();
        let obs: Observable<u32, TestError> = Observable::new(move |_o| {
            let t = teardowns_in.clone();
            Teardown::new(move || {
                t.fetch_add(1, Ordering::SeqCst);
            })
        });
        let sub = obs.subscribe(Sink::new());
        sub.unsubscribe();
        sub.unsubscribe();
        sub.clone().unsubscribe();
        assert!(sub.is_closed());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminal_inside_producer_still_runs_teardown() {
        let (teardowns, teardowns_in) = counter();
        let obs: Observable<u32, TestError> = Observable::new(move |o| {
            o.error(TestError::Failed("sync"));
            let t = teardowns_in.clone();
            Teardown::new(move || {
                t.fetch_add(1, Ordering::SeqCst);
            })
        });
        let sub = obs.subscribe(Sink::new());
        assert!(sub.is_closed());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        sub.unsubscribe();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_silent_after_unsubscribe() {
        let held: Arc<Mutex<Option<Observer<u32, TestError>>>> = Arc::new(Mutex::new(None));
        let held_in = held.clone();
        let obs = Observable::new(move |o| {
            *held_in.lock() = Some(o);
            Teardown::none()
        });
        let (hits, hits_in) = counter();
        let sub = obs.subscribe(Sink::new().on_next(move |_| {
            hits_in.fetch_add(1, Ordering::SeqCst);
        }));
        let observer = held.lock().clone().unwrap();
        observer.next(1);
        sub.unsubscribe();
        observer.next(2);
        assert!(observer.is_closed());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_map_and_map_err() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let obs: Observable<u32, TestError> = Observable::new(|o| {
            o.next(2);
            o.next(3);
            o.error(TestError::Failed("boom"));
            Teardown::none()
        });
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_in = errors.clone();
        obs.map(|v| v * 10)
            .map_err(|e| format!("{:?}", e))
            .subscribe(
                Sink::new()
                    .on_next(move |v| seen_in.lock().push(v))
                    .on_error(move |e| errors_in.lock().push(e)),
            );
        assert_eq!(*seen.lock(), vec![20, 30]);
        assert_eq!(*errors.lock(), vec!["Failed(\"boom\")".to_string()]);
    }

    #[test]
    fn test_tap_sees_every_event() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_in = events.clone();
        Observable::<u32, TestError>::of(7)
            .tap(move |ev| {
                let label = match ev {
                    TapEvent::Next(v) => format!("next:{}", v),
                    TapEvent::Error(_) => "error".to_string(),
                    TapEvent::Complete => "complete".to_string(),
                };
                events_in.lock().push(label);
            })
            .subscribe(Sink::new());
        assert_eq!(*events.lock(), vec!["next:7", "complete"]);
    }

    #[test]
    fn test_share_runs_producer_once() {
        let (runs, runs_in) = counter();
        let held: Arc<Mutex<Option<Observer<u32, TestError>>>> = Arc::new(Mutex::new(None));
        let held_in = held.clone();
        let (teardowns, teardowns_in) = counter();
        let shared = Observable::new(move |o| {
            runs_in.fetch_add(1, Ordering::SeqCst);
            *held_in.lock() = Some(o);
            let t = teardowns_in.clone();
            Teardown::new(move || {
                t.fetch_add(1, Ordering::SeqCst);
            })
        })
        .share();

        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        let (a_in, b_in) = (a.clone(), b.clone());
        let sub_a = shared.subscribe(Sink::new().on_next(move |v| a_in.lock().push(v)));
        let sub_b = shared.subscribe(Sink::new().on_next(move |v| b_in.lock().push(v)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let upstream = held.lock().clone().unwrap();
        upstream.next(5);
        sub_a.unsubscribe();
        upstream.next(6);
        assert_eq!(*a.lock(), vec![5]);
        assert_eq!(*b.lock(), vec![5, 6]);
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);

        sub_b.unsubscribe();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_share_restarts_after_completion() {
        let (runs, runs_in) = counter();
        let shared = Observable::<u32, TestError>::new(move |o| {
            runs_in.fetch_add(1, Ordering::SeqCst);
            o.next(1);
            o.complete();
            Teardown::none()
        })
        .share();
        shared.subscribe(Sink::new());
        shared.subscribe(Sink::new());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_promise_resolves_with_first_value() {
        let (teardowns, teardowns_in) = counter();
        let obs = Observable::<u32, TestError>::new(move |o| {
            o.next(1);
            o.next(2);
            let t = teardowns_in.clone();
            Teardown::new(move || {
                t.fetch_add(1, Ordering::SeqCst);
            })
        });
        let (promise, _abort) = observable_to_promise(&obs);
        assert_eq!(promise.await, Ok(1));
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_promise_rejects_on_error() {
        let obs = Observable::<u32, TestError>::error(TestError::Failed("nope"));
        let (promise, _abort) = observable_to_promise(&obs);
        assert_eq!(promise.await, Err(TestError::Failed("nope")));
    }

    #[tokio::test]
    async fn test_promise_rejects_on_empty_completion() {
        let obs = Observable::<u32, TestError>::new(|o| {
            o.complete();
            Teardown::none()
        });
        let (promise, _abort) = observable_to_promise(&obs);
        assert_eq!(promise.await, Err(TestError::Empty));
    }

    #[tokio::test]
    async fn test_aborted_promise_never_settles() {
        let held: Arc<Mutex<Option<Observer<u32, TestError>>>> = Arc::new(Mutex::new(None));
        let held_in = held.clone();
        let obs = Observable::new(move |o| {
            *held_in.lock() = Some(o);
            Teardown::none()
        });
        let (promise, abort) = observable_to_promise(&obs);
        abort.abort();
        abort.abort();
        held.lock().clone().unwrap().next(3);

        let outcome =
            tokio::time::timeout(std::time::Duration::from_millis(20), promise).await;
        assert!(outcome.is_err(), "aborted promise must stay pending");
    }

    #[tokio::test]
    async fn test_dropped_observer_leaves_promise_pending() {
        let obs = Observable::<u32, TestError>::new(|_observer| Teardown::none());
        let (promise, _abort) = observable_to_promise(&obs);

        let outcome =
            tokio::time::timeout(std::time::Duration::from_millis(20), promise).await;
        assert!(outcome.is_err(), "no terminal event, so no settlement");
    }

    #[tokio::test]
    async fn test_into_stream_yields_values_then_ends() {
        let obs = Observable::<u32, TestError>::new(|o| {
            o.next(1);
            o.next(2);
            o.complete();
            Teardown::none()
        });
        let items: Vec<_> = obs.into_stream().collect().await;
        assert_eq!(items, vec![Ok(1), Ok(2)]);
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let (teardowns, teardowns_in) = counter();
        let obs = Observable::<u32, TestError>::new(move |_o| {
            let t = teardowns_in.clone();
            Teardown::new(move || {
                t.fetch_add(1, Ordering::SeqCst);
            })
        });
        let stream = obs.into_stream();
        drop(stream);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }
}
