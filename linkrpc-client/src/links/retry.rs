use linkrpc_core::{
    ClientError, Envelope, Link, Next, Observable, Observer, Operation, OperationKind,
    OperationResult, Sink, Subscription, Teardown,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Decides whether to run the operation again after attempt `attempts`
/// (1-based) failed with the given error.
pub type RetryPolicy = Arc<dyn Fn(&Operation, &ClientError, u32) -> bool + Send + Sync>;

/// Re-subscribes the rest of the chain when an attempt fails and the policy
/// allows it. The default policy retries queries on transport errors, up to
/// three attempts in total, and never retries mutations.
#[derive(Clone)]
pub struct RetryLink {
    policy: RetryPolicy,
    delay: Duration,
}

impl RetryLink {
    pub fn new() -> Self {
        Self::with_max_attempts(3)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        RetryLink {
            policy: Arc::new(move |op: &Operation, err: &ClientError, attempts: u32| {
                op.kind == OperationKind::Query && err.is_transport() && attempts < max_attempts
            }),
            delay: Duration::ZERO,
        }
    }

    pub fn with_policy(
        policy: impl Fn(&Operation, &ClientError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        RetryLink {
            policy: Arc::new(policy),
            delay: Duration::ZERO,
        }
    }

    /// Wait between a failure and the next attempt.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for RetryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RetryLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLink")
            .field("delay", &self.delay)
            .finish()
    }
}

impl Link for RetryLink {
    fn call(&self, op: Operation, next: Next) -> OperationResult {
        let (policy, delay) = (self.policy.clone(), self.delay);
        Observable::new(move |observer| {
            let run = Arc::new(RetryRun {
                op: op.clone(),
                next: next.clone(),
                observer,
                policy: policy.clone(),
                delay,
                state: Mutex::new(RunState::default()),
            });
            run.start(1);
            Teardown::new(move || run.stop())
        })
    }
}

#[derive(Default)]
struct RunState {
    current: Option<Subscription>,
    timer: Option<JoinHandle<()>>,
    stopped: bool,
}

/// One subscription to a retrying operation, across all its attempts.
struct RetryRun {
    op: Operation,
    next: Next,
    observer: Observer<Envelope, ClientError>,
    policy: RetryPolicy,
    delay: Duration,
    state: Mutex<RunState>,
}

impl RetryRun {
    fn start(self: &Arc<Self>, attempt: u32) {
        let run = self.clone();
        let on_next = self.observer.clone();
        let on_complete = self.observer.clone();
        let sub = self.next.call(self.op.clone()).subscribe(
            Sink::new()
                .on_next(move |envelope| on_next.next(envelope))
                .on_error(move |err| run.failed(err, attempt))
                .on_complete(move || on_complete.complete()),
        );

        let mut st = self.state.lock();
        if st.stopped {
            drop(st);
            sub.unsubscribe();
        } else {
            st.current = Some(sub);
        }
    }

    fn failed(self: &Arc<Self>, err: ClientError, attempt: u32) {
        if !(self.policy)(&self.op, &err, attempt) {
            debug!(op_id = %self.op.id, attempt, "not retrying");
            self.observer.error(err);
            return;
        }
        warn!(op_id = %self.op.id, path = %self.op.path, attempt, "retrying after error: {}", err);

        // Always resume from a fresh task so the failed attempt has finished
        // installing its subscription first.
        let run = self.clone();
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            run.start(attempt + 1);
        });

        let mut st = self.state.lock();
        if st.stopped {
            timer.abort();
        } else {
            st.timer = Some(timer);
        }
    }

    fn stop(&self) {
        let (current, timer) = {
            let mut st = self.state.lock();
            st.stopped = true;
            (st.current.take(), st.timer.take())
        };
        if let Some(sub) = current {
            sub.unsubscribe();
        }
        if let Some(timer) = timer {
            timer.abort();
        }
    }
}
