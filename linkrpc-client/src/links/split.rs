use linkrpc_core::{
    Either, Link, Next, Operation, OperationKind, OperationResult, TerminatingLink,
};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

type Condition = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

/// Routes each operation to one of two terminating links (or chains).
///
/// The split can carry subscriptions when either branch can, so
/// `SplitLink::new(is_subscription, ws, http_batch)` yields a chain that
/// allows subscriptions.
pub struct SplitLink<T, F> {
    condition: Condition,
    on_true: T,
    on_false: F,
}

/// Default routing condition: subscriptions go to the `true` branch.
pub fn is_subscription(op: &Operation) -> bool {
    op.kind == OperationKind::Subscription
}

impl<T: TerminatingLink, F: TerminatingLink> SplitLink<T, F> {
    pub fn new(
        condition: impl Fn(&Operation) -> bool + Send + Sync + 'static,
        on_true: T,
        on_false: F,
    ) -> Self {
        SplitLink {
            condition: Arc::new(condition),
            on_true,
            on_false,
        }
    }
}

impl<T, F> fmt::Debug for SplitLink<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SplitLink")
    }
}

impl<T: TerminatingLink, F: TerminatingLink> Link for SplitLink<T, F> {
    fn call(&self, op: Operation, next: Next) -> OperationResult {
        if (self.condition)(&op) {
            trace!(op_id = %op.id, branch = true, "split");
            self.on_true.call(op, next)
        } else {
            trace!(op_id = %op.id, branch = false, "split");
            self.on_false.call(op, next)
        }
    }

    fn is_terminating(&self) -> bool {
        true
    }
}

impl<T, F> TerminatingLink for SplitLink<T, F>
where
    T: TerminatingLink,
    F: TerminatingLink,
    T::Subscriptions: Either<F::Subscriptions>,
{
    type Subscriptions = <T::Subscriptions as Either<F::Subscriptions>>::Output;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Client;
    use linkrpc_core::{
        terminating_fn, ChainBuilder, Envelope, Observable, SubscriptionsSupported,
        SubscriptionsUnsupported, Teardown,
    };
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_routes_by_condition() {
        let streaming = terminating_fn::<SubscriptionsSupported, _>(|_op: Operation| {
            Observable::new(|o| {
                o.next(Envelope::Data(json!("stream")));
                Teardown::none()
            })
        });
        let request = terminating_fn::<SubscriptionsUnsupported, _>(|_op: Operation| {
            Observable::of(Envelope::Data(json!("request")))
        });
        let chain = ChainBuilder::new()
            .terminate(SplitLink::new(is_subscription, streaming, request))
            .unwrap();
        // The split's marker allows subscriptions even though one branch
        // cannot carry them.
        let client = Client::new(chain);

        let value = client
            .query_value("q", Value::Null, Default::default())
            .await
            .unwrap();
        assert_eq!(value, json!("request"));

        let got = std::sync::Arc::new(Mutex::new(None));
        let g = got.clone();
        let _unsub = client.subscription(
            "s",
            Value::Null,
            crate::SubscriptionHandlers::new().on_data(move |v| *g.lock() = Some(v)),
        );
        assert_eq!(*got.lock(), Some(json!("stream")));
    }

    #[tokio::test]
    async fn test_nested_chain_as_branch() {
        let inner = ChainBuilder::new()
            .terminate(terminating_fn::<SubscriptionsUnsupported, _>(|op: Operation| {
                Observable::of(Envelope::Data(json!(format!("inner:{}", op.path))))
            }))
            .unwrap();
        let other = terminating_fn::<SubscriptionsUnsupported, _>(|_op: Operation| {
            Observable::of(Envelope::Data(json!("other")))
        });
        let chain = ChainBuilder::new()
            .terminate(SplitLink::new(|op: &Operation| op.path.starts_with("admin."), inner, other))
            .unwrap();
        let client = Client::new(chain);
        let admin = client
            .query_value("admin.users", Value::Null, Default::default())
            .await
            .unwrap();
        let public = client
            .query_value("posts", Value::Null, Default::default())
            .await
            .unwrap();
        assert_eq!(admin, json!("inner:admin.users"));
        assert_eq!(public, json!("other"));
    }
}
