use linkrpc_core::{Link, Next, Operation, OperationResult, TapEvent};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

type Filter = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

/// Logs every operation on the way down the chain and every result on the
/// way back, with the elapsed time.
#[derive(Clone)]
pub struct LoggerLink {
    enabled: Filter,
}

impl LoggerLink {
    pub fn new() -> Self {
        LoggerLink {
            enabled: Arc::new(|_| true),
        }
    }

    /// Only log operations for which `enabled` returns true.
    pub fn with_filter(enabled: impl Fn(&Operation) -> bool + Send + Sync + 'static) -> Self {
        LoggerLink {
            enabled: Arc::new(enabled),
        }
    }
}

impl Default for LoggerLink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoggerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoggerLink")
    }
}

impl Link for LoggerLink {
    fn call(&self, op: Operation, next: Next) -> OperationResult {
        if !(self.enabled)(&op) {
            return next.call(op);
        }

        info!(direction = "up", op_id = %op.id, kind = %op.kind, path = %op.path, "operation");
        trace!(op_id = %op.id, input = %op.input, "operation input");

        let started = Instant::now();
        let (id, kind, path) = (op.id, op.kind, op.path.clone());
        next.call(op).tap(move |event| {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match event {
                TapEvent::Next(envelope) => debug!(
                    direction = "down", op_id = %id, %kind, path = %path, elapsed_ms,
                    "result: {:?}", envelope
                ),
                TapEvent::Error(err) => warn!(
                    direction = "down", op_id = %id, %kind, path = %path, elapsed_ms,
                    code = err.code(), "error: {}", err
                ),
                TapEvent::Complete => debug!(
                    direction = "down", op_id = %id, %kind, path = %path, elapsed_ms,
                    "complete"
                ),
            }
        })
    }
}
