use crate::error::ClientError;
use crate::ids::OpId;
use crate::observable::{CompletedWithoutValue, Observable};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "mutation")]
    Mutation,
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
            OperationKind::SubscriptionStop => "subscription.stop",
        }
    }

    /// Queries and mutations produce exactly one result.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, OperationKind::Query | OperationKind::Mutation)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied, link-readable metadata attached to an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationContext(Map<String, Value>);

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String-valued entries of the `headers` object, if present.
    pub fn headers(&self) -> BTreeMap<String, String> {
        self.0
            .get("headers")
            .and_then(Value::as_object)
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<Map<String, Value>> for OperationContext {
    fn from(map: Map<String, Value>) -> Self {
        OperationContext(map)
    }
}

/// One logical remote call. Links never mutate an operation in place; the
/// `with_*` helpers return a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: OpId,
    pub kind: OperationKind,
    pub path: String,
    pub input: Value,
    pub context: OperationContext,
}

impl Operation {
    pub fn new(id: OpId, kind: OperationKind, path: impl Into<String>, input: Value) -> Self {
        Operation {
            id,
            kind,
            path: path.into(),
            input,
            context: OperationContext::default(),
        }
    }

    pub fn with_input(&self, input: Value) -> Self {
        Operation {
            input,
            ..self.clone()
        }
    }

    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Operation {
            path: path.into(),
            ..self.clone()
        }
    }

    pub fn with_context(&self, context: OperationContext) -> Self {
        Operation {
            context,
            ..self.clone()
        }
    }
}

/// Non-error results flowing back up the chain. Errors travel on the
/// observable's error channel and are always terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Started,
    Data(Value),
    Stopped,
}

impl Envelope {
    pub fn data(&self) -> Option<&Value> {
        match self {
            Envelope::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<Value> {
        match self {
            Envelope::Data(value) => Some(value),
            _ => None,
        }
    }
}

/// The stream every link returns.
pub type OperationResult = Observable<Envelope, ClientError>;

impl From<CompletedWithoutValue> for ClientError {
    fn from(_: CompletedWithoutValue) -> Self {
        ClientError::Transport(crate::error::TransportError::Protocol(
            "operation completed without a result".into(),
        ))
    }
}
