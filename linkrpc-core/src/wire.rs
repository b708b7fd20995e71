//! JSON shapes exchanged with the server over WebSocket, IPC and HTTP.

use crate::error::{ErrorShape, TransportError};
use crate::ids::OpId;
use crate::operation::{Operation, OperationKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const PING: &str = "PING";
pub const PONG: &str = "PONG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    pub path: String,
    #[serde(default)]
    pub input: Value,
}

/// Client to server request over a persistent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: OpId,
    pub method: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
}

impl RequestMessage {
    pub fn from_operation(op: &Operation) -> Self {
        RequestMessage {
            id: op.id,
            method: op.kind,
            params: Some(RequestParams {
                path: op.path.clone(),
                input: op.input.clone(),
            }),
        }
    }

    pub fn stop(id: OpId) -> Self {
        RequestMessage {
            id,
            method: OperationKind::SubscriptionStop,
            params: None,
        }
    }
}

/// One flush worth of requests. A single request goes out unwrapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutgoingFrame {
    Single(RequestMessage),
    Batch(Vec<RequestMessage>),
}

impl OutgoingFrame {
    pub fn from_messages(mut messages: Vec<RequestMessage>) -> Option<Self> {
        match messages.len() {
            0 => None,
            1 => messages.pop().map(OutgoingFrame::Single),
            _ => Some(OutgoingFrame::Batch(messages)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OutgoingFrame::Single(_) => 1,
            OutgoingFrame::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_text(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// First frame on a fresh connection when the client carries connection params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParamsMessage {
    pub method: String,
    pub data: Value,
}

impl ConnectionParamsMessage {
    pub fn new(data: Value) -> Self {
        ConnectionParamsMessage {
            method: "connectionParams".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Started,
    Data,
    Response,
    Event,
    Stopped,
    /// `data` carries an [`ErrorShape`] for this operation only.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(rename = "type")]
    pub kind: ResultKind,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawIncoming {
    Response {
        id: OpId,
        result: ResultPayload,
    },
    Failure {
        #[serde(default)]
        id: Option<OpId>,
        error: ErrorShape,
    },
    Notification {
        method: String,
    },
}

/// Server to client message over a persistent connection.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Response { id: OpId, result: ResultPayload },
    Failure { id: Option<OpId>, error: ErrorShape },
    /// Server asks the client to cycle to a fresh connection.
    Reconnect,
    Pong,
    /// A notification the client does not act on.
    Other(String),
}

impl IncomingMessage {
    /// Parse one text frame. Servers may batch responses into an array;
    /// unrecognized items in an array are skipped so their siblings still
    /// reach their callers.
    pub fn parse(text: &str) -> Result<Vec<IncomingMessage>, TransportError> {
        if text == PONG {
            return Ok(vec![IncomingMessage::Pong]);
        }
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match Self::from_value(item) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(error = %e, "skipping undecodable item in batched frame");
                        None
                    }
                })
                .collect()),
            other => Ok(vec![Self::from_value(other)?]),
        }
    }

    fn from_value(value: Value) -> Result<IncomingMessage, TransportError> {
        let raw: RawIncoming = serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("unrecognized message: {}", e)))?;
        Ok(match raw {
            RawIncoming::Response { id, result } => IncomingMessage::Response { id, result },
            RawIncoming::Failure { id, error } => IncomingMessage::Failure { id, error },
            RawIncoming::Notification { method } if method == "reconnect" => {
                IncomingMessage::Reconnect
            }
            RawIncoming::Notification { method } => IncomingMessage::Other(method),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResultData {
    #[serde(default)]
    pub data: Value,
}

/// Per-call result in an HTTP response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HttpResponseItem {
    Result {
        result: HttpResultData,
    },
    Error {
        error: ErrorShape,
    },
    Json {
        json: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
}

impl HttpResponseItem {
    pub fn into_result(self) -> Result<Value, ErrorShape> {
        match self {
            HttpResponseItem::Result { result } => Ok(result.data),
            HttpResponseItem::Error { error } => Err(error),
            HttpResponseItem::Json { json, .. } => Ok(json),
        }
    }
}

/// A batched reply is an array; a server without batch support answers
/// with a single item shared by every caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HttpResponseBody {
    Batch(Vec<HttpResponseItem>),
    Single(HttpResponseItem),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: u64, path: &str) -> RequestMessage {
        RequestMessage::from_operation(&Operation::new(
            OpId::new(id),
            OperationKind::Query,
            path,
            json!(id),
        ))
    }

    #[test]
    fn test_single_request_is_unwrapped() {
        let frame = OutgoingFrame::from_messages(vec![request(1, "a")]).unwrap();
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"id": 1, "method": "query", "params": {"path": "a", "input": 1}})
        );
    }

    #[test]
    fn test_multiple_requests_form_array() {
        let frame = OutgoingFrame::from_messages(vec![request(1, "a"), request(2, "b")]).unwrap();
        assert_eq!(frame.len(), 2);
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert!(value.is_array());
        assert!(OutgoingFrame::from_messages(vec![]).is_none());
    }

    #[test]
    fn test_stop_has_no_params() {
        let value = serde_json::to_value(RequestMessage::stop(OpId::new(9))).unwrap();
        assert_eq!(value, json!({"id": 9, "method": "subscription.stop"}));
    }

    #[test]
    fn test_parse_incoming_kinds() {
        let msgs = IncomingMessage::parse(
            r#"[{"id":1,"result":{"type":"started"}},
                {"id":1,"result":{"type":"data","data":{"n":1}}},
                {"id":2,"error":{"code":-32004,"message":"missing"}},
                {"method":"reconnect"}]"#,
        )
        .unwrap();
        assert_eq!(msgs.len(), 4);
        assert!(matches!(
            msgs[0],
            IncomingMessage::Response {
                result: ResultPayload {
                    kind: ResultKind::Started,
                    ..
                },
                ..
            }
        ));
        assert_eq!(
            msgs[1],
            IncomingMessage::Response {
                id: OpId::new(1),
                result: ResultPayload { kind: ResultKind::Data, data: json!({"n": 1}) },
            }
        );
        assert!(matches!(
            &msgs[2],
            IncomingMessage::Failure { id: Some(id), error }
                if id.as_u64() == 2 && error.code == -32004
        ));
        assert_eq!(msgs[3], IncomingMessage::Reconnect);
        assert_eq!(IncomingMessage::parse("PONG").unwrap(), vec![IncomingMessage::Pong]);
    }

    #[test]
    fn test_parse_error_result_kind() {
        let msgs = IncomingMessage::parse(
            r#"{"id":1,"result":{"type":"error","data":{"code":-32004,"message":"gone"}}}"#,
        )
        .unwrap();
        assert_eq!(
            msgs,
            vec![IncomingMessage::Response {
                id: OpId::new(1),
                result: ResultPayload {
                    kind: ResultKind::Error,
                    data: json!({"code": -32004, "message": "gone"}),
                },
            }]
        );
    }

    #[test]
    fn test_bad_item_in_array_keeps_siblings() {
        let msgs =
            IncomingMessage::parse(r#"[{"id":1,"result":{"type":"data","data":1}},{"foo":1}]"#)
                .unwrap();
        assert_eq!(
            msgs,
            vec![IncomingMessage::Response {
                id: OpId::new(1),
                result: ResultPayload { kind: ResultKind::Data, data: json!(1) },
            }]
        );
    }

    #[test]
    fn test_parse_garbage_is_protocol_error() {
        assert!(IncomingMessage::parse("{\"hello\":1}").is_err());
        assert!(IncomingMessage::parse("not json").is_err());
    }

    #[test]
    fn test_http_body_shapes() {
        let batch: HttpResponseBody = serde_json::from_value(json!([
            {"result": {"data": 10}},
            {"error": {"code": -32600, "message": "bad"}},
            {"json": 30, "meta": {}}
        ]))
        .unwrap();
        let HttpResponseBody::Batch(items) = batch else {
            panic!("expected batch");
        };
        let results: Vec<_> = items.into_iter().map(HttpResponseItem::into_result).collect();
        assert_eq!(results[0], Ok(json!(10)));
        assert_eq!(results[1].as_ref().unwrap_err().code, -32600);
        assert_eq!(results[2], Ok(json!(30)));

        let single: HttpResponseBody =
            serde_json::from_value(json!({"result": {"data": "shared"}})).unwrap();
        assert!(matches!(single, HttpResponseBody::Single(_)));
    }
}
