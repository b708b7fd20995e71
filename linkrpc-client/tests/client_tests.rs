// End-to-end client behaviour: queries over an HTTP batch link, subscriptions
// over a WebSocket link, both behind one split chain with logging.

#![cfg(feature = "all-transports")]

use futures::{SinkExt, StreamExt};
use linkrpc_client::transport::{
    ConnectionOptions, FixedDelay, HttpBatchLink, HttpBatchLinkConfig, WebSocketConfig,
    WebSocketLink,
};
use linkrpc_client::{
    is_subscription, CallOptions, CancellationToken, ChainBuilder, Client, ClientError,
    LoggerLink, SplitLink, SubscriptionHandlers, SubscriptionsSupported,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Serialize)]
struct ById {
    id: u32,
}

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    id: u32,
    name: String,
}

type ServerSocket = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

async fn ws_server() -> (String, mpsc::UnboundedReceiver<ServerSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                let _ = tx.send(ws);
            }
        }
    });
    (url, rx)
}

fn client(http_url: String, ws_url: String) -> Client<SubscriptionsSupported> {
    let ws = WebSocketLink::connect(WebSocketConfig {
        url: ws_url,
        options: ConnectionOptions {
            retry: Arc::new(FixedDelay::new(Duration::from_millis(10))),
            ..Default::default()
        },
        ..Default::default()
    });
    let http = HttpBatchLink::new(HttpBatchLinkConfig::new(http_url)).unwrap();
    let chain = ChainBuilder::new()
        .link(LoggerLink::new())
        .terminate(SplitLink::new(is_subscription, ws, http))
        .unwrap();
    Client::new(chain)
}

#[cfg(test)]
mod client_tests {
    use super::*;

    #[tokio::test]
    async fn test_typed_queries_batch_over_http() {
        linkrpc_client::logging::init_test_logging();
        let mut http = mockito::Server::new_async().await;
        let mock = http
            .mock("GET", "/user.byId,user.byId")
            .match_query(mockito::Matcher::UrlEncoded(
                "input".into(),
                r#"{"0":{"id":1},"1":{"id":2}}"#.into(),
            ))
            .with_body(
                r#"[{"result":{"data":{"id":1,"name":"ada"}}},
                    {"result":{"data":{"id":2,"name":"grace"}}}]"#,
            )
            .expect(1)
            .create_async()
            .await;
        let (ws_url, _conns) = ws_server().await;
        let client = client(http.url(), ws_url);

        let user = client.procedure("user").procedure("byId");
        let (a, b) = tokio::join!(
            user.query::<_, User>(&ById { id: 1 }),
            user.query::<_, User>(&ById { id: 2 }),
        );
        assert_eq!(a.unwrap(), User { id: 1, name: "ada".into() });
        assert_eq!(b.unwrap(), User { id: 2, name: "grace".into() });
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_subscription_over_websocket() {
        let http = mockito::Server::new_async().await;
        let (ws_url, mut conns) = ws_server().await;
        let client = client(http.url(), ws_url);

        let events = Arc::new(Mutex::new(Vec::<String>::new()));
        let (started, data, done) = (events.clone(), events.clone(), events.clone());
        let unsubscribe = client.subscription(
            "chat.messages",
            json!({"room": "general"}),
            SubscriptionHandlers::new()
                .on_started(move || started.lock().push("started".into()))
                .on_data(move |v| data.lock().push(v.to_string()))
                .on_complete(move || done.lock().push("complete".into())),
        );

        let mut server = conns.recv().await.unwrap();
        let request: Value = match server.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(request["method"], "subscription");
        assert_eq!(request["params"]["input"], json!({"room": "general"}));
        let id = request["id"].clone();

        for frame in [
            json!({"id": id, "result": {"type": "started"}}),
            json!({"id": id, "result": {"type": "data", "data": "hi"}}),
        ] {
            server.send(Message::Text(frame.to_string().into())).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            while events.lock().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        unsubscribe.unsubscribe();
        let stop: Value = match server.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(stop, json!({"id": id, "method": "subscription.stop"}));
        assert_eq!(*events.lock(), vec!["started".to_string(), "\"hi\"".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_query_never_resolves_and_is_not_sent() {
        let mut http = mockito::Server::new_async().await;
        let never = http
            .mock("GET", "/slow")
            .match_query(mockito::Matcher::Any)
            .with_body(r#"[{"result":{"data":1}}]"#)
            .expect(0)
            .create_async()
            .await;
        let (ws_url, _conns) = ws_server().await;
        let client = client(http.url(), ws_url);

        let signal = CancellationToken::new();
        let options = CallOptions::new().with_signal(signal.clone());
        let call = client.query_value("slow", Value::Null, options);
        tokio::pin!(call);

        // Issue the call, then cancel it before the batch window flushes.
        assert!(futures::poll!(&mut call).is_pending());
        signal.cancel();

        let outcome = tokio::time::timeout(Duration::from_millis(100), &mut call).await;
        assert!(outcome.is_err(), "cancelled call must stay pending");
        never.assert_async().await;
    }

    #[tokio::test]
    async fn test_usage_error_for_invalid_chain_is_immediate() {
        let err = ChainBuilder::new()
            .link(LoggerLink::new())
            .link(HttpBatchLink::new(HttpBatchLinkConfig::default()).unwrap())
            .terminate(HttpBatchLink::new(HttpBatchLinkConfig::default()).unwrap())
            .unwrap_err();
        assert!(matches!(err, ClientError::Usage(ref msg) if msg.contains("position 1")));
        assert_eq!(err.code(), linkrpc_client::error_codes::BAD_REQUEST);
    }
}
