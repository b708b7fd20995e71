// IPC link over in-process duplex pipes: framing, keep-alive and
// resumption through the shared multiplexer.

use linkrpc_core::{
    observable_to_promise, ChainBuilder, ClientError, Envelope, OpId, Operation, OperationKind,
    Sink,
};
use linkrpc_transport::{
    create_ipc_client, in_process, ConnectionOptions, FixedDelay, IpcConfig, IpcHostEnd, IpcLink,
    KeepAliveConfig, MuxClient,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn recv_json(host: &mut IpcHostEnd) -> Option<Value> {
    let text = host.recv().await?;
    serde_json::from_str(&text).ok()
}

fn config(options: ConnectionOptions) -> IpcConfig {
    IpcConfig {
        options: ConnectionOptions {
            retry: Arc::new(FixedDelay::new(Duration::from_millis(5))),
            ..options
        },
        ..Default::default()
    }
}

fn query(id: u64, path: &str) -> Operation {
    Operation::new(OpId::new(id), OperationKind::Query, path, Value::Null)
}

fn link(client: MuxClient) -> linkrpc_core::Chain<linkrpc_core::SubscriptionsSupported> {
    ChainBuilder::new().terminate(IpcLink::new(client)).unwrap()
}

#[cfg(test)]
mod ipc_tests {
    use super::*;

    #[tokio::test]
    async fn test_query_over_duplex_channel() {
        let (connector, mut acceptor) = in_process();
        let link = IpcLink::new(create_ipc_client(connector, config(ConnectionOptions::default())));
        let chain = ChainBuilder::new().terminate(link).unwrap();

        let op = Operation::new(OpId::new(1), OperationKind::Query, "host.version", Value::Null);
        let (promise, _abort) = linkrpc_core::observable_to_promise(&chain.execute(op));

        let mut host = acceptor.accept().await.unwrap();
        let request = recv_json(&mut host).await.unwrap();
        assert_eq!(request["method"], "query");
        assert_eq!(request["params"]["path"], "host.version");
        host.send(r#"{"id":1,"result":{"type":"data","data":"1.2.0"}}"#)
            .await
            .unwrap();

        assert_eq!(promise.await.unwrap(), Envelope::Data(json!("1.2.0")));
    }

    #[tokio::test]
    async fn test_missing_pong_cycles_connection() {
        let (connector, mut acceptor) = in_process();
        let options = ConnectionOptions {
            keep_alive: KeepAliveConfig {
                enabled: true,
                interval_ms: 20,
                pong_timeout_ms: 20,
            },
            ..Default::default()
        };
        let _client = create_ipc_client(connector, config(options));

        let mut first = acceptor.accept().await.unwrap();
        assert_eq!(first.recv().await.as_deref(), Some("PING"));
        // No PONG: the client gives up on this connection and dials again.
        assert!(timeout(Duration::from_secs(1), first.recv()).await.unwrap().is_none());
        assert!(timeout(Duration::from_secs(1), acceptor.accept()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pong_keeps_connection_alive() {
        let (connector, mut acceptor) = in_process();
        let options = ConnectionOptions {
            keep_alive: KeepAliveConfig {
                enabled: true,
                interval_ms: 20,
                pong_timeout_ms: 40,
            },
            ..Default::default()
        };
        let _client = create_ipc_client(connector, config(options));

        let mut host = acceptor.accept().await.unwrap();
        for _ in 0..3 {
            assert_eq!(host.recv().await.as_deref(), Some("PING"));
            host.send("PONG").await.unwrap();
        }
        assert!(timeout(Duration::from_millis(50), acceptor.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_subscription_resumes_on_new_host_channel() {
        let (connector, mut acceptor) = in_process();
        let link = IpcLink::new(create_ipc_client(connector, config(ConnectionOptions::default())));
        let chain = ChainBuilder::new().terminate(link.clone()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(0));
        let (s, e) = (seen.clone(), errors.clone());
        let op = Operation::new(
            OpId::new(4),
            OperationKind::Subscription,
            "window.events",
            Value::Null,
        );
        let _sub = chain.execute(op).subscribe(
            Sink::new()
                .on_next(move |env| s.lock().push(env))
                .on_error(move |_| *e.lock() += 1),
        );

        let mut first = acceptor.accept().await.unwrap();
        recv_json(&mut first).await.unwrap();
        first.send(r#"{"id":4,"result":{"type":"started"}}"#).await.unwrap();
        first.send(r#"{"id":4,"result":{"type":"event","data":"focus"}}"#).await.unwrap();
        while seen.lock().len() < 2 {
            tokio::task::yield_now().await;
        }
        drop(first);

        let mut second = acceptor.accept().await.unwrap();
        assert_eq!(recv_json(&mut second).await.unwrap()["id"], 4);
        second.send(r#"{"id":4,"result":{"type":"started"}}"#).await.unwrap();
        second.send(r#"{"id":4,"result":{"type":"event","data":"blur"}}"#).await.unwrap();
        timeout(Duration::from_secs(1), async {
            while seen.lock().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                Envelope::Started,
                Envelope::Data(json!("focus")),
                Envelope::Data(json!("blur")),
            ]
        );
        assert_eq!(*errors.lock(), 0);
        assert_eq!(link.client().pending_count(), 1);
    }

    #[tokio::test]
    async fn test_error_result_reaches_only_its_caller() {
        let (connector, mut acceptor) = in_process();
        let chain = link(create_ipc_client(connector, config(ConnectionOptions::default())));
        let (failing, _) = observable_to_promise(&chain.execute(query(1, "post.byId")));
        let (healthy, _) = observable_to_promise(&chain.execute(query(2, "post.list")));

        let mut host = acceptor.accept().await.unwrap();
        let batch = recv_json(&mut host).await.unwrap();
        assert_eq!(batch.as_array().map(Vec::len), Some(2));
        host.send(
            r#"[{"id":1,"result":{"type":"error","data":{"code":-32004,"message":"gone"}}},
                {"id":2,"result":{"type":"data","data":[]}}]"#,
        )
        .await
        .unwrap();

        let err = timeout(Duration::from_millis(500), failing).await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Server(ref shape) if shape.code == -32004));
        assert_eq!(err.message(), "gone");
        assert_eq!(
            timeout(Duration::from_millis(500), healthy).await.unwrap().unwrap(),
            Envelope::Data(json!([]))
        );
    }

    #[tokio::test]
    async fn test_undecodable_item_does_not_sink_its_batch() {
        let (connector, mut acceptor) = in_process();
        let chain = link(create_ipc_client(connector, config(ConnectionOptions::default())));
        let (promise, _) = observable_to_promise(&chain.execute(query(1, "count")));

        let mut host = acceptor.accept().await.unwrap();
        recv_json(&mut host).await.unwrap();
        host.send(r#"[{"id":1,"result":{"type":"data","data":1}},{"foo":1}]"#)
            .await
            .unwrap();

        let value = timeout(Duration::from_millis(500), promise).await.unwrap().unwrap();
        assert_eq!(value, Envelope::Data(json!(1)));
    }

    #[tokio::test]
    async fn test_started_is_not_a_query_result() {
        let (connector, mut acceptor) = in_process();
        let chain = link(create_ipc_client(connector, config(ConnectionOptions::default())));
        let (promise, _) = observable_to_promise(&chain.execute(query(1, "count")));

        let mut host = acceptor.accept().await.unwrap();
        recv_json(&mut host).await.unwrap();
        host.send(
            r#"[{"id":1,"result":{"type":"started"}},
                {"id":1,"result":{"type":"data","data":7}}]"#,
        )
        .await
        .unwrap();

        let value = timeout(Duration::from_millis(500), promise).await.unwrap().unwrap();
        assert_eq!(value, Envelope::Data(json!(7)));
    }

    #[tokio::test]
    async fn test_default_backoff_waits_before_reconnecting() {
        let (connector, mut acceptor) = in_process();
        let _client = create_ipc_client(connector, IpcConfig::default());

        let mut accepted = 0;
        let _ = timeout(Duration::from_millis(300), async {
            while let Some(host) = acceptor.accept().await {
                accepted += 1;
                drop(host);
            }
        })
        .await;
        assert_eq!(accepted, 1, "reconnected without waiting");
    }

    #[tokio::test]
    async fn test_attempts_reset_only_after_peer_speaks() {
        let (connector, mut acceptor) = in_process();
        let options = ConnectionOptions {
            retry: Arc::new(FixedDelay {
                delay: Duration::from_millis(5),
                max_attempts: Some(1),
            }),
            ..Default::default()
        };
        let _client = create_ipc_client(connector, IpcConfig { options, ..Default::default() });

        // Two connections that answer keep the retry budget fresh.
        for _ in 0..2 {
            let mut host = timeout(Duration::from_secs(1), acceptor.accept())
                .await
                .unwrap()
                .unwrap();
            host.send("PONG").await.unwrap();
            drop(host);
        }
        // A silent one spends the single attempt, and the client gives up.
        let silent = timeout(Duration::from_secs(1), acceptor.accept()).await.unwrap().unwrap();
        drop(silent);
        assert!(timeout(Duration::from_millis(100), acceptor.accept()).await.is_err());
    }
}
