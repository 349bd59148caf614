//! Integration tests for the reconnecting websocket client
//!
//! Each test runs a throwaway tungstenite server on a loopback port.

use futures::{SinkExt, StreamExt};
use reconws::{
    ConnectionState, MessageKind, ReconWs, ReconWsConfig, ReconWsHandle, RetryConfig, WsMessage,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .bounds(Duration::from_millis(10), Duration::from_millis(100))
        .handshake_timeout(Duration::from_secs(2))
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/in/video0", listener.local_addr().unwrap());
    (listener, url)
}

async fn wait_connected(handle: &ReconWsHandle, connects: u64) {
    timeout(Duration::from_secs(5), async {
        while !(handle.is_connected() && handle.metrics().connects >= connects) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client did not connect");
}

#[tokio::test]
async fn test_connect_and_send() {
    let (listener, url) = bind().await;
    let (got_tx, mut got_rx) = mpsc::channel::<Message>(8);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_binary() || msg.is_text() {
                let _ = got_tx.send(msg).await;
            }
        }
    });

    let ws = ReconWs::spawn(ReconWsConfig::new(url).retry(fast_retry()));
    wait_connected(ws.handle(), 1).await;

    ws.send(WsMessage::binary(vec![0x47u8; 188])).await.unwrap();
    ws.send(WsMessage::text("hello")).await.unwrap();

    let first = timeout(Duration::from_secs(2), got_rx.recv()).await.unwrap().unwrap();
    assert!(first.is_binary());
    assert_eq!(first.into_data().len(), 188);

    let second = timeout(Duration::from_secs(2), got_rx.recv()).await.unwrap().unwrap();
    assert!(second.is_text());
    assert_eq!(second.into_data().as_ref(), b"hello");

    let handle = ws.handle().clone();
    timeout(Duration::from_secs(2), async {
        while handle.metrics().messages_sent < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(handle.metrics().bytes_sent, 193);

    ws.stop();
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let (listener, url) = bind().await;
    let (got_tx, mut got_rx) = mpsc::channel::<(usize, Vec<u8>)>(8);

    tokio::spawn(async move {
        // First connection is dropped after one message
        for conn in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_binary() {
                    let _ = got_tx.send((conn, msg.into_data().to_vec())).await;
                    if conn == 0 {
                        break;
                    }
                }
            }
            drop(ws);
        }
    });

    let ws = ReconWs::spawn(ReconWsConfig::new(url).retry(fast_retry()));
    wait_connected(ws.handle(), 1).await;

    ws.send(WsMessage::binary(vec![1u8])).await.unwrap();
    let (conn, data) = timeout(Duration::from_secs(2), got_rx.recv()).await.unwrap().unwrap();
    assert_eq!((conn, data), (0, vec![1u8]));

    wait_connected(ws.handle(), 2).await;
    assert!(ws.handle().metrics().disconnects >= 1);

    ws.send(WsMessage::binary(vec![2u8])).await.unwrap();
    let (conn, data) = timeout(Duration::from_secs(2), got_rx.recv()).await.unwrap().unwrap();
    assert_eq!((conn, data), (1, vec![2u8]));

    ws.stop();
}

#[tokio::test]
async fn test_bearer_token_sent_in_handshake() {
    let (listener, url) = bind().await;
    let (header_tx, header_rx) = oneshot::channel::<Option<String>>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |req: &Request, resp: Response| {
            let auth = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let _ = header_tx.send(auth);
            Ok::<_, ErrorResponse>(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let ws = ReconWs::spawn(ReconWsConfig::new(url).token("s3cret").retry(fast_retry()));

    let auth = timeout(Duration::from_secs(2), header_rx).await.unwrap().unwrap();
    assert_eq!(auth.as_deref(), Some("Bearer s3cret"));

    ws.stop();
}

#[tokio::test]
async fn test_inbound_messages_forwarded() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::text("status ok".to_string())).await.unwrap();
        ws.send(Message::binary(vec![9u8, 9, 9])).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let mut ws = ReconWs::spawn(ReconWsConfig::new(url).retry(fast_retry()));

    let first = timeout(Duration::from_secs(2), ws.recv()).await.unwrap().unwrap();
    assert_eq!(first.kind, MessageKind::Text);
    assert_eq!(first.data.as_ref(), b"status ok");

    let second = timeout(Duration::from_secs(2), ws.recv()).await.unwrap().unwrap();
    assert_eq!(second.kind, MessageKind::Binary);
    assert_eq!(second.data.as_ref(), &[9u8, 9, 9]);

    assert_eq!(ws.handle().metrics().messages_received, 2);
    ws.stop();
}

#[tokio::test]
async fn test_stop_closes_connection() {
    let (listener, url) = bind().await;
    let (closed_tx, closed_rx) = oneshot::channel::<bool>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut saw_close = false;
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                saw_close = true;
            }
        }
        let _ = closed_tx.send(saw_close);
    });

    let ws = ReconWs::spawn(ReconWsConfig::new(url).retry(fast_retry()));
    let handle = ws.handle().clone();
    wait_connected(&handle, 1).await;

    ws.stop();
    timeout(Duration::from_secs(2), handle.stopped()).await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Terminated);

    let saw_close = timeout(Duration::from_secs(2), closed_rx).await.unwrap().unwrap();
    assert!(saw_close);
}

#[tokio::test]
async fn test_stop_during_stalled_write_sends_close() {
    let (listener, url) = bind().await;
    let (go_tx, go_rx) = oneshot::channel::<()>();
    let (closed_tx, closed_rx) = oneshot::channel::<bool>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // Stop reading until the client is told to stop, so its writes back up
        let _ = go_rx.await;
        let mut saw_close = false;
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                saw_close = true;
            }
        }
        let _ = closed_tx.send(saw_close);
    });

    let ws = ReconWs::spawn(ReconWsConfig::new(url).retry(fast_retry()));
    let handle = ws.handle().clone();
    wait_connected(&handle, 1).await;

    let out = ws.sender();
    tokio::spawn(async move {
        for _ in 0..64 {
            if out.send(WsMessage::binary(vec![0x47u8; 1 << 20])).await.is_err() {
                break;
            }
        }
    });

    // Wait until the socket stops accepting more data
    timeout(Duration::from_secs(10), async {
        let mut last = u64::MAX;
        let mut unchanged = 0;
        while unchanged < 3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let sent = handle.metrics().messages_sent;
            if sent == last {
                unchanged += 1;
            } else {
                unchanged = 0;
                last = sent;
            }
        }
    })
    .await
    .expect("writes never stalled");
    assert!(handle.metrics().messages_sent < 64);

    ws.stop();
    let _ = go_tx.send(());

    timeout(Duration::from_secs(5), handle.stopped()).await.unwrap();
    let saw_close = timeout(Duration::from_secs(10), closed_rx).await.unwrap().unwrap();
    assert!(saw_close);
}

#[tokio::test]
async fn test_handshake_timeout_counts_as_dial_failure() {
    let (listener, url) = bind().await;

    // Accept TCP but never answer the websocket handshake
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let retry = RetryConfig::default()
        .bounds(Duration::from_millis(10), Duration::from_millis(20))
        .handshake_timeout(Duration::from_millis(100));
    let ws = ReconWs::spawn(ReconWsConfig::new(url).retry(retry));
    let handle = ws.handle().clone();

    timeout(Duration::from_secs(5), async {
        while handle.metrics().dial_failures < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("handshake never timed out");

    let metrics = handle.metrics();
    assert_eq!(metrics.connects, 0);
    assert!(!handle.is_connected());
    assert_ne!(handle.state(), ConnectionState::Terminated);

    ws.stop();
    timeout(Duration::from_secs(2), handle.stopped()).await.unwrap();
}
