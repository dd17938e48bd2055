//! Web chat socket tests against a live server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beacon_switchboard::{Daemon, EchoBackend, api};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

mod common;
use common::{TestClock, daemon};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CHAT: &str = r#"
[pairing]
policy = "pairing"

[channels.chat]
type = "web"

[channels.proxied]
type = "web"
trust_sender_ids = true
"#;

async fn serve(daemon: Arc<Daemon>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(daemon)).await.unwrap();
    });
    addr
}

async fn started() -> SocketAddr {
    let daemon = daemon(CHAT, Arc::new(EchoBackend), &TestClock::new());
    daemon.start_all().await;
    serve(daemon).await
}

/// Next JSON frame, or `None` if nothing arrives within half a second
async fn next_frame(ws: &mut Client) -> Option<serde_json::Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_millis(500), ws.next())
            .await
            .ok()??
            .ok()?;
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).ok();
        }
    }
}

async fn connect(addr: SocketAddr, path: &str) -> (Client, serde_json::Value) {
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/{path}")).await.unwrap();
    let hello = next_frame(&mut ws).await.expect("no connected frame");
    assert_eq!(hello["type"], "connected");
    (ws, hello)
}

#[tokio::test]
async fn test_reply_reaches_only_the_sending_client() {
    let addr = started().await;
    let (mut alice, _) = connect(addr, "chat").await;
    let (mut bob, _) = connect(addr, "chat").await;

    alice
        .send(Message::Text(r#"{"text":"hello"}"#.to_string().into()))
        .await
        .unwrap();

    let reply = next_frame(&mut alice).await.expect("no reply for sender");
    assert_eq!(reply["type"], "message");
    assert!(reply["text"].as_str().unwrap().contains("Your code:"));

    assert!(next_frame(&mut bob).await.is_none());
}

#[tokio::test]
async fn test_replies_keep_the_thread_id() {
    let addr = started().await;
    let (mut ws, _) = connect(addr, "chat").await;

    ws.send(Message::Text(r#"{"text":"hi","thread_id":"t-9"}"#.to_string().into()))
        .await
        .unwrap();
    let reply = next_frame(&mut ws).await.expect("no reply");
    assert_eq!(reply["thread_id"], "t-9");
}

#[tokio::test]
async fn test_client_sender_ids_are_ignored_unless_trusted() {
    let addr = started().await;

    let (_ws, hello) = connect(addr, "chat?sender=admin").await;
    let assigned = hello["sender_id"].as_str().unwrap();
    assert_ne!(assigned, "admin");
    assert!(assigned.starts_with("web-"));

    let (_ws, hello) = connect(addr, "proxied?sender=alice").await;
    assert_eq!(hello["sender_id"], "alice");
}

#[tokio::test]
async fn test_unknown_instance_is_rejected() {
    let addr = started().await;
    assert!(connect_async(format!("ws://{addr}/ws/missing")).await.is_err());
}
