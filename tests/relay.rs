//! Relay server over a real socket

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use peerdrop::config::RelayConfig;
use peerdrop::relay::RelayServer;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay(config: RelayConfig) -> SocketAddr {
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    addr
}

async fn next_json(ws: &mut Client) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

/// Connect and return the client with its assigned id
async fn join(addr: SocketAddr) -> (Client, String) {
    let (mut ws, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    let init = next_json(&mut ws).await;
    assert_eq!(init["type"], "init");
    let id = init["id"].as_str().unwrap().to_string();
    (ws, id)
}

/// Read peer lists until one with `expected` members arrives
async fn peer_list_of_len(ws: &mut Client, expected: usize) -> HashSet<String> {
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == "peer-list" {
            let peers: HashSet<String> = frame["peers"]
                .as_array()
                .unwrap()
                .iter()
                .map(|p| p.as_str().unwrap().to_string())
                .collect();
            if peers.len() == expected {
                return peers;
            }
        }
    }
}

async fn assert_silent(ws: &mut Client) {
    let quiet = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(quiet.is_err(), "unexpected frame: {:?}", quiet);
}

#[tokio::test]
async fn test_peer_lists_exclude_recipient() {
    let addr = start_relay(RelayConfig::default()).await;

    let (mut a, a_id) = join(addr).await;
    let (mut b, b_id) = join(addr).await;
    let (mut c, c_id) = join(addr).await;
    assert_ne!(a_id, b_id);
    assert_ne!(b_id, c_id);

    let expect = |ids: &[&String]| ids.iter().map(|s| s.to_string()).collect::<HashSet<_>>();
    assert_eq!(peer_list_of_len(&mut a, 2).await, expect(&[&b_id, &c_id]));
    assert_eq!(peer_list_of_len(&mut b, 2).await, expect(&[&a_id, &c_id]));
    assert_eq!(peer_list_of_len(&mut c, 2).await, expect(&[&a_id, &b_id]));

    // Disconnect triggers a fresh broadcast
    c.close(None).await.unwrap();
    assert_eq!(peer_list_of_len(&mut a, 1).await, expect(&[&b_id]));
    assert_eq!(peer_list_of_len(&mut b, 1).await, expect(&[&a_id]));
}

#[tokio::test]
async fn test_forwarding_injects_sender() {
    let addr = start_relay(RelayConfig::default()).await;
    let (mut a, a_id) = join(addr).await;
    let (mut b, b_id) = join(addr).await;
    peer_list_of_len(&mut a, 1).await;
    peer_list_of_len(&mut b, 1).await;

    let frame = json!({
        "to": b_id,
        "from": "spoofed",
        "type": "signal",
        "signal": {"type": "offer", "sdp": {"type": "offer", "sdp": "v=0"}}
    });
    a.send(Message::Text(frame.to_string())).await.unwrap();

    let got = next_json(&mut b).await;
    assert_eq!(got["from"], Value::String(a_id));
    assert_eq!(got["type"], "signal");
    assert_eq!(got["signal"]["sdp"]["sdp"], "v=0");
}

#[tokio::test]
async fn test_unknown_destination_is_dropped() {
    let addr = start_relay(RelayConfig::default()).await;
    let (mut a, _a_id) = join(addr).await;
    let (mut b, b_id) = join(addr).await;
    peer_list_of_len(&mut a, 1).await;
    peer_list_of_len(&mut b, 1).await;

    let stray = json!({"to": "nobody", "type": "signal", "signal": {"type": "candidate"}});
    a.send(Message::Text(stray.to_string())).await.unwrap();
    a.send(Message::Text("not json".into())).await.unwrap();
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;

    // Connection still works afterwards
    let ok = json!({"to": b_id, "type": "signal", "signal": {"type": "candidate"}});
    a.send(Message::Text(ok.to_string())).await.unwrap();
    assert_eq!(next_json(&mut b).await["signal"]["type"], "candidate");
}

#[tokio::test]
async fn test_capacity_limit_refuses_upgrade() {
    let addr = start_relay(RelayConfig {
        max_peers: 1,
        ..Default::default()
    })
    .await;
    let (_a, _) = join(addr).await;

    let refused = connect_async(format!("ws://{}/", addr)).await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn test_health_endpoint() {
    let addr = start_relay(RelayConfig::default()).await;
    let (_a, _) = join(addr).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.contains(r#""peers":1"#));
}
