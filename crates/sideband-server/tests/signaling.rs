//! End-to-end scenarios against a live server: two tungstenite clients
//! pairing up, relaying, and tearing down.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sideband_server::config::Config;
use sideband_server::server;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> SocketAddr {
    let mut config = Config::default();
    config.listen_address = "127.0.0.1:0".parse().unwrap();
    let (addr, _state, _serve) = server::start(config).await.unwrap();
    addr
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connect");
    ws
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Next text frame from the server, skipping transport pings.
async fn recv_text(ws: &mut Ws) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn recv_json(ws: &mut Ws) -> Value {
    serde_json::from_str(&recv_text(ws).await).expect("server sent invalid JSON")
}

/// Assert no text frame arrives within the window.
async fn expect_silence(ws: &mut Ws, window_ms: u64) {
    let got = tokio::time::timeout(Duration::from_millis(window_ms), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await;
    if let Ok(Some(text)) = got {
        panic!("expected silence, got frame: {text}");
    }
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Create a session as `client_id`; returns (session_id, token).
async fn create_session(ws: &mut Ws, client_id: &str, display_name: &str) -> (String, String) {
    send(
        ws,
        json!({
            "type": "create_session",
            "timestamp": now_ms(),
            "payload": {"clientId": client_id, "displayName": display_name},
        }),
    )
    .await;
    let reply = recv_json(ws).await;
    assert_eq!(reply["type"], "session_created");
    let session_id = reply["payload"]["sessionId"].as_str().unwrap().to_string();
    let token = reply["payload"]["token"].as_str().unwrap().to_string();
    assert_eq!(session_id.len(), 32);
    assert_eq!(token.len(), 64);
    assert!(reply["payload"]["expiresAt"].as_i64().unwrap() > now_ms());
    (session_id, token)
}

fn join_frame(session_id: &str, token: &str, client_id: &str, display_name: &str) -> Value {
    json!({
        "type": "join_session",
        "sessionId": session_id,
        "timestamp": now_ms(),
        "payload": {"token": token, "clientId": client_id, "displayName": display_name},
    })
}

#[tokio::test]
async fn happy_pair_relays_verbatim() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    let (session_id, token) = create_session(&mut alice, "A", "Alice").await;

    send(&mut bob, join_frame(&session_id, &token, "B", "Bob")).await;
    let joined = recv_json(&mut bob).await;
    assert_eq!(joined["type"], "session_joined");
    assert_eq!(joined["payload"]["peerId"], "A");
    assert_eq!(joined["payload"]["peerDisplayName"], "Alice");

    let notice = recv_json(&mut alice).await;
    assert_eq!(notice["type"], "peer_joined");
    assert_eq!(notice["payload"]["peerId"], "B");
    assert_eq!(notice["payload"]["peerDisplayName"], "Bob");
    // the join token never reaches the other side
    assert!(notice["payload"].get("token").is_none());

    let offer = json!({
        "type": "offer",
        "sessionId": session_id,
        "from": "A",
        "to": "B",
        "timestamp": now_ms(),
        "payload": {"type": "offer", "sdp": "v=0\r\no=- 4611731 2 IN IP4 127.0.0.1\r\n"},
    })
    .to_string();
    alice.send(Message::Text(offer.clone())).await.unwrap();

    // relays are forwarded byte-for-byte
    let relayed = recv_text(&mut bob).await;
    assert_eq!(relayed, offer);

    // and back the other way
    let answer = json!({
        "type": "answer",
        "sessionId": session_id,
        "from": "B",
        "to": "A",
        "timestamp": now_ms(),
        "payload": {"type": "answer", "sdp": "v=0\r\n"},
    })
    .to_string();
    bob.send(Message::Text(answer.clone())).await.unwrap();
    assert_eq!(recv_text(&mut alice).await, answer);
}

#[tokio::test]
async fn binary_frames_are_ignored() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    let (session_id, token) = create_session(&mut alice, "A", "Alice").await;
    send(&mut bob, join_frame(&session_id, &token, "B", "Bob")).await;
    recv_json(&mut bob).await;
    recv_json(&mut alice).await;

    alice
        .send(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef]))
        .await
        .unwrap();

    // the connection is still healthy afterwards
    let candidate = json!({
        "type": "ice_candidate",
        "sessionId": session_id,
        "from": "A",
        "to": "B",
        "timestamp": now_ms(),
        "payload": {"candidate": "candidate:0 1 UDP 2122252543 192.0.2.1 54400 typ host"},
    })
    .to_string();
    alice.send(Message::Text(candidate.clone())).await.unwrap();
    assert_eq!(recv_text(&mut bob).await, candidate);
}

#[tokio::test]
async fn bad_token_is_rejected_quietly() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;
    let mut mallory = connect(addr).await;

    let (session_id, _token) = create_session(&mut alice, "A", "Alice").await;

    let wrong = "0".repeat(64);
    send(&mut mallory, join_frame(&session_id, &wrong, "M", "Mallory")).await;
    let reply = recv_json(&mut mallory).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "INVALID_TOKEN");

    // the creator hears nothing about the failed attempt
    expect_silence(&mut alice, 300).await;
}

#[tokio::test]
async fn full_session_rejects_third_peer() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    let mut carol = connect(addr).await;

    let (session_id, token) = create_session(&mut alice, "A", "Alice").await;
    send(&mut bob, join_frame(&session_id, &token, "B", "Bob")).await;
    recv_json(&mut bob).await;
    recv_json(&mut alice).await;

    // correct token, but the room is taken
    send(&mut carol, join_frame(&session_id, &token, "C", "Carol")).await;
    let reply = recv_json(&mut carol).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "SESSION_FULL");
}

#[tokio::test]
async fn abrupt_disconnect_notifies_and_session_dies_with_last_member() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    let (session_id, token) = create_session(&mut alice, "A", "Alice").await;
    send(&mut bob, join_frame(&session_id, &token, "B", "Bob")).await;
    recv_json(&mut bob).await;
    recv_json(&mut alice).await;

    bob.close(None).await.unwrap();

    let notice = recv_json(&mut alice).await;
    assert_eq!(notice["type"], "peer_disconnected");
    assert_eq!(notice["payload"]["peerId"], "B");

    // last member leaves: the session and its token are gone
    alice.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut dave = connect(addr).await;
    send(&mut dave, join_frame(&session_id, &token, "D", "Dave")).await;
    let reply = recv_json(&mut dave).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;

    send(
        &mut alice,
        json!({
            "type": "create_session",
            "timestamp": now_ms() - 600_000,
            "payload": {"clientId": "A", "displayName": "Alice"},
        }),
    )
    .await;
    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "INVALID_TIMESTAMP");
}

#[tokio::test]
async fn session_close_yields_exactly_one_peer_left() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    let (session_id, token) = create_session(&mut alice, "A", "Alice").await;
    send(&mut bob, join_frame(&session_id, &token, "B", "Bob")).await;
    recv_json(&mut bob).await;
    recv_json(&mut alice).await;

    let close = json!({
        "type": "session_close",
        "sessionId": session_id,
        "timestamp": now_ms(),
        "payload": {"reason": "done"},
    });
    send(&mut alice, close.clone()).await;

    let notice = recv_json(&mut bob).await;
    assert_eq!(notice["type"], "peer_left");
    assert_eq!(notice["payload"]["peerId"], "A");
    assert_eq!(notice["payload"]["reason"], "done");

    // closing again is an error for the sender and silent for the peer
    send(&mut alice, close).await;
    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "INVALID_STATE");
    expect_silence(&mut bob, 300).await;
}

#[tokio::test]
async fn relay_before_pairing_is_unauthorized() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;

    let (session_id, _token) = create_session(&mut alice, "A", "Alice").await;

    send(
        &mut alice,
        json!({
            "type": "offer",
            "sessionId": session_id,
            "from": "A",
            "to": "B",
            "timestamp": now_ms(),
            "payload": {"type": "offer", "sdp": "v=0"},
        }),
    )
    .await;
    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn relay_with_forged_sender_is_unauthorized() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;

    let (session_id, token) = create_session(&mut alice, "A", "Alice").await;
    send(&mut bob, join_frame(&session_id, &token, "B", "Bob")).await;
    recv_json(&mut bob).await;
    recv_json(&mut alice).await;

    // `from` must match the connection's bound identity
    send(
        &mut bob,
        json!({
            "type": "offer",
            "sessionId": session_id,
            "from": "A",
            "to": "A",
            "timestamp": now_ms(),
            "payload": {"type": "offer", "sdp": "v=0"},
        }),
    )
    .await;
    let reply = recv_json(&mut bob).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "UNAUTHORIZED");

    // a recipient outside the session is PEER_NOT_FOUND
    send(
        &mut bob,
        json!({
            "type": "offer",
            "sessionId": session_id,
            "from": "B",
            "to": "Z",
            "timestamp": now_ms(),
            "payload": {"type": "offer", "sdp": "v=0"},
        }),
    )
    .await;
    let reply = recv_json(&mut bob).await;
    assert_eq!(reply["payload"]["code"], "PEER_NOT_FOUND");
}

#[tokio::test]
async fn second_create_on_bound_connection_is_invalid_state() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;

    create_session(&mut alice, "A", "Alice").await;
    send(
        &mut alice,
        json!({
            "type": "create_session",
            "timestamp": now_ms(),
            "payload": {"clientId": "A2", "displayName": "Alice"},
        }),
    )
    .await;
    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "INVALID_STATE");
}

#[tokio::test]
async fn unknown_type_and_unparsable_frames() {
    let addr = start_server().await;
    let mut alice = connect(addr).await;

    send(
        &mut alice,
        json!({"type": "teleport", "timestamp": now_ms(), "payload": {}}),
    )
    .await;
    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["payload"]["code"], "UNKNOWN_MESSAGE_TYPE");

    // unparsable input closes the connection after the error report
    alice
        .send(Message::Text("{definitely not json".into()))
        .await
        .unwrap();
    let reply = recv_json(&mut alice).await;
    assert_eq!(reply["payload"]["code"], "INVALID_MESSAGE");
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match alice.next().await {
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server did not close the connection");
}

#[tokio::test]
async fn per_address_connection_limit_rejects_at_accept() {
    let addr = start_server().await;
    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(connect(addr).await);
    }
    // the sixth connection from the same address is refused before upgrade
    let refused = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(refused.is_err());

    // closing one frees the slot
    held.pop().unwrap().close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ok = connect(addr).await;
}

#[tokio::test]
async fn diagnostics_report_counts() {
    let addr = start_server().await;

    let health: Value = serde_json::from_str(
        &reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["sessions"], 0);
    assert!(health["timestamp"].as_i64().unwrap() > 0);

    let mut alice = connect(addr).await;
    create_session(&mut alice, "A", "Alice").await;

    let stats: Value = serde_json::from_str(
        &reqwest::get(format!("http://{addr}/stats"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(stats["sessions"], 1);
    assert_eq!(stats["connections"], 1);
    assert_eq!(stats["sessionsCreated"], 1);
    assert_eq!(stats["sessionsExpired"], 0);
}
