//! Integration tests for the Tether server, handler, and full connection flow.
//!
//! Every test runs a real server on a random port and drives it with
//! WebSocket clients.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tether::prelude::*;
use tokio_tungstenite::tungstenite::Message;

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Starts a server on a random port and returns its address and manager.
async fn start_server(config: SessionConfig) -> (String, SessionManager) {
    let server = TetherServerBuilder::new()
        .bind("127.0.0.1:0")
        .session_config(config)
        .build()
        .await
        .expect("server should build");

    let addr = server
        .local_addr()
        .expect("should have local addr")
        .to_string();
    let sessions = server.sessions().clone();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    (addr, sessions)
}

async fn start_default_server() -> (String, SessionManager) {
    start_server(SessionConfig::default()).await
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

async fn send(ws: &mut ClientWs, text: &str) {
    ws.send(Message::text(text.to_owned()))
        .await
        .expect("send");
}

async fn send_json(ws: &mut ClientWs, value: Value) {
    send(ws, &value.to_string()).await;
}

async fn recv_text(ws: &mut ClientWs) -> String {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("recv");
        match msg {
            Message::Text(text) => return text.as_str().to_owned(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

async fn recv_json(ws: &mut ClientWs) -> Value {
    serde_json::from_str(&recv_text(ws).await).expect("server sent invalid JSON")
}

/// Asserts the server closes the connection without sending more text.
async fn expect_closed(ws: &mut ClientWs) {
    loop {
        let next = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match next {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Text(text))) => panic!("expected close, got text {text:?}"),
            Some(Ok(_)) => continue,
        }
    }
}

/// Asserts nothing arrives for a short while.
async fn expect_silence(ws: &mut ClientWs) {
    let next = tokio::time::timeout(Duration::from_millis(100), ws.next()).await;
    assert!(next.is_err(), "expected no frames, got {next:?}");
}

/// Polls until `check` holds for the session's presence snapshot.
async fn wait_for(sessions: &SessionManager, id: &str, check: impl Fn(&SessionInfo) -> bool) {
    let session = sessions
        .registry()
        .get(&SessionId::new(id))
        .await
        .expect("session should exist");
    for _ in 0..100 {
        if check(&session.info().await.expect("session alive")) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} never reached the expected state");
}

/// Creates `id` over a fresh connection and returns it with the token.
async fn create(addr: &str, id: &str) -> (ClientWs, String) {
    let mut ws = connect(addr).await;
    send_json(
        &mut ws,
        json!({"type": "SessionCreate", "reqId": "c1", "sessionId": id}),
    )
    .await;
    let res = recv_json(&mut ws).await;
    assert_eq!(res["ok"], true, "create failed: {res}");
    let token = res["reconnectToken"].as_str().unwrap().to_owned();
    (ws, token)
}

/// Joins `id` over a fresh connection.
async fn join(addr: &str, id: &str) -> ClientWs {
    let mut ws = connect(addr).await;
    send_json(
        &mut ws,
        json!({"type": "SessionJoin", "reqId": "j1", "sessionId": id}),
    )
    .await;
    let res = recv_json(&mut ws).await;
    assert_eq!(res["ok"], true, "join failed: {res}");
    ws
}

// =========================================================================
// Heartbeat and malformed input
// =========================================================================

#[tokio::test]
async fn test_ping_answers_pong_when_unbound() {
    let (addr, _) = start_default_server().await;
    let mut ws = connect(&addr).await;

    send(&mut ws, "ping").await;
    assert_eq!(recv_text(&mut ws).await, "pong");

    send(&mut ws, "ping").await;
    assert_eq!(recv_text(&mut ws).await, "pong");
}

#[tokio::test]
async fn test_non_json_closes_without_response() {
    let (addr, _) = start_default_server().await;
    let mut ws = connect(&addr).await;

    send(&mut ws, "hello there").await;

    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_control_missing_field_answers_unknown_error_then_closes() {
    let (addr, _) = start_default_server().await;
    let mut ws = connect(&addr).await;

    send_json(&mut ws, json!({"type": "SessionJoin", "reqId": "x1"})).await;

    let res = recv_json(&mut ws).await;
    assert_eq!(res["type"], "ConfirmationResponse");
    assert_eq!(res["respondingTo"], "SessionJoin");
    assert_eq!(res["reqId"], "x1");
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"], "UnknownError");
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_relay_from_unbound_connection_answers_unknown_error() {
    let (addr, _) = start_default_server().await;
    let mut ws = connect(&addr).await;

    send_json(&mut ws, json!({"type": "Compile", "reqId": "r1"})).await;

    let res = recv_json(&mut ws).await;
    assert_eq!(res["error"], "UnknownError");
    assert_eq!(res["respondingTo"], "Compile");
    expect_closed(&mut ws).await;
}

// =========================================================================
// Accept
// =========================================================================

#[tokio::test]
async fn test_silent_tcp_client_does_not_block_new_connections() {
    let (addr, _) = start_default_server().await;
    let _silent = tokio::net::TcpStream::connect(&addr)
        .await
        .expect("tcp connect");

    let answered = tokio::time::timeout(Duration::from_secs(3), async {
        let mut ws = connect(&addr).await;
        send(&mut ws, "ping").await;
        recv_text(&mut ws).await
    })
    .await
    .expect("a client stalled behind a connection that never upgraded");
    assert_eq!(answered, "pong");
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test]
async fn test_create_duplicate_id_fails_taken() {
    let (addr, _) = start_default_server().await;
    let (_first, _) = create(&addr, "DUP").await;
    let mut second = connect(&addr).await;

    send_json(
        &mut second,
        json!({"type": "SessionCreate", "reqId": "c2", "sessionId": "DUP"}),
    )
    .await;

    let res = recv_json(&mut second).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"], "SessionIdTaken");
    assert_eq!(res["message"], "Session ID already exists");

    // A failed control request leaves the connection open.
    send(&mut second, "ping").await;
    assert_eq!(recv_text(&mut second).await, "pong");
}

#[tokio::test]
async fn test_join_unknown_and_occupied_sessions_fail() {
    let (addr, _) = start_default_server().await;
    let (_controller, _) = create(&addr, "S1").await;
    let _editor = join(&addr, "S1").await;
    let mut other = connect(&addr).await;

    send_json(
        &mut other,
        json!({"type": "SessionJoin", "reqId": "j2", "sessionId": "nope"}),
    )
    .await;
    assert_eq!(recv_json(&mut other).await["error"], "SessionIdNotExist");

    send_json(
        &mut other,
        json!({"type": "SessionJoin", "reqId": "j3", "sessionId": "S1"}),
    )
    .await;
    let res = recv_json(&mut other).await;
    assert_eq!(res["error"], "SessionHasEditor");
    assert_eq!(res["message"], "Someone is already editing this session");
    assert_eq!(res["reqId"], "j3");
}

#[tokio::test]
async fn test_controller_close_frees_slot_but_keeps_session() {
    let (addr, sessions) = start_default_server().await;
    let (mut controller, _) = create(&addr, "S1").await;

    controller.close(None).await.expect("close");

    wait_for(&sessions, "S1", |info| !info.controller_connected).await;
    assert!(sessions.registry().contains(&SessionId::new("S1")).await);
}

#[tokio::test]
async fn test_control_request_from_bound_connection_moves_binding() {
    let (addr, sessions) = start_default_server().await;
    let (mut controller, _) = create(&addr, "S1").await;

    send_json(
        &mut controller,
        json!({"type": "SessionCreate", "reqId": "c2", "sessionId": "S2"}),
    )
    .await;
    let res = recv_json(&mut controller).await;
    assert_eq!(res["ok"], true, "second create failed: {res}");

    // The old slot is released once the new binding succeeds.
    wait_for(&sessions, "S1", |info| !info.controller_connected).await;
    wait_for(&sessions, "S2", |info| info.controller_connected).await;

    // A failed request keeps the current binding.
    send_json(
        &mut controller,
        json!({"type": "SessionJoin", "reqId": "j9", "sessionId": "nope"}),
    )
    .await;
    let res = recv_json(&mut controller).await;
    assert_eq!(res["error"], "SessionIdNotExist");
    assert_eq!(res["reqId"], "j9");

    let mut editor = join(&addr, "S2").await;
    let request = r#"{"type":"Build","reqId":"b1"}"#;
    send(&mut editor, request).await;
    assert_eq!(recv_text(&mut controller).await, request);

    let reply = r#"{"type":"ConfirmationResponse","respondingTo":"Build","reqId":"b1","ok":true}"#;
    send(&mut controller, reply).await;
    assert_eq!(recv_text(&mut editor).await, reply);

    // Requests in S1 no longer reach this connection.
    let mut s1_editor = join(&addr, "S1").await;
    send(&mut s1_editor, r#"{"type":"Build","reqId":"b2"}"#).await;
    wait_for(&sessions, "S1", |info| info.outbox_len == 1).await;
    expect_silence(&mut controller).await;
}

// =========================================================================
// Relay
// =========================================================================

#[tokio::test]
async fn test_relay_both_directions_verbatim() {
    let (addr, _) = start_default_server().await;
    let (mut controller, _) = create(&addr, "S1").await;
    let mut editor = join(&addr, "S1").await;
    let request = r#"{"type":"Compile", "reqId":"r1","files":{"main.c":"int main(){}"}}"#;
    let reply = r#"{"type":"ConfirmationResponse","respondingTo":"Compile","reqId":"r1","ok":true}"#;
    let broadcast = r#"{"type":"StateChanged","devices":[]}"#;

    send(&mut editor, request).await;
    assert_eq!(recv_text(&mut controller).await, request);

    send(&mut controller, reply).await;
    send(&mut controller, broadcast).await;
    assert_eq!(recv_text(&mut editor).await, reply);
    assert_eq!(recv_text(&mut editor).await, broadcast);
}

#[tokio::test]
async fn test_relay_to_absent_editor_fails_peer_not_connected() {
    let (addr, sessions) = start_default_server().await;
    let (mut controller, _) = create(&addr, "S1").await;
    let mut editor = join(&addr, "S1").await;
    editor.close(None).await.expect("close");
    wait_for(&sessions, "S1", |info| !info.editor_connected).await;

    send_json(&mut controller, json!({"type": "Flash", "reqId": "f1"})).await;

    let res = recv_json(&mut controller).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"], "PeerNotConnected");
    assert_eq!(res["respondingTo"], "Flash");
    assert_eq!(res["reqId"], "f1");
}

#[tokio::test]
async fn test_outbox_eviction_fails_requests_and_closes_editor() {
    let (addr, sessions) = start_server(SessionConfig {
        outbox_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    })
    .await;
    let (mut controller, _) = create(&addr, "S1").await;
    let mut editor = join(&addr, "S1").await;
    controller.close(None).await.expect("close");
    wait_for(&sessions, "S1", |info| !info.controller_connected).await;

    send_json(&mut editor, json!({"type": "Compile", "reqId": "r1"})).await;
    send_json(&mut editor, json!({"type": "Upload", "reqId": "r2"})).await;

    let first = recv_json(&mut editor).await;
    assert_eq!(first["respondingTo"], "Compile");
    assert_eq!(first["reqId"], "r1");
    assert_eq!(first["error"], "PeerNotConnected");
    let second = recv_json(&mut editor).await;
    assert_eq!(second["respondingTo"], "Upload");
    assert_eq!(second["reqId"], "r2");
    expect_closed(&mut editor).await;

    wait_for(&sessions, "S1", |info| !info.editor_connected && info.outbox_len == 0).await;
}

#[tokio::test]
async fn test_idle_timeout_notifies_closes_and_frees_id() {
    let (addr, sessions) = start_server(SessionConfig {
        idle_timeout: Duration::from_millis(300),
        ..SessionConfig::default()
    })
    .await;
    let (mut controller, _) = create(&addr, "S1").await;
    let mut editor = join(&addr, "S1").await;

    // Heartbeats keep the socket alive but don't count as session traffic.
    send(&mut editor, "ping").await;
    assert_eq!(recv_text(&mut editor).await, "pong");

    for ws in [&mut controller, &mut editor] {
        let notice = recv_json(&mut *ws).await;
        assert_eq!(notice["type"], "IdleTimeout");
        assert!(notice["message"].as_str().unwrap().contains("without any activity"));
        expect_closed(ws).await;
    }
    assert!(!sessions.registry().contains(&SessionId::new("S1")).await);

    let (_again, _) = create(&addr, "S1").await;
}

// =========================================================================
// End to end
// =========================================================================

#[tokio::test]
async fn test_disconnect_and_rejoin_delivers_queued_request() {
    let (addr, sessions) = start_default_server().await;

    let (mut controller, token) = create(&addr, "ABC123").await;
    let mut editor = join(&addr, "ABC123").await;

    let r1 = r#"{"type":"Ping","reqId":"r1"}"#;
    send(&mut editor, r1).await;
    assert_eq!(recv_text(&mut controller).await, r1);

    controller.close(None).await.expect("close");
    wait_for(&sessions, "ABC123", |info| !info.controller_connected).await;

    let r2 = r#"{"type":"Ping","reqId":"r2"}"#;
    send(&mut editor, r2).await;
    expect_silence(&mut editor).await;

    let mut controller = connect(&addr).await;
    send_json(
        &mut controller,
        json!({"type": "SessionRejoin", "reqId": "rj1", "sessionId": "ABC123", "reconnectToken": token}),
    )
    .await;
    let res = recv_json(&mut controller).await;
    assert_eq!(res["respondingTo"], "SessionRejoin");
    assert_eq!(res["ok"], true);
    assert_eq!(res["reconnectToken"], token.as_str());
    assert_eq!(recv_text(&mut controller).await, r2);

    let mut intruder = connect(&addr).await;
    send_json(
        &mut intruder,
        json!({"type": "SessionRejoin", "reqId": "rj2", "sessionId": "ABC123", "reconnectToken": "wrong"}),
    )
    .await;
    let res = recv_json(&mut intruder).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"], "BadReconnectToken");
    assert_eq!(res["message"], "Reconnect token incorrect");
}

#[tokio::test]
async fn test_rejoin_accepts_legacy_token_field() {
    let (addr, sessions) = start_default_server().await;
    let (mut controller, token) = create(&addr, "S1").await;
    controller.close(None).await.expect("close");
    wait_for(&sessions, "S1", |info| !info.controller_connected).await;

    let mut controller = connect(&addr).await;
    send_json(
        &mut controller,
        json!({"type": "SessionRejoin", "reqId": "rj", "sessionId": "S1", "ccReconnectToken": token}),
    )
    .await;

    assert_eq!(recv_json(&mut controller).await["ok"], true);
}
