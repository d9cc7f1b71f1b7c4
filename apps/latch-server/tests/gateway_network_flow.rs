use std::{net::SocketAddr, time::Duration};

use axum::{body::Body, http::Request, http::StatusCode};
use futures_util::{SinkExt, StreamExt};
use latch_server::{build_router_with_state, AppConfig, AppState, SessionGrant, UserId};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const EVENT_WAIT: Duration = Duration::from_secs(5);

async fn spawn_server(config: AppConfig) -> (AppState, SocketAddr, JoinHandle<()>) {
    let state = AppState::new(&config).expect("state should build");
    let app = build_router_with_state(&config, state.clone()).expect("router should build");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have address");
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("server should run");
    });
    (state, addr, server)
}

async fn parse_json_body<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    serde_json::from_slice(&body).expect("response body should be valid json")
}

fn post_json(uri: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request should build")
}

fn user(id: i64) -> UserId {
    UserId::try_from(id).expect("test user id should be positive")
}

async fn connect(addr: SocketAddr, grant: &SessionGrant) -> Socket {
    let url = format!("ws://{addr}/gateway?session_token={}", grant.session_token);
    let request = url
        .into_client_request()
        .expect("websocket request should build");
    let (socket, _) = connect_async(request)
        .await
        .expect("websocket should connect");
    socket
}

async fn next_text_event(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(EVENT_WAIT, socket.next())
            .await
            .expect("event should arrive in time")
            .expect("socket should stay open")
            .expect("websocket message should be valid");
        match message {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("event should be valid json");
            }
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected text event, got {other:?}"),
        }
    }
}

async fn next_close(socket: &mut Socket) -> (u16, String) {
    loop {
        let message = tokio::time::timeout(EVENT_WAIT, socket.next())
            .await
            .expect("close should arrive in time")
            .expect("socket should yield the close frame")
            .expect("websocket message should be valid");
        match message {
            Message::Close(Some(frame)) => {
                return (u16::from(frame.code), frame.reason.as_str().to_owned());
            }
            Message::Close(None) => panic!("close frame should carry a reason"),
            _ => {}
        }
    }
}

async fn connect_ready(addr: SocketAddr, grant: &SessionGrant) -> Socket {
    let mut socket = connect(addr, grant).await;
    let ready = next_text_event(&mut socket).await;
    assert_eq!(ready["t"], "ready");
    assert_eq!(ready["d"]["user_id"], grant.session.user_id.get());
    assert_eq!(
        ready["d"]["session_id"],
        grant.session.session_id.to_string()
    );
    socket
}

#[tokio::test]
async fn gateway_acks_heartbeats_and_delivers_user_events() {
    let (state, addr, server) = spawn_server(AppConfig::default()).await;
    let grant = state
        .open_session(user(1))
        .await
        .expect("session should open");
    let mut socket = connect_ready(addr, &grant).await;

    socket
        .send(Message::Text(
            json!({"v": 1, "t": "heartbeat", "d": {}}).to_string().into(),
        ))
        .await
        .expect("heartbeat should send");
    let ack = next_text_event(&mut socket).await;
    assert_eq!(ack["t"], "heartbeat_ack");

    let delivered = state
        .broadcast_to_user(user(1), "account_update", json!({"field": "password"}))
        .await
        .expect("broadcast should succeed");
    assert_eq!(delivered, 1);
    let update = next_text_event(&mut socket).await;
    assert_eq!(update["t"], "account_update");
    assert_eq!(update["d"]["field"], "password");

    socket.close(None).await.expect("socket should close");
    server.abort();
}

#[tokio::test]
async fn gateway_rejects_missing_or_unknown_tokens() {
    let (state, addr, server) = spawn_server(AppConfig::default()).await;

    for url in [
        format!("ws://{addr}/gateway"),
        format!("ws://{addr}/gateway?session_token=not-a-session.secret"),
    ] {
        let request = url
            .into_client_request()
            .expect("websocket request should build");
        let Err(tokio_tungstenite::tungstenite::Error::Http(response)) =
            connect_async(request).await
        else {
            panic!("handshake without a valid session should fail with http status");
        };
        assert_eq!(response.status().as_u16(), 401);
    }
    assert!(state.active_sessions(user(1)).await.is_empty());
    server.abort();
}

#[tokio::test]
async fn unknown_client_event_closes_with_policy_violation() {
    let (state, addr, server) = spawn_server(AppConfig::default()).await;
    let grant = state.open_session(user(2)).await.unwrap();
    let mut socket = connect_ready(addr, &grant).await;

    socket
        .send(Message::Text(
            json!({"v": 1, "t": "subscribe", "d": {}}).to_string().into(),
        ))
        .await
        .unwrap();
    assert_eq!(
        next_close(&mut socket).await,
        (1008, String::from("unknown_event"))
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(state.active_sessions(user(2)).await.is_empty());
    server.abort();
}

#[tokio::test]
async fn malformed_envelope_closes_with_policy_violation() {
    let (state, addr, server) = spawn_server(AppConfig::default()).await;
    let grant = state.open_session(user(6)).await.unwrap();
    let mut socket = connect_ready(addr, &grant).await;

    socket
        .send(Message::Text(String::from("{not json").into()))
        .await
        .unwrap();
    assert_eq!(
        next_close(&mut socket).await,
        (1008, String::from("invalid_envelope"))
    );
    server.abort();
}

#[tokio::test]
async fn revoked_session_is_closed_and_cannot_reconnect() {
    let (state, addr, server) = spawn_server(AppConfig::default()).await;
    let grant = state.open_session(user(3)).await.unwrap();
    let mut socket = connect_ready(addr, &grant).await;

    state
        .revoke_session(grant.session)
        .await
        .expect("revoke should succeed");
    assert_eq!(
        next_close(&mut socket).await,
        (1008, String::from("session_revoked"))
    );

    let url = format!("ws://{addr}/gateway?session_token={}", grant.session_token);
    let retry = connect_async(url.into_client_request().unwrap()).await;
    assert!(retry.is_err());
    server.abort();
}

#[tokio::test]
async fn session_cap_evicts_the_oldest_connection() {
    let config = AppConfig {
        max_sessions_per_user: 1,
        ..AppConfig::default()
    };
    let (state, addr, server) = spawn_server(config).await;
    let first = state.open_session(user(4)).await.unwrap();
    let second = state.open_session(user(4)).await.unwrap();

    let mut first_socket = connect_ready(addr, &first).await;
    let mut second_socket = connect_ready(addr, &second).await;

    assert_eq!(
        next_close(&mut first_socket).await,
        (1008, String::from("session_evicted"))
    );
    assert_eq!(state.active_sessions(user(4)).await, vec![second.session]);
    assert!(state.authenticate_session(&first.session_token).await.is_err());

    let delivered = state
        .broadcast_to_user(user(4), "account_update", json!({}))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(next_text_event(&mut second_socket).await["t"], "account_update");

    second_socket.close(None).await.unwrap();
    server.abort();
}

#[tokio::test]
async fn refresh_and_logout_over_http_close_the_gateway() {
    let config = AppConfig::default();
    let (state, addr, server) = spawn_server(config.clone()).await;
    let grant = state.open_session(user(5)).await.unwrap();
    let mut socket = connect_ready(addr, &grant).await;
    let app = build_router_with_state(&config, state.clone()).expect("router should build");

    let refreshed = app
        .clone()
        .oneshot(post_json(
            "/sessions/refresh",
            &json!({"session_token": grant.session_token}),
        ))
        .await
        .expect("refresh request should execute");
    assert_eq!(refreshed.status(), StatusCode::OK);
    let refreshed: Value = parse_json_body(refreshed).await;
    let rotated = refreshed["session_token"]
        .as_str()
        .expect("refresh should return a token")
        .to_owned();
    assert_ne!(rotated, grant.session_token);

    let logout = app
        .oneshot(post_json(
            "/sessions/logout",
            &json!({"session_token": rotated}),
        ))
        .await
        .expect("logout request should execute");
    assert_eq!(logout.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        next_close(&mut socket).await,
        (1008, String::from("session_revoked"))
    );
    server.abort();
}
