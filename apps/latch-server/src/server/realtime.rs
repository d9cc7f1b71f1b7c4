use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use latch_core::Session;
use latch_protocol::{parse_envelope, HEARTBEAT_EVENT};
use tokio::sync::{mpsc, oneshot, watch};

mod connection_control;
pub(crate) mod connection_registry;
mod connection_runtime;
mod fanout_user;
mod registry_index;

pub use connection_registry::ConnectionHandle;

use super::{
    auth::bearer_token,
    core::{AppState, ConnectionControl, GATEWAY_PING_INTERVAL_SECS},
    errors::AuthFailure,
    gateway_events::{self, GatewayEvent},
    metrics::{record_gateway_event_dropped, record_gateway_event_emitted, record_ws_disconnect},
    types::GatewayAuthQuery,
};

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_FLUSH_GRACE: Duration = Duration::from_secs(1);

pub(crate) async fn gateway_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayAuthQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AuthFailure> {
    let token = query
        .session_token
        .or_else(|| bearer_token(&headers).map(ToOwned::to_owned))
        .ok_or(AuthFailure::Unauthorized)?;
    let session = state.authenticate_session(&token).await?;

    let max_message_size = state.runtime.max_gateway_event_bytes;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            handle_gateway_connection(state, socket, session).await;
        }))
}

fn enqueue_connection_event(outbound_tx: &mpsc::Sender<String>, event: GatewayEvent) -> bool {
    if outbound_tx.try_send(event.payload).is_err() {
        record_gateway_event_dropped("connection", &event.event_type, "full_queue");
        return false;
    }
    record_gateway_event_emitted("connection", &event.event_type);
    true
}

pub(crate) async fn handle_gateway_connection(state: AppState, socket: WebSocket, session: Session) {
    let (mut sink, mut stream) = socket.split();

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.gateway_outbound_queue);
    let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);
    let mut reader_control = control_rx.clone();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<Option<&'static str>>();
    let handle = ConnectionHandle::new(outbound_tx.clone(), control_tx);
    let connection_id = handle.connection_id();
    state.on_connection_established(session, handle).await;
    tracing::info!(
        event = "gateway.connect",
        user_id = session.user_id.get(),
        session_id = %session.session_id,
        %connection_id
    );

    if let Ok(ready) = gateway_events::ready(session) {
        enqueue_connection_event(&outbound_tx, ready);
    }

    let mut send_task = tokio::spawn(async move {
        let mut ping_interval =
            tokio::time::interval(Duration::from_secs(GATEWAY_PING_INTERVAL_SECS));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut control_open = true;

        loop {
            tokio::select! {
                biased;

                shutdown = &mut shutdown_rx => {
                    if let Ok(Some(reason)) = shutdown {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_POLICY_VIOLATION,
                                reason: reason.into(),
                            })))
                            .await;
                    }
                    break;
                }
                control_change = control_rx.changed(), if control_open => {
                    if control_change.is_err() {
                        control_open = false;
                        continue;
                    }
                    let control = *control_rx.borrow_and_update();
                    if let ConnectionControl::Close(reason) = control {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_POLICY_VIOLATION,
                                reason: reason.as_str().into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut disconnect_reason = "connection_closed";
    let mut send_close = false;
    loop {
        let incoming = tokio::select! {
            incoming = stream.next() => incoming,
            control_change = reader_control.changed() => {
                if control_change.is_err() {
                    disconnect_reason = "connection_dropped";
                    break;
                }
                if let ConnectionControl::Close(reason) = *reader_control.borrow_and_update() {
                    disconnect_reason = reason.as_str();
                    send_close = true;
                    break;
                }
                continue;
            }
        };
        let message = match incoming {
            Some(Ok(message)) => message,
            Some(Err(_)) => {
                disconnect_reason = "socket_error";
                break;
            }
            None => break,
        };

        let payload: Vec<u8> = match message {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(bytes) => bytes.to_vec(),
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if payload.len() > state.runtime.max_gateway_event_bytes {
            disconnect_reason = "event_too_large";
            send_close = true;
            break;
        }

        let Ok(envelope) = parse_envelope(&payload) else {
            disconnect_reason = "invalid_envelope";
            send_close = true;
            break;
        };

        if envelope.t.as_str() == HEARTBEAT_EVENT {
            let Ok(ack) = gateway_events::heartbeat_ack() else {
                disconnect_reason = "internal_error";
                break;
            };
            if !enqueue_connection_event(&outbound_tx, ack) {
                disconnect_reason = "outbound_queue_full";
                send_close = true;
                break;
            }
        } else {
            tracing::debug!(
                event = "gateway.ingress",
                outcome = "unknown_event",
                event_type = envelope.t.as_str()
            );
            disconnect_reason = "unknown_event";
            send_close = true;
            break;
        }
    }

    record_ws_disconnect(disconnect_reason);
    // The registry entry keeps the writer's channels open until the close
    // frame is flushed.
    let _ = shutdown_tx.send(send_close.then_some(disconnect_reason));
    if tokio::time::timeout(CLOSE_FLUSH_GRACE, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    drop(outbound_tx);
    state.on_connection_closed(connection_id).await;
    tracing::info!(
        event = "gateway.disconnect",
        user_id = session.user_id.get(),
        %connection_id,
        reason = disconnect_reason
    );
}
