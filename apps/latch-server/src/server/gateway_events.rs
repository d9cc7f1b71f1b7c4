use latch_core::Session;
use latch_protocol::{encode_envelope, ProtocolError, HEARTBEAT_ACK_EVENT, READY_EVENT};
use serde::Serialize;

#[derive(Debug, Clone)]
pub(crate) struct GatewayEvent {
    pub(crate) event_type: String,
    pub(crate) payload: String,
}

pub(crate) fn build_event<T: Serialize>(
    event_type: &str,
    payload: T,
) -> Result<GatewayEvent, ProtocolError> {
    Ok(GatewayEvent {
        event_type: event_type.to_owned(),
        payload: encode_envelope(event_type, payload)?,
    })
}

#[derive(Serialize)]
struct ReadyPayload {
    user_id: i64,
    session_id: String,
}

#[derive(Serialize)]
struct HeartbeatAckPayload {}

pub(crate) fn ready(session: Session) -> Result<GatewayEvent, ProtocolError> {
    build_event(
        READY_EVENT,
        ReadyPayload {
            user_id: session.user_id.get(),
            session_id: session.session_id.to_string(),
        },
    )
}

pub(crate) fn heartbeat_ack() -> Result<GatewayEvent, ProtocolError> {
    build_event(HEARTBEAT_ACK_EVENT, HeartbeatAckPayload {})
}
