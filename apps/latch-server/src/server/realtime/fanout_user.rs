use tokio::sync::mpsc;
use uuid::Uuid;

use super::connection_registry::ConnectionHandle;
use crate::server::metrics::{
    record_gateway_event_dropped, record_gateway_event_emitted, GATEWAY_DROP_REASON_CLOSED,
    GATEWAY_DROP_REASON_FULL_QUEUE, GATEWAY_DROP_REASON_OVERSIZED_OUTBOUND,
};

pub(crate) fn dispatch_user_payload(
    handles: &[ConnectionHandle],
    payload: &str,
    max_payload_bytes: usize,
    event_type: &str,
    closed_connections: &mut Vec<Uuid>,
    slow_connections: &mut Vec<Uuid>,
) -> usize {
    if payload.len() > max_payload_bytes {
        record_gateway_event_dropped("user", event_type, GATEWAY_DROP_REASON_OVERSIZED_OUTBOUND);
        return 0;
    }

    let mut delivered = 0usize;
    for handle in handles {
        match handle.outbound().try_send(payload.to_owned()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped("user", event_type, GATEWAY_DROP_REASON_CLOSED);
                closed_connections.push(handle.connection_id());
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped("user", event_type, GATEWAY_DROP_REASON_FULL_QUEUE);
                slow_connections.push(handle.connection_id());
            }
        }
    }

    delivered
}

pub(crate) fn emit_gateway_delivery_metrics(
    scope: &'static str,
    event_type: &str,
    delivered: usize,
) -> usize {
    if delivered == 0 {
        return 0;
    }

    tracing::debug!(
        event = "gateway.event.emit",
        scope,
        event_type,
        delivered
    );
    for _ in 0..delivered {
        record_gateway_event_emitted(scope, event_type);
    }

    delivered
}
