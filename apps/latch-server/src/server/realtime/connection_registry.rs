use std::sync::Arc;

use latch_core::{Session, UserId};
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use super::{
    connection_control::signal_close,
    fanout_user::{dispatch_user_payload, emit_gateway_delivery_metrics},
    registry_index::RegistryIndex,
};
use crate::server::{
    core::{CloseReason, ConnectionControl},
    gateway_events::GatewayEvent,
    metrics::record_session_evicted,
};

/// Write side of one live gateway connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: Uuid,
    outbound: mpsc::Sender<String>,
    control: watch::Sender<ConnectionControl>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(outbound: mpsc::Sender<String>, control: watch::Sender<ConnectionControl>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            outbound,
            control,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub(crate) fn outbound(&self) -> &mpsc::Sender<String> {
        &self.outbound
    }

    pub(crate) fn close(&self, reason: CloseReason) {
        let _ = self.control.send(ConnectionControl::Close(reason));
    }
}

#[derive(Clone)]
pub(crate) struct ConnectionRegistry {
    index: Arc<Mutex<RegistryIndex>>,
    max_sessions: usize,
}

impl ConnectionRegistry {
    pub(crate) fn new(max_sessions: usize) -> Self {
        Self {
            index: Arc::new(Mutex::new(RegistryIndex::default())),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Register `session` on `handle`, evicting the user's oldest sessions
    /// while at capacity. Returns the evicted sessions.
    pub(crate) async fn register(&self, session: Session, handle: ConnectionHandle) -> Vec<Session> {
        let displaced = {
            let mut index = self.index.lock().await;
            index.insert(session, handle, self.max_sessions)
        };

        if let Some(replaced) = displaced.replaced {
            record_session_evicted("replaced");
            replaced.close(CloseReason::SessionReplaced);
        }

        let mut evicted = Vec::with_capacity(displaced.evicted.len());
        for (evicted_session, evicted_handle) in displaced.evicted {
            record_session_evicted("capacity_exceeded");
            tracing::info!(
                event = "registry.evict",
                user_id = evicted_session.user_id.get(),
                session_id = %evicted_session.session_id,
                reason = "capacity_exceeded"
            );
            evicted_handle.close(CloseReason::SessionEvicted);
            evicted.push(evicted_session);
        }
        evicted
    }

    pub(crate) async fn find_sessions_by_user(&self, user_id: UserId) -> Vec<Session> {
        self.index.lock().await.sessions_for_user(user_id)
    }

    pub(crate) async fn find_user_by_connection(&self, connection_id: Uuid) -> Option<UserId> {
        self.index.lock().await.user_for_connection(connection_id)
    }

    pub(crate) async fn remove_by_connection(&self, connection_id: Uuid) -> Option<Session> {
        self.index.lock().await.remove_by_connection(connection_id)
    }

    /// Drop `session` from the registry and signal its connection to close.
    pub(crate) async fn evict_session(&self, session: Session, reason: CloseReason) -> bool {
        let removed = self.index.lock().await.remove_session(session);
        let Some(handle) = removed else {
            return false;
        };
        record_session_evicted(reason.as_str());
        handle.close(reason);
        true
    }

    /// Best-effort delivery of `event` to every connection of `user_id`.
    pub(crate) async fn emit(
        &self,
        user_id: UserId,
        event: &GatewayEvent,
        max_payload_bytes: usize,
    ) -> usize {
        let handles = self.index.lock().await.handles_for_user(user_id);
        if handles.is_empty() {
            return 0;
        }

        let mut closed = Vec::new();
        let mut slow = Vec::new();
        let delivered = dispatch_user_payload(
            &handles,
            &event.payload,
            max_payload_bytes,
            &event.event_type,
            &mut closed,
            &mut slow,
        );

        if !closed.is_empty() {
            let mut index = self.index.lock().await;
            for connection_id in &closed {
                index.remove_by_connection(*connection_id);
            }
        }
        signal_close(&handles, &slow, CloseReason::SlowConsumer);

        emit_gateway_delivery_metrics("user", &event.event_type, delivered)
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.index.lock().await.len()
    }
}
