use latch_core::{Session, UserId};
use serde::Serialize;
use uuid::Uuid;

use super::connection_registry::ConnectionHandle;
use crate::server::{
    core::{AppState, CloseReason},
    errors::AuthFailure,
    gateway_events::build_event,
    token_service::{Rotation, SessionGrant},
};

impl AppState {
    /// Issue a session for a user whose email is confirmed.
    ///
    /// # Errors
    /// Returns [`AuthFailure::EmailNotConfirmed`] while a confirm-email
    /// challenge is outstanding, or a store failure.
    pub async fn open_session(&self, user_id: UserId) -> Result<SessionGrant, AuthFailure> {
        self.assert_email_confirmed(user_id).await?;
        let grant = self.tokens.create_session(user_id).await?;
        tracing::info!(
            event = "session.open",
            user_id = user_id.get(),
            session_id = %grant.session.session_id
        );
        Ok(grant)
    }

    /// Resolve a presented session token to its live session.
    ///
    /// # Errors
    /// Returns [`AuthFailure::Unauthorized`] for unknown, revoked, or stale tokens.
    pub async fn authenticate_session(&self, session_token: &str) -> Result<Session, AuthFailure> {
        self.tokens.validate_session_token(session_token).await
    }

    /// Rotate a session secret.
    ///
    /// # Errors
    /// Returns [`AuthFailure::Unauthorized`] for unknown tokens. Replaying a
    /// rotated secret revokes the session and closes its connection.
    pub async fn refresh_session(&self, session_token: &str) -> Result<SessionGrant, AuthFailure> {
        match self.tokens.rotate_session(session_token).await? {
            Rotation::Rotated(grant) => {
                tracing::info!(
                    event = "session.refresh",
                    outcome = "rotated",
                    user_id = grant.session.user_id.get()
                );
                Ok(grant)
            }
            Rotation::ReplayRevoked(session) => {
                tracing::warn!(
                    event = "session.refresh",
                    outcome = "replay_detected",
                    user_id = session.user_id.get(),
                    session_id = %session.session_id
                );
                self.registry
                    .evict_session(session, CloseReason::SessionRevoked)
                    .await;
                Err(AuthFailure::Unauthorized)
            }
        }
    }

    /// # Errors
    /// Returns [`AuthFailure::Unauthorized`] for unknown tokens or a store failure.
    pub async fn logout_session(&self, session_token: &str) -> Result<(), AuthFailure> {
        let session = self.tokens.validate_session_token(session_token).await?;
        self.revoke_session(session).await
    }

    /// Delete the session record and force-close its live connection, if any.
    ///
    /// # Errors
    /// Returns a store failure when the record cannot be deleted; the
    /// connection is left registered in that case.
    pub async fn revoke_session(&self, session: Session) -> Result<(), AuthFailure> {
        self.tokens
            .revoke_session_record(session.session_id)
            .await?;
        let closed = self
            .registry
            .evict_session(session, CloseReason::SessionRevoked)
            .await;
        tracing::info!(
            event = "session.revoke",
            user_id = session.user_id.get(),
            session_id = %session.session_id,
            connection_closed = closed
        );
        Ok(())
    }

    /// Register a live connection for `session`. Sessions displaced by the
    /// per-user cap are closed and their records revoked.
    ///
    /// The session record is checked again once registered, so a revoke that
    /// raced the upgrade still closes the connection.
    pub async fn on_connection_established(
        &self,
        session: Session,
        handle: ConnectionHandle,
    ) -> Vec<Session> {
        let evicted = self.registry.register(session, handle).await;
        match self.tokens.session_is_live(session).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    event = "registry.register",
                    session_id = %session.session_id,
                    outcome = "revoked_before_register"
                );
                self.registry
                    .evict_session(session, CloseReason::SessionRevoked)
                    .await;
            }
            Err(error) => {
                tracing::warn!(
                    event = "registry.register",
                    session_id = %session.session_id,
                    outcome = "liveness_check_failed",
                    error = %error
                );
                self.registry
                    .evict_session(session, CloseReason::SessionRevoked)
                    .await;
            }
        }
        for evicted_session in &evicted {
            if let Err(error) = self
                .tokens
                .revoke_session_record(evicted_session.session_id)
                .await
            {
                tracing::warn!(
                    event = "registry.evict",
                    session_id = %evicted_session.session_id,
                    outcome = "record_revoke_failed",
                    error = %error
                );
            }
        }
        evicted
    }

    /// Bookkeeping for a connection that ended on its own.
    pub async fn on_connection_closed(&self, connection_id: Uuid) -> Option<Session> {
        self.registry.remove_by_connection(connection_id).await
    }

    pub async fn active_sessions(&self, user_id: UserId) -> Vec<Session> {
        self.registry.find_sessions_by_user(user_id).await
    }

    pub async fn user_for_connection(&self, connection_id: Uuid) -> Option<UserId> {
        self.registry.find_user_by_connection(connection_id).await
    }

    /// Send one event to every live connection of `user_id`; returns how many
    /// connections accepted it.
    ///
    /// # Errors
    /// Returns [`AuthFailure::InvalidRequest`] for an event name outside the
    /// protocol allowlist or an unserializable payload.
    pub async fn broadcast_to_user<T: Serialize>(
        &self,
        user_id: UserId,
        event_name: &str,
        payload: T,
    ) -> Result<usize, AuthFailure> {
        let event = build_event(event_name, payload).map_err(|_| AuthFailure::InvalidRequest)?;
        Ok(self
            .registry
            .emit(user_id, &event, self.runtime.max_gateway_event_bytes)
            .await)
    }
}
