use std::collections::{HashMap, VecDeque};

use latch_core::{Session, SessionId, UserId};
use uuid::Uuid;

use super::connection_registry::ConnectionHandle;

/// Connections displaced by a single insert.
#[derive(Debug, Default)]
pub(crate) struct Displaced {
    pub(crate) evicted: Vec<(Session, ConnectionHandle)>,
    pub(crate) replaced: Option<ConnectionHandle>,
}

/// Session bookkeeping kept consistent across three maps.
///
/// `by_user` holds each user's session ids ordered oldest registration first.
/// Every session in `by_user` has exactly one entry in `entries`, and every
/// entry's connection id maps back to its session in `by_connection`.
#[derive(Debug, Default)]
pub(crate) struct RegistryIndex {
    by_user: HashMap<UserId, VecDeque<SessionId>>,
    entries: HashMap<Session, ConnectionHandle>,
    by_connection: HashMap<Uuid, Session>,
}

impl RegistryIndex {
    pub(crate) fn insert(
        &mut self,
        session: Session,
        handle: ConnectionHandle,
        max_sessions: usize,
    ) -> Displaced {
        let mut displaced = Displaced::default();

        // A connection owns at most one session.
        if let Some(stale) = self.by_connection.remove(&handle.connection_id()) {
            if stale != session {
                self.entries.remove(&stale);
                self.unlink_session(stale);
            }
        }

        if let Some(previous) = self.entries.remove(&session) {
            self.by_connection.remove(&previous.connection_id());
            self.unlink_session(session);
            if previous.connection_id() != handle.connection_id() {
                displaced.replaced = Some(previous);
            }
        }

        let queue = self.by_user.entry(session.user_id).or_default();
        while queue.len() >= max_sessions.max(1) {
            let Some(oldest) = queue.pop_front() else {
                break;
            };
            let oldest = Session::new(session.user_id, oldest);
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.by_connection.remove(&evicted.connection_id());
                displaced.evicted.push((oldest, evicted));
            }
        }
        queue.push_back(session.session_id);

        self.by_connection.insert(handle.connection_id(), session);
        self.entries.insert(session, handle);
        displaced
    }

    fn unlink_session(&mut self, session: Session) {
        if let Some(queue) = self.by_user.get_mut(&session.user_id) {
            queue.retain(|id| *id != session.session_id);
            if queue.is_empty() {
                self.by_user.remove(&session.user_id);
            }
        }
    }

    pub(crate) fn remove_session(&mut self, session: Session) -> Option<ConnectionHandle> {
        let handle = self.entries.remove(&session)?;
        self.by_connection.remove(&handle.connection_id());
        self.unlink_session(session);
        Some(handle)
    }

    /// Remove the entry owned by `connection_id`. A session that has since
    /// been re-registered on another connection is left alone.
    pub(crate) fn remove_by_connection(&mut self, connection_id: Uuid) -> Option<Session> {
        let session = self.by_connection.remove(&connection_id)?;
        self.entries.remove(&session);
        self.unlink_session(session);
        Some(session)
    }

    pub(crate) fn sessions_for_user(&self, user_id: UserId) -> Vec<Session> {
        self.by_user
            .get(&user_id)
            .map(|queue| {
                queue
                    .iter()
                    .map(|session_id| Session::new(user_id, *session_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn handles_for_user(&self, user_id: UserId) -> Vec<ConnectionHandle> {
        self.sessions_for_user(user_id)
            .into_iter()
            .filter_map(|session| self.entries.get(&session).cloned())
            .collect()
    }

    pub(crate) fn user_for_connection(&self, connection_id: Uuid) -> Option<UserId> {
        self.by_connection
            .get(&connection_id)
            .map(|session| session.user_id)
    }

    pub(crate) fn connection_for_session(&self, session: Session) -> Option<Uuid> {
        self.entries.get(&session).map(ConnectionHandle::connection_id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        debug_assert_eq!(self.entries.len(), self.by_connection.len());
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use latch_core::{Session, SessionId, UserId};
    use tokio::sync::{mpsc, watch};

    use super::RegistryIndex;
    use crate::server::{core::ConnectionControl, realtime::connection_registry::ConnectionHandle};

    fn handle() -> ConnectionHandle {
        let (outbound, _) = mpsc::channel(1);
        let (control, _) = watch::channel(ConnectionControl::Open);
        ConnectionHandle::new(outbound, control)
    }

    fn session(user: i64) -> Session {
        Session::new(UserId::try_from(user).unwrap(), SessionId::new())
    }

    #[test]
    fn evicts_oldest_session_at_capacity() {
        let mut index = RegistryIndex::default();
        let sessions: Vec<Session> = (0..4).map(|_| session(1)).collect();

        for (step, s) in sessions.iter().enumerate() {
            let displaced = index.insert(*s, handle(), 3);
            let expected = (step + 1).min(3);
            assert_eq!(index.sessions_for_user(s.user_id).len(), expected);
            if step == 3 {
                assert_eq!(displaced.evicted.len(), 1);
                assert_eq!(displaced.evicted[0].0, sessions[0]);
            } else {
                assert!(displaced.evicted.is_empty());
            }
        }

        assert_eq!(
            index.sessions_for_user(sessions[0].user_id),
            sessions[1..].to_vec()
        );
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn reregistering_same_session_replaces_connection_without_growing() {
        let mut index = RegistryIndex::default();
        let s = session(2);
        let first = handle();
        let first_id = first.connection_id();
        index.insert(s, first, 3);

        let second = handle();
        let second_id = second.connection_id();
        let displaced = index.insert(s, second, 3);

        assert_eq!(
            displaced.replaced.map(|h| h.connection_id()),
            Some(first_id)
        );
        assert!(displaced.evicted.is_empty());
        assert_eq!(index.sessions_for_user(s.user_id), vec![s]);
        assert_eq!(index.user_for_connection(first_id), None);
        assert_eq!(index.connection_for_session(s), Some(second_id));
    }

    #[test]
    fn stale_connection_removal_leaves_replacement_registered() {
        let mut index = RegistryIndex::default();
        let s = session(3);
        let first = handle();
        let first_id = first.connection_id();
        index.insert(s, first, 3);
        index.insert(s, handle(), 3);

        assert_eq!(index.remove_by_connection(first_id), None);
        assert_eq!(index.sessions_for_user(s.user_id), vec![s]);
    }

    #[test]
    fn removal_by_connection_touches_only_that_entry() {
        let mut index = RegistryIndex::default();
        let keep = session(4);
        let drop_me = session(4);
        let other_user = session(5);
        let target = handle();
        let target_id = target.connection_id();
        index.insert(keep, handle(), 3);
        index.insert(drop_me, target, 3);
        index.insert(other_user, handle(), 3);

        assert_eq!(index.remove_by_connection(target_id), Some(drop_me));
        assert_eq!(index.sessions_for_user(keep.user_id), vec![keep]);
        assert_eq!(index.sessions_for_user(other_user.user_id), vec![other_user]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn moving_a_connection_to_another_session_unlinks_the_first() {
        let mut index = RegistryIndex::default();
        let first = session(7);
        let second = session(7);
        let shared = handle();
        let shared_id = shared.connection_id();
        index.insert(first, shared.clone(), 3);
        let displaced = index.insert(second, shared, 3);

        assert!(displaced.replaced.is_none());
        assert!(displaced.evicted.is_empty());
        assert_eq!(index.sessions_for_user(first.user_id), vec![second]);
        assert_eq!(index.remove_by_connection(shared_id), Some(second));
        assert!(index.sessions_for_user(first.user_id).is_empty());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn remove_session_clears_empty_user_bucket() {
        let mut index = RegistryIndex::default();
        let s = session(6);
        index.insert(s, handle(), 3);

        assert!(index.remove_session(s).is_some());
        assert!(index.remove_session(s).is_none());
        assert!(index.sessions_for_user(s.user_id).is_empty());
        assert!(index.handles_for_user(s.user_id).is_empty());
    }
}
