use std::{sync::Arc, time::Duration};

use latch_core::{ActionKind, EmailAddress, Session, SessionId, UserId};
use serde::{Deserialize, Serialize};

use super::{
    auth::{
        format_session_token, generate_secret, hash_secret, now_unix, parse_session_token,
        validate_supplied_token,
    },
    errors::AuthFailure,
    metrics::record_challenge_verification,
    token_store::{challenge_key, session_key, EphemeralStore, StoreError, TokenStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenCheckError {
    Absent,
    Mismatch,
}

impl TokenCheckError {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Mismatch => "mismatch",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredChallenge {
    token_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    new_address: Option<EmailAddress>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    user_id: UserId,
    secret_hash: String,
    issued_at_unix: i64,
}

/// Credentials handed to a client when a session is opened or rotated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub session: Session,
    pub session_token: String,
    pub expires_in: Duration,
}

#[derive(Debug)]
pub(crate) enum Rotation {
    Rotated(SessionGrant),
    /// A superseded secret was presented; the session record is gone.
    ReplayRevoked(Session),
}

#[derive(Clone)]
pub(crate) struct TokenService {
    store: Arc<TokenStore>,
    challenge_ttl: Duration,
    session_ttl: Duration,
}

fn encode<T: Serialize>(value: &T) -> Result<String, AuthFailure> {
    serde_json::to_string(value).map_err(|_| AuthFailure::Internal)
}

fn decode<'a, T: Deserialize<'a>>(key: &str, raw: &'a str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(format!("{key}: {e}")))
}

impl TokenService {
    pub(crate) fn new(store: TokenStore, challenge_ttl: Duration, session_ttl: Duration) -> Self {
        Self {
            store: Arc::new(store),
            challenge_ttl,
            session_ttl,
        }
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Store a fresh challenge for `(user_id, kind)`, superseding any prior one.
    pub(crate) async fn issue_action_token(
        &self,
        user_id: UserId,
        kind: ActionKind,
        new_address: Option<EmailAddress>,
    ) -> Result<String, AuthFailure> {
        let token = generate_secret();
        let value = encode(&StoredChallenge {
            token_hash: hash_secret(&token),
            new_address,
        })?;
        self.store
            .put(&challenge_key(user_id, kind), &value, self.challenge_ttl)
            .await?;
        Ok(token)
    }

    async fn check_action_token(
        &self,
        user_id: UserId,
        kind: ActionKind,
        supplied: &str,
    ) -> Result<Result<Option<EmailAddress>, TokenCheckError>, StoreError> {
        let key = challenge_key(user_id, kind);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(Err(TokenCheckError::Absent));
        };
        let stored: StoredChallenge = decode(&key, &raw)?;
        if stored.token_hash != hash_secret(supplied) {
            return Ok(Err(TokenCheckError::Mismatch));
        }
        Ok(Ok(stored.new_address))
    }

    /// Check `supplied` against the outstanding challenge without consuming it.
    ///
    /// Returns the pending address stored alongside a change-email challenge.
    pub(crate) async fn verify_action_token(
        &self,
        user_id: UserId,
        kind: ActionKind,
        supplied: &str,
    ) -> Result<Option<EmailAddress>, AuthFailure> {
        if validate_supplied_token(supplied).is_err() {
            record_challenge_verification(kind.as_str(), "malformed");
            return Err(AuthFailure::InvalidOrExpiredToken);
        }
        match self.check_action_token(user_id, kind, supplied).await? {
            Ok(new_address) => Ok(new_address),
            Err(check) => {
                record_challenge_verification(kind.as_str(), check.as_str());
                tracing::info!(
                    event = "challenge.verify",
                    action = kind.as_str(),
                    user_id = user_id.get(),
                    outcome = check.as_str()
                );
                Err(AuthFailure::InvalidOrExpiredToken)
            }
        }
    }

    pub(crate) async fn consume_action_token(
        &self,
        user_id: UserId,
        kind: ActionKind,
    ) -> Result<(), AuthFailure> {
        self.store.delete(&challenge_key(user_id, kind)).await?;
        Ok(())
    }

    pub(crate) async fn has_outstanding_token(
        &self,
        user_id: UserId,
        kind: ActionKind,
    ) -> Result<bool, AuthFailure> {
        Ok(self
            .store
            .get(&challenge_key(user_id, kind))
            .await?
            .is_some())
    }

    async fn write_session(&self, session: Session) -> Result<SessionGrant, AuthFailure> {
        let secret = generate_secret();
        let value = encode(&SessionRecord {
            user_id: session.user_id,
            secret_hash: hash_secret(&secret),
            issued_at_unix: now_unix(),
        })?;
        self.store
            .put(&session_key(session.session_id), &value, self.session_ttl)
            .await?;
        Ok(SessionGrant {
            session,
            session_token: format_session_token(session.session_id, &secret),
            expires_in: self.session_ttl,
        })
    }

    async fn load_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>, AuthFailure> {
        let key = session_key(session_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        Ok(Some(decode(&key, &raw)?))
    }

    pub(crate) async fn create_session(&self, user_id: UserId) -> Result<SessionGrant, AuthFailure> {
        self.write_session(Session::new(user_id, SessionId::new()))
            .await
    }

    pub(crate) async fn validate_session_token(&self, token: &str) -> Result<Session, AuthFailure> {
        let (session_id, secret) = parse_session_token(token)?;
        let record = self
            .load_session(session_id)
            .await?
            .ok_or(AuthFailure::Unauthorized)?;
        if record.secret_hash != hash_secret(secret) {
            return Err(AuthFailure::Unauthorized);
        }
        Ok(Session::new(record.user_id, session_id))
    }

    /// Replace the session secret and reset its TTL.
    ///
    /// A well-formed token for a live session whose secret no longer matches
    /// is treated as replay of a rotated credential and revokes the session.
    pub(crate) async fn rotate_session(&self, token: &str) -> Result<Rotation, AuthFailure> {
        let (session_id, secret) = parse_session_token(token)?;
        let record = self
            .load_session(session_id)
            .await?
            .ok_or(AuthFailure::Unauthorized)?;
        let session = Session::new(record.user_id, session_id);
        if record.secret_hash != hash_secret(secret) {
            self.revoke_session_record(session_id).await?;
            return Ok(Rotation::ReplayRevoked(session));
        }
        Ok(Rotation::Rotated(self.write_session(session).await?))
    }

    /// Whether the store still holds a record for `session`.
    pub(crate) async fn session_is_live(&self, session: Session) -> Result<bool, AuthFailure> {
        Ok(self
            .load_session(session.session_id)
            .await?
            .is_some_and(|record| record.user_id == session.user_id))
    }

    pub(crate) async fn revoke_session_record(&self, session_id: SessionId) -> Result<(), AuthFailure> {
        self.store.delete(&session_key(session_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use latch_core::{ActionKind, EmailAddress, UserId};

    use super::{Rotation, TokenService};
    use crate::server::{
        errors::AuthFailure,
        token_store::{challenge_key, EphemeralStore, InMemoryTokenStore, TokenStore},
    };

    fn service() -> TokenService {
        TokenService::new(
            TokenStore::InMemory(InMemoryTokenStore::new()),
            Duration::from_secs(3_600),
            Duration::from_secs(86_400),
        )
    }

    fn user(id: i64) -> UserId {
        UserId::try_from(id).expect("test user id should be positive")
    }

    #[tokio::test]
    async fn verify_leaves_token_until_consumed() {
        let tokens = service();
        let token = tokens
            .issue_action_token(user(1), ActionKind::ConfirmEmail, None)
            .await
            .expect("issue should succeed");

        tokens
            .verify_action_token(user(1), ActionKind::ConfirmEmail, &token)
            .await
            .expect("first verify should succeed");
        tokens
            .verify_action_token(user(1), ActionKind::ConfirmEmail, &token)
            .await
            .expect("verify alone should not consume");

        tokens
            .consume_action_token(user(1), ActionKind::ConfirmEmail)
            .await
            .expect("consume should succeed");
        assert_eq!(
            tokens
                .verify_action_token(user(1), ActionKind::ConfirmEmail, &token)
                .await,
            Err(AuthFailure::InvalidOrExpiredToken)
        );
    }

    #[tokio::test]
    async fn reissue_supersedes_previous_token() {
        let tokens = service();
        let first = tokens
            .issue_action_token(user(2), ActionKind::ResetPassword, None)
            .await
            .unwrap();
        let second = tokens
            .issue_action_token(user(2), ActionKind::ResetPassword, None)
            .await
            .unwrap();

        assert_eq!(
            tokens
                .verify_action_token(user(2), ActionKind::ResetPassword, &first)
                .await,
            Err(AuthFailure::InvalidOrExpiredToken)
        );
        assert!(tokens
            .verify_action_token(user(2), ActionKind::ResetPassword, &second)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn mismatch_and_absent_are_indistinguishable() {
        let tokens = service();
        let absent = tokens
            .verify_action_token(user(3), ActionKind::ChangeEmail, "some-token")
            .await;

        tokens
            .issue_action_token(user(3), ActionKind::ChangeEmail, None)
            .await
            .unwrap();
        let mismatch = tokens
            .verify_action_token(user(3), ActionKind::ChangeEmail, "some-token")
            .await;

        assert_eq!(absent, mismatch);
        assert_eq!(absent, Err(AuthFailure::InvalidOrExpiredToken));
    }

    #[tokio::test]
    async fn action_kinds_do_not_share_tokens() {
        let tokens = service();
        let token = tokens
            .issue_action_token(user(4), ActionKind::ConfirmEmail, None)
            .await
            .unwrap();

        assert!(tokens
            .verify_action_token(user(4), ActionKind::ResetPassword, &token)
            .await
            .is_err());
        assert!(tokens
            .verify_action_token(user(5), ActionKind::ConfirmEmail, &token)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn change_email_challenge_carries_pending_address() {
        let tokens = service();
        let address = EmailAddress::try_from(String::from("new@example.com")).unwrap();
        let token = tokens
            .issue_action_token(user(6), ActionKind::ChangeEmail, Some(address.clone()))
            .await
            .unwrap();

        let pending = tokens
            .verify_action_token(user(6), ActionKind::ChangeEmail, &token)
            .await
            .unwrap();
        assert_eq!(pending, Some(address));
    }

    #[tokio::test]
    async fn stored_value_holds_only_token_hash() {
        let tokens = service();
        let token = tokens
            .issue_action_token(user(7), ActionKind::ConfirmEmail, None)
            .await
            .unwrap();

        let raw = tokens
            .store()
            .get(&challenge_key(user(7), ActionKind::ConfirmEmail))
            .await
            .unwrap()
            .expect("challenge should be stored");
        assert!(!raw.contains(&token));
    }

    #[tokio::test]
    async fn corrupt_challenge_surfaces_internal_error() {
        let tokens = service();
        tokens
            .store()
            .put(
                &challenge_key(user(8), ActionKind::ConfirmEmail),
                "not json",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(
            tokens
                .verify_action_token(user(8), ActionKind::ConfirmEmail, "token")
                .await,
            Err(AuthFailure::Internal)
        );
    }

    #[tokio::test]
    async fn session_tokens_validate_until_revoked() {
        let tokens = service();
        let grant = tokens.create_session(user(9)).await.unwrap();

        let session = tokens
            .validate_session_token(&grant.session_token)
            .await
            .expect("fresh session should validate");
        assert_eq!(session, grant.session);
        assert_eq!(tokens.session_is_live(grant.session).await, Ok(true));
        let foreign = latch_core::Session::new(user(10), grant.session.session_id);
        assert_eq!(tokens.session_is_live(foreign).await, Ok(false));

        tokens
            .revoke_session_record(grant.session.session_id)
            .await
            .unwrap();
        assert_eq!(
            tokens.validate_session_token(&grant.session_token).await,
            Err(AuthFailure::Unauthorized)
        );
        assert_eq!(tokens.session_is_live(grant.session).await, Ok(false));
    }

    #[tokio::test]
    async fn rotation_replaces_secret_and_replay_revokes() {
        let tokens = service();
        let original = tokens.create_session(user(10)).await.unwrap();

        let Rotation::Rotated(rotated) = tokens
            .rotate_session(&original.session_token)
            .await
            .unwrap()
        else {
            panic!("first rotation should succeed");
        };
        assert_eq!(rotated.session, original.session);
        assert_ne!(rotated.session_token, original.session_token);
        assert_eq!(
            tokens.validate_session_token(&original.session_token).await,
            Err(AuthFailure::Unauthorized)
        );

        let replay = tokens.rotate_session(&original.session_token).await.unwrap();
        assert!(matches!(replay, Rotation::ReplayRevoked(session) if session == original.session));
        assert_eq!(
            tokens.validate_session_token(&rotated.session_token).await,
            Err(AuthFailure::Unauthorized)
        );
    }
}
