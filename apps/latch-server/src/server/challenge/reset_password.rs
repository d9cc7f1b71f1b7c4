use latch_core::{ActionKind, EmailAddress, UserId};

use crate::server::{auth::validate_password, core::AppState, errors::AuthFailure};

impl AppState {
    /// # Errors
    /// Returns a store failure, or [`AuthFailure::NotificationDeliveryFailed`]
    /// after the token was stored.
    pub async fn send_reset_password(
        &self,
        user_id: UserId,
        address: EmailAddress,
    ) -> Result<(), AuthFailure> {
        self.send_challenge(user_id, ActionKind::ResetPassword, address, None)
            .await
    }

    /// # Errors
    /// Returns [`AuthFailure::InvalidRequest`] for an out-of-bounds password,
    /// [`AuthFailure::InvalidOrExpiredToken`] for a bad token, and
    /// [`AuthFailure::UserNotFound`] when the user is gone. The token is only
    /// consumed once the new password is stored.
    pub async fn reset_password(
        &self,
        user_id: UserId,
        token: &str,
        new_password: &str,
    ) -> Result<(), AuthFailure> {
        validate_password(new_password)?;
        self.tokens
            .verify_action_token(user_id, ActionKind::ResetPassword, token)
            .await?;
        let mutation = self.users.set_password(user_id, new_password).await;
        self.complete_challenge(user_id, ActionKind::ResetPassword, mutation)
            .await
    }
}
