use latch_core::{ActionKind, EmailAddress, UserId};

use crate::server::{core::AppState, errors::AuthFailure};

impl AppState {
    /// # Errors
    /// Returns a store failure, or [`AuthFailure::NotificationDeliveryFailed`]
    /// after the token was stored.
    pub async fn send_confirm_email(
        &self,
        user_id: UserId,
        address: EmailAddress,
    ) -> Result<(), AuthFailure> {
        self.send_challenge(user_id, ActionKind::ConfirmEmail, address, None)
            .await
    }

    /// # Errors
    /// Returns [`AuthFailure::InvalidOrExpiredToken`] for an absent or wrong token.
    pub async fn confirm_email(&self, user_id: UserId, token: &str) -> Result<(), AuthFailure> {
        self.tokens
            .verify_action_token(user_id, ActionKind::ConfirmEmail, token)
            .await?;
        self.complete_challenge(user_id, ActionKind::ConfirmEmail, Ok(()))
            .await
    }

    /// An outstanding confirm-email challenge means the address is still
    /// unconfirmed.
    ///
    /// # Errors
    /// Returns [`AuthFailure::EmailNotConfirmed`] while that challenge exists.
    pub async fn assert_email_confirmed(&self, user_id: UserId) -> Result<(), AuthFailure> {
        if self
            .tokens
            .has_outstanding_token(user_id, ActionKind::ConfirmEmail)
            .await?
        {
            return Err(AuthFailure::EmailNotConfirmed);
        }
        Ok(())
    }
}
