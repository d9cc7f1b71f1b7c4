use latch_core::{ActionKind, EmailAddress, UserId};

use crate::server::{core::AppState, errors::AuthFailure};

impl AppState {
    /// Send the confirmation link to the pending address, not the current one.
    ///
    /// # Errors
    /// Returns a store failure, or [`AuthFailure::NotificationDeliveryFailed`]
    /// after the token was stored.
    pub async fn send_change_email(
        &self,
        user_id: UserId,
        new_address: EmailAddress,
    ) -> Result<(), AuthFailure> {
        self.send_challenge(
            user_id,
            ActionKind::ChangeEmail,
            new_address.clone(),
            Some(new_address),
        )
        .await
    }

    /// # Errors
    /// Returns [`AuthFailure::InvalidOrExpiredToken`] for a bad token and
    /// [`AuthFailure::UserNotFound`] when the user is gone.
    pub async fn confirm_change_email(&self, user_id: UserId, token: &str) -> Result<(), AuthFailure> {
        let pending = self
            .tokens
            .verify_action_token(user_id, ActionKind::ChangeEmail, token)
            .await?;
        let Some(new_address) = pending else {
            tracing::error!(
                event = "challenge.verify",
                action = ActionKind::ChangeEmail.as_str(),
                user_id = user_id.get(),
                outcome = "missing_pending_address"
            );
            return Err(AuthFailure::Internal);
        };
        let mutation = self.users.set_email_address(user_id, &new_address).await;
        self.complete_challenge(user_id, ActionKind::ChangeEmail, mutation)
            .await
    }
}
