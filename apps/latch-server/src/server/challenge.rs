use latch_core::{ActionKind, EmailAddress, UserId};

mod change_email;
mod confirm_email;
mod message;
mod reset_password;

use message::{challenge_link, render_challenge};

use super::{
    core::AppState,
    errors::AuthFailure,
    metrics::{record_challenge_issued, record_challenge_verification},
};

impl AppState {
    /// Issue a fresh challenge for `(user_id, kind)` and deliver its link to `to`.
    ///
    /// A delivery failure is reported but the issued token stays valid.
    async fn send_challenge(
        &self,
        user_id: UserId,
        kind: ActionKind,
        to: EmailAddress,
        new_address: Option<EmailAddress>,
    ) -> Result<(), AuthFailure> {
        let token = self
            .tokens
            .issue_action_token(user_id, kind, new_address)
            .await?;
        record_challenge_issued(kind.as_str());

        let link = challenge_link(&self.runtime.link_base_url, kind, user_id, &token);
        let message = render_challenge(kind, to, &link, self.runtime.challenge_ttl_hours);
        if let Err(error) = self.mailer.send(&message).await {
            tracing::warn!(
                event = "challenge.send",
                action = kind.as_str(),
                user_id = user_id.get(),
                outcome = "delivery_failed",
                error = %error
            );
            return Err(AuthFailure::NotificationDeliveryFailed);
        }

        tracing::info!(
            event = "challenge.send",
            action = kind.as_str(),
            user_id = user_id.get(),
            outcome = "sent"
        );
        Ok(())
    }

    /// Delete a verified challenge once the caller's mutation has landed.
    async fn complete_challenge(
        &self,
        user_id: UserId,
        kind: ActionKind,
        mutation: Result<(), AuthFailure>,
    ) -> Result<(), AuthFailure> {
        if let Err(failure) = mutation {
            record_challenge_verification(kind.as_str(), "mutation_failed");
            tracing::warn!(
                event = "challenge.verify",
                action = kind.as_str(),
                user_id = user_id.get(),
                outcome = "mutation_failed",
                error = %failure
            );
            return Err(failure);
        }

        self.tokens.consume_action_token(user_id, kind).await?;
        record_challenge_verification(kind.as_str(), "consumed");
        tracing::info!(
            event = "challenge.verify",
            action = kind.as_str(),
            user_id = user_id.get(),
            outcome = "consumed"
        );
        Ok(())
    }
}
