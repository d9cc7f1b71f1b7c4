use latch_core::{ActionKind, EmailAddress, UserId};

use crate::server::notifier::OutboundMessage;

struct Template {
    route: &'static str,
    subject: &'static str,
    link_label: &'static str,
}

const fn template(kind: ActionKind) -> Template {
    match kind {
        ActionKind::ConfirmEmail => Template {
            route: "confirm-email",
            subject: "Confirm email",
            link_label: "Verify",
        },
        ActionKind::ResetPassword => Template {
            route: "reset-password",
            subject: "Reset password",
            link_label: "Reset",
        },
        ActionKind::ChangeEmail => Template {
            route: "change-email",
            subject: "Confirm new email",
            link_label: "Confirm",
        },
    }
}

pub(crate) fn challenge_link(base_url: &str, kind: ActionKind, user_id: UserId, token: &str) -> String {
    format!(
        "{base_url}/email/{}?id={user_id}&token={token}",
        template(kind).route
    )
}

pub(crate) fn render_challenge(
    kind: ActionKind,
    to: EmailAddress,
    link: &str,
    valid_hours: u64,
) -> OutboundMessage {
    let template = template(kind);
    let href = link.replace('&', "&amp;");
    OutboundMessage {
        to,
        subject: template.subject.to_owned(),
        text: format!("Link is valid for {valid_hours} hours. {link}"),
        html: format!(
            "<h1>{}</h1><p>Link is valid for {valid_hours} hours.</p><p><a href=\"{href}\">{}</a></p>",
            template.subject, template.link_label
        ),
    }
}

#[cfg(test)]
mod tests {
    use latch_core::{ActionKind, EmailAddress, UserId};

    use super::{challenge_link, render_challenge};

    #[test]
    fn link_targets_action_route_with_user_and_token() {
        let link = challenge_link(
            "https://chat.example.com",
            ActionKind::ResetPassword,
            UserId::try_from(42).unwrap(),
            "abc_DEF-123",
        );
        assert_eq!(
            link,
            "https://chat.example.com/email/reset-password?id=42&token=abc_DEF-123"
        );
    }

    #[test]
    fn rendered_message_carries_link_and_validity_window() {
        let to = EmailAddress::try_from(String::from("user@example.com")).unwrap();
        let link = "http://localhost/email/change-email?id=1&token=t";
        let message = render_challenge(ActionKind::ChangeEmail, to.clone(), link, 24);

        assert_eq!(message.to, to);
        assert_eq!(message.subject, "Confirm new email");
        assert_eq!(message.text, format!("Link is valid for 24 hours. {link}"));
        assert!(message.html.contains("<h1>Confirm new email</h1>"));
        assert!(message
            .html
            .contains("href=\"http://localhost/email/change-email?id=1&amp;token=t\">Confirm</a>"));
    }

    #[test]
    fn subjects_follow_action() {
        let to = EmailAddress::try_from(String::from("user@example.com")).unwrap();
        let subjects: Vec<String> = ActionKind::ALL
            .into_iter()
            .map(|kind| render_challenge(kind, to.clone(), "link", 1).subject)
            .collect();
        assert_eq!(subjects, vec!["Confirm email", "Reset password", "Confirm new email"]);
    }
}
